//! Periodic publish, update and aggregation runs across all sites.

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn, Level};
use uuid::Uuid;

use crate::config::Schedule;
use crate::error::PlanetError;
use crate::registry::SiteRegistry;

/// Run `f` over `items` with at most `limit` in flight; the next item starts
/// as soon as any slot frees.
pub async fn run_bounded<T, F, Fut>(items: Vec<T>, limit: usize, f: F)
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = ()>,
{
    stream::iter(items)
        .for_each_concurrent(limit.max(1), f)
        .await;
}

/// Scheduled failures are absorbed. Transient ones retry on the next tick
/// and only show at debug; unexpected ones are logged for diagnosis.
fn failure_level(err: &PlanetError) -> Level {
    match err {
        PlanetError::Internal(_) => Level::ERROR,
        err if err.is_transient() => Level::DEBUG,
        _ => Level::WARN,
    }
}

fn log_failure(site: Uuid, operation: &str, err: &PlanetError) {
    let level = failure_level(err);
    if level == Level::ERROR {
        error!(?err, site = %site, operation, "scheduled run failed");
    } else if level == Level::DEBUG {
        debug!(?err, site = %site, operation, "scheduled run failed; will retry");
    } else {
        warn!(?err, site = %site, operation, "scheduled run failed");
    }
}

/// Resolves once `shutdown` holds `true` or its sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    registry: Arc<SiteRegistry>,
    schedule: Schedule,
}

impl Scheduler {
    pub fn new(registry: Arc<SiteRegistry>, schedule: Schedule) -> Self {
        Self { registry, schedule }
    }

    fn max_concurrency(&self) -> usize {
        self.registry.services().settings.max_concurrency
    }

    /// Publish every owned site that is not archived. Returns how many
    /// published.
    #[instrument(skip_all)]
    pub async fn publish_all(&self) -> usize {
        let svc = self.registry.services().clone();
        let sites = self.registry.owned().await;
        let published = std::sync::atomic::AtomicUsize::new(0);
        run_bounded(sites, self.max_concurrency(), |site| {
            let svc = svc.clone();
            let published = &published;
            async move {
                if site.snapshot().await.0.archived {
                    return;
                }
                match site.publish(&svc).await {
                    Ok(Some(_)) => {
                        published.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                    Ok(None) => debug!(site = %site.id(), "publish skipped; already running"),
                    Err(err) => log_failure(site.id(), "publish", &err),
                }
            }
        })
        .await;
        published.into_inner()
    }

    /// Update every followed site. Returns how many changed.
    #[instrument(skip_all)]
    pub async fn update_all(&self) -> usize {
        let svc = self.registry.services().clone();
        let sites = self.registry.followed().await;
        let changed = std::sync::atomic::AtomicUsize::new(0);
        run_bounded(sites, self.max_concurrency(), |site| {
            let svc = svc.clone();
            let changed = &changed;
            async move {
                match site.update(&svc).await {
                    Ok(Some(report)) if report.changed => {
                        changed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                    Ok(_) => {}
                    Err(err) => log_failure(site.id(), "update", &err),
                }
            }
        })
        .await;
        changed.into_inner()
    }

    /// Aggregate into every owned site at once. Each site guards itself.
    #[instrument(skip_all)]
    pub async fn aggregate_all(&self) -> usize {
        let svc = self.registry.services().clone();
        let sites = self.registry.owned().await;
        let runs = sites.into_iter().map(|site| {
            let svc = svc.clone();
            async move {
                match site.aggregate(&svc).await {
                    Ok(Some(report)) => report.new,
                    Ok(None) => 0,
                    Err(err) => {
                        log_failure(site.id(), "aggregate", &err);
                        0
                    }
                }
            }
        });
        join_all(runs).await.into_iter().sum()
    }

    /// Drive the publish, update and aggregation loops until `shutdown`
    /// turns true. Each loop has its own interval, so a slow batch in one
    /// never delays the others. A batch still running at shutdown is dropped.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(
            publish_secs = self.schedule.publish_interval_secs,
            update_secs = self.schedule.update_interval_secs,
            aggregate_secs = self.schedule.aggregate_interval_secs,
            "scheduler started"
        );
        tokio::join!(
            drive(self.schedule.publish_interval_secs, shutdown.clone(), move || async move {
                let n = self.publish_all().await;
                debug!(published = n, "publish tick");
            }),
            drive(self.schedule.update_interval_secs, shutdown.clone(), move || async move {
                let n = self.update_all().await;
                debug!(changed = n, "update tick");
            }),
            drive(self.schedule.aggregate_interval_secs, shutdown, move || async move {
                let n = self.aggregate_all().await;
                debug!(new_articles = n, "aggregate tick");
            }),
        );
        info!("scheduler stopped");
    }
}

/// Run `batch` on every tick of a `secs` interval until shutdown.
async fn drive<F, Fut>(secs: u64, mut shutdown: watch::Receiver<bool>, mut batch: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticks = interval(secs);
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = ticks.tick() => {}
        }
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = batch() => {}
        }
    }
}

fn interval(secs: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use planet_sync::scheduler::run_bounded;
use planet_sync::{config, Services, SiteRegistry};

#[derive(Debug, Parser)]
#[command(author, version, about = "Publish every owned site once and exit")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Also publish archived sites
    #[arg(long)]
    include_archived: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("loading {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let services = Arc::new(Services::from_config(&cfg)?);
    let registry = SiteRegistry::load(services.clone()).await?;
    let sites = registry.owned().await;
    info!(sites = sites.len(), "publishing owned sites");

    let published = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let limit = services.settings.max_concurrency;
    run_bounded(sites, limit, |site| {
        let (services, published, failed) = (&services, &published, &failed);
        let include_archived = args.include_archived;
        async move {
            let (record, _) = site.snapshot().await;
            if record.archived && !include_archived {
                info!(site = %site.id(), "skipping archived site");
                return;
            }
            match site.publish(services).await {
                Ok(Some(report)) => {
                    published.fetch_add(1, Ordering::Relaxed);
                    info!(
                        site = %site.id(),
                        name = %record.name(),
                        cid = %report.cid,
                        failures = report.rebuild.failures.len(),
                        "published"
                    );
                }
                Ok(None) => info!(site = %site.id(), "publish already running"),
                Err(err) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    warn!(?err, site = %site.id(), "publish failed");
                }
            }
        }
    })
    .await;
    let (published, failed) = (published.into_inner(), failed.into_inner());

    registry.shutdown().await?;
    info!(published, failed, "done");
    if failed > 0 {
        anyhow::bail!("{failed} site(s) failed to publish");
    }
    Ok(())
}

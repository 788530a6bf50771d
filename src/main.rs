use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use planet_sync::{config, media, Scheduler, Services, SiteRegistry};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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
    cfg.ensure_dirs().context("creating data directories")?;

    if let Err(err) = media::ensure_ffmpeg_available().await {
        error!(?err, "ffmpeg unavailable; image and video derivatives will fail");
    }

    let services = Arc::new(Services::from_config(&cfg)?);
    let registry = Arc::new(SiteRegistry::load(services).await?);
    let scheduler = Scheduler::new(registry.clone(), cfg.schedule.clone());

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(?err, "failed to listen for ctrl-c");
            return;
        }
        info!("shutdown requested");
        let _ = stop_tx.send(true);
    });

    info!(data_dir = %cfg.app.resolved_data_dir().display(), "starting planet daemon");
    scheduler.run(stop_rx).await;

    registry.shutdown().await.context("flushing sites")?;
    info!("bye");
    Ok(())
}

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use planet_sync::{config, Services, SiteRegistry};

#[derive(Debug, Parser)]
#[command(author, version, about = "Export one owned site as a .planet backup bundle")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Id of the owned site to export
    #[arg(long)]
    site: Uuid,

    /// Directory the `{name}.planet` bundle is written into
    #[arg(long, default_value = ".")]
    dest: PathBuf,
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

    let services = Arc::new(Services::from_config(&cfg)?);
    let registry = SiteRegistry::load(services).await?;
    tokio::fs::create_dir_all(&args.dest)
        .await
        .with_context(|| format!("creating {}", args.dest.display()))?;
    let path = registry
        .export_backup(args.site, &args.dest)
        .await
        .with_context(|| format!("exporting site {}", args.site))?;
    info!(path = %path.display(), "backup written");
    println!("{}", path.display());
    Ok(())
}

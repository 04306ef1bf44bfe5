//! recoatd - cache skin patch daemon
//!
//! Usage:
//!   recoatd /path/to/cache/root

use anyhow::{Context, Result};
use recoat_daemon::{run_daemon, DaemonConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("recoat_daemon=debug".parse().unwrap()),
        )
        .init();

    // Parse args: the cache root comes from the command line or config.
    let args: Vec<String> = std::env::args().collect();
    let cache_root = if args.len() > 1 {
        PathBuf::from(&args[1])
    } else {
        recoat_config::config()
            .cache
            .root
            .clone()
            .context("no cache root given (argument or [cache] root in config)")?
    };

    if !cache_root.exists() {
        anyhow::bail!("cache root does not exist: {}", cache_root.display());
    }

    let cache_root = cache_root
        .canonicalize()
        .context("failed to canonicalize cache root")?;

    info!(path = %cache_root.display(), "starting recoatd for cache");

    let config = DaemonConfig::from_cache_root(cache_root);
    run_daemon(config).await
}

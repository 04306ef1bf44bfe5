//! # recoat-daemon
//!
//! Keeps skin patches alive inside a browser disk cache.
//!
//! ## Architecture
//!
//! The owning application regenerates its cached stylesheets at will, so a
//! single rewrite does not stay. `recoatd` watches the cache root (and the
//! skin override directory), coalesces each change storm into one
//! debounced dispatch per logical key, and re-runs the scan/patch pass:
//!
//! ```text
//! notify events → debouncer → (index walk | record sweep, via hard links)
//!                              → located files → content patcher
//! ```
//!
//! Collaborators outside this binary only provide the cache root path and
//! the target key, and consume a patched/not-patched outcome plus logs.

pub mod scan;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use recoat_link::HardLinkRegistry;
use recoat_watch::{run_dispatcher, spawn_watch_task, Debouncer};
use tokio::sync::mpsc;
use tracing::{info, warn};

use scan::{patch_skin_directory, patch_skin_file, run_patch_pass, PassSettings};

/// Logical keys the debouncer coalesces on: the cache as a whole, or one
/// named stylesheet in the skin directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PatchKey {
    Cache,
    Skin(String),
}

/// Runtime configuration for one daemon instance
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Cache root containing `index`/`data_N`/`f_XXXXXX` files, or
    /// per-entry simple-cache records.
    pub cache_root: PathBuf,
    /// Skin override directory (user custom files + generated side files).
    pub skin_dir: PathBuf,
    /// Substring of the entry key identifying the target resource.
    pub target_key: String,
    /// Debounce window, fixed from a key's first event.
    pub debounce: Duration,
    /// Loopback base URL for injected imports.
    pub loopback_base: String,
    /// Suppress already-patched log lines.
    pub quiet: bool,
    /// Hard-link aliasing (platform default unless forced in config).
    pub link_enabled: bool,
    /// Alias subdirectory name.
    pub link_alias_dir: String,
}

impl DaemonConfig {
    /// Build a config for a cache root, filling everything else from the
    /// loaded configuration.
    pub fn from_cache_root(cache_root: PathBuf) -> Self {
        let config = recoat_config::config();
        let skin_dir = config
            .patch
            .skin_dir
            .clone()
            .unwrap_or_else(|| cache_root.join("skins"));
        Self {
            cache_root,
            skin_dir,
            target_key: config.cache.target_key.clone(),
            debounce: config.watch.debounce(),
            loopback_base: config.patch.loopback_base.clone(),
            quiet: config.patch.quiet,
            link_enabled: config.link.enabled(),
            link_alias_dir: config.link.alias_dir.clone(),
        }
    }

    fn pass_settings(&self) -> PassSettings {
        PassSettings {
            needle: self.target_key.clone(),
            skin_dir: self.skin_dir.clone(),
            loopback_base: self.loopback_base.clone(),
            quiet: self.quiet,
        }
    }
}

/// Main daemon entry point.
pub async fn run_daemon(config: DaemonConfig) -> Result<()> {
    info!(
        cache_root = %config.cache_root.display(),
        skin_dir = %config.skin_dir.display(),
        target = %config.target_key,
        "starting recoatd"
    );

    let links = Arc::new(HardLinkRegistry::new(
        config.link_enabled,
        config.link_alias_dir.clone(),
    ));
    let settings = Arc::new(config.pass_settings());

    // Patch whatever is already on disk before watching for regeneration.
    let initial = run_patch_pass(&config.cache_root, &settings, &links);
    let skin_initial = patch_skin_directory(&settings);
    info!(
        cache_patched = initial.patched,
        skin_patched = skin_initial.patched,
        "initial pass complete"
    );

    let debouncer = make_debouncer(
        config.debounce,
        config.cache_root.clone(),
        Arc::clone(&settings),
        Arc::clone(&links),
    );

    let (tx, rx) = mpsc::channel::<PathBuf>(4096);
    let _cache_watch = spawn_watch_task(config.cache_root.clone(), tx.clone());
    if config.skin_dir.is_dir() {
        let _skin_watch = spawn_watch_task(config.skin_dir.clone(), tx.clone());
    }
    drop(tx);

    let key_fn = make_key_fn(
        config.skin_dir.clone(),
        config.link_alias_dir.clone(),
    );
    let dispatcher = tokio::spawn(run_dispatcher(rx, debouncer.clone(), key_fn));

    tokio::select! {
        result = dispatcher => {
            warn!("dispatcher exited");
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    // Outstanding windows are cancelled, never fired, and every alias is
    // dropped before exit.
    debouncer.stop();
    links.release_all();
    info!("recoatd stopped");
    Ok(())
}

/// Debouncer whose callback runs one patch pass (or one skin-file patch)
/// on the blocking pool. Pass failures are logged and never escape the
/// dispatch loop.
fn make_debouncer(
    window: Duration,
    cache_root: PathBuf,
    settings: Arc<PassSettings>,
    links: Arc<HardLinkRegistry>,
) -> Debouncer<PatchKey> {
    Debouncer::new(window, move |key: PatchKey| {
        let cache_root = cache_root.clone();
        let settings = Arc::clone(&settings);
        let links = Arc::clone(&links);
        async move {
            let result = tokio::task::spawn_blocking(move || match key {
                PatchKey::Cache => run_patch_pass(&cache_root, &settings, &links),
                PatchKey::Skin(name) => patch_skin_file(&settings, &name),
            })
            .await;
            if let Err(e) = result {
                warn!(error = %e, "patch pass task failed");
            }
        }
    })
}

/// Key derivation for changed paths. Side files and the alias directory
/// never trigger a pass; skin-dir stylesheets patch individually; any
/// other change under the cache root invalidates the cache as a whole.
fn make_key_fn(
    skin_dir: PathBuf,
    alias_dir: String,
) -> impl Fn(&Path) -> Option<PatchKey> {
    move |path: &Path| {
        let name = path.file_name()?.to_string_lossy().into_owned();
        if name.contains(".original.") || name.contains(".custom.") {
            return None;
        }
        if path
            .components()
            .any(|c| c.as_os_str().to_string_lossy() == alias_dir.as_str())
        {
            return None;
        }
        if path.starts_with(&skin_dir) {
            if name.ends_with(".css") {
                return Some(PatchKey::Skin(name));
            }
            return None;
        }
        Some(PatchKey::Cache)
    }
}

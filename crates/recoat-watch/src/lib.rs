//! # recoat-watch
//!
//! Change-notification plumbing between the filesystem and the patcher:
//! a notify-backed watcher task ([`watcher`]) and a per-key debounced
//! dispatcher ([`debounce`]) that turns event storms into exactly-once
//! callbacks.

pub mod debounce;
pub mod watcher;

pub use debounce::Debouncer;
pub use watcher::{spawn_watch_task, ChangeWatch};

use std::hash::Hash;
use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::info;

/// Consume changed paths from the watch channel, derive logical keys, and
/// feed the debouncer. The key function may reject an event (side files,
/// alias directories) by returning `None`.
///
/// Runs until the channel closes.
pub async fn run_dispatcher<K, F>(
    mut rx: mpsc::Receiver<PathBuf>,
    debouncer: Debouncer<K>,
    key_fn: F,
) where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    F: Fn(&std::path::Path) -> Option<K>,
{
    while let Some(path) = rx.recv().await {
        if let Some(key) = key_fn(&path) {
            debouncer.observe(key);
        }
    }
    info!("watch channel closed, dispatcher exiting");
}

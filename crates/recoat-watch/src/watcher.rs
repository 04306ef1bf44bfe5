//! Filesystem change watcher.
//!
//! Uses FSEvents on macOS, inotify on Linux, ReadDirectoryChangesW on
//! Windows. Native events land on notify's own thread; a polling task
//! forwards changed paths into a tokio channel for the dispatch loop.

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, info, warn};

const FORWARD_IDLE: Duration = Duration::from_millis(50);

/// Watcher over one directory tree, reporting created/modified files.
pub struct ChangeWatch {
    root: PathBuf,
    #[allow(dead_code)]
    watcher: RecommendedWatcher,
    event_rx: Receiver<Result<Event, notify::Error>>,
}

impl ChangeWatch {
    pub fn new(root: PathBuf) -> notify::Result<Self> {
        let (tx, rx) = mpsc::channel();

        let watcher_config = Config::default()
            .with_poll_interval(Duration::from_secs(2))
            .with_compare_contents(false);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            watcher_config,
        )?;

        watcher.watch(&root, RecursiveMode::Recursive)?;
        info!(path = %root.display(), "filesystem watch started");

        Ok(Self {
            root,
            watcher,
            event_rx: rx,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Drain queued native events into changed paths (non-blocking).
    /// Removals are irrelevant here: a regenerated cache file always ends
    /// with a create or modify.
    pub fn poll(&self) -> Vec<PathBuf> {
        let mut changed = Vec::new();

        while let Ok(result) = self.event_rx.try_recv() {
            match result {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        for path in event.paths {
                            debug!(path = %path.display(), "change event");
                            changed.push(path);
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "watch error");
                }
            }
        }

        changed
    }
}

/// Spawn the forwarding task: native events → tokio channel.
///
/// Exits when the receiving side closes.
pub fn spawn_watch_task(
    root: PathBuf,
    tx: tokio_mpsc::Sender<PathBuf>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let watch = match ChangeWatch::new(root) {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "failed to start filesystem watch");
                return;
            }
        };

        loop {
            for path in watch.poll() {
                if tx.send(path).await.is_err() {
                    return;
                }
            }
            tokio::time::sleep(FORWARD_IDLE).await;
        }
    })
}

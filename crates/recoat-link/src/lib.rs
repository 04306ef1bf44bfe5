//! # recoat-link
//!
//! Hard-link aliasing for files the owning process may hold open with an
//! exclusive lock that blocks even shared reads.
//!
//! A hard link is an alternate directory entry for the same inode, so the
//! alias can be opened independently of the sharing mode on the original
//! name. Aliases live in a dedicated subdirectory next to each source file
//! and are removed after every scan pass via [`HardLinkRegistry::release_all`].
//!
//! On platforms where shared reads are never blocked the registry opens the
//! original path directly and creates no links.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur while aliasing a locked file
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("source file has no parent directory: {0}")]
    NoParent(PathBuf),

    #[error("racing link creation for {0}")]
    CreationRace(PathBuf),
}

pub type Result<T> = std::result::Result<T, LinkError>;

/// Registry of hard-link aliases, one per source path.
///
/// The map is guarded by a mutex so first-time creation for a source path
/// is serialized: concurrent readers of the same file share one alias.
/// Construct one registry per process and pass it down explicitly; it is
/// not a global.
#[derive(Debug)]
pub struct HardLinkRegistry {
    alias_dir: String,
    enabled: bool,
    links: Mutex<HashMap<PathBuf, PathBuf>>,
}

impl HardLinkRegistry {
    /// Create a registry. `enabled = false` makes [`open_for_read`]
    /// open source paths directly without creating any links.
    ///
    /// [`open_for_read`]: HardLinkRegistry::open_for_read
    pub fn new(enabled: bool, alias_dir: impl Into<String>) -> Self {
        Self {
            alias_dir: alias_dir.into(),
            enabled,
            links: Mutex::new(HashMap::new()),
        }
    }

    /// Registry with the platform default: aliasing is only needed where
    /// an owner's exclusive open blocks shared reads.
    pub fn for_platform(alias_dir: impl Into<String>) -> Self {
        Self::new(cfg!(windows), alias_dir)
    }

    /// Whether this registry creates aliases at all.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Number of live aliases.
    pub fn len(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open `path` for reading, via a hard-link alias when aliasing is
    /// enabled.
    ///
    /// The alias is created lazily on the first read of each source path
    /// and reused afterwards. If the alias vanished since creation (the
    /// owner pruned its directory) the lookup is retried once with a fresh
    /// link before the read fails.
    pub fn open_for_read(&self, path: &Path) -> Result<File> {
        if !self.enabled {
            return Ok(File::open(path)?);
        }

        let alias = self.alias_for(path)?;
        match File::open(&alias) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "alias vanished, relinking");
                self.links.lock().unwrap().remove(path);
                let alias = self.alias_for(path)?;
                Ok(File::open(alias)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Return the alias for `path`, creating it if this is the first read.
    fn alias_for(&self, path: &Path) -> Result<PathBuf> {
        let mut links = self.links.lock().unwrap();
        if let Some(alias) = links.get(path) {
            return Ok(alias.clone());
        }

        let parent = path.parent().ok_or_else(|| LinkError::NoParent(path.to_path_buf()))?;
        let dir = parent.join(&self.alias_dir);
        fs::create_dir_all(&dir)?;

        let file_name = path
            .file_name()
            .ok_or_else(|| LinkError::NoParent(path.to_path_buf()))?;
        let alias = dir.join(file_name);

        // A stale alias can survive a crashed pass; replace it.
        if alias.symlink_metadata().is_ok() {
            fs::remove_file(&alias).ok();
        }

        match fs::hard_link(path, &alias) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Someone outside this registry owns the name; fail this
                // one read rather than the whole scan.
                return Err(LinkError::CreationRace(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        }

        debug!(source = %path.display(), alias = %alias.display(), "hard link created");
        links.insert(path.to_path_buf(), alias.clone());
        Ok(alias)
    }

    /// Remove every alias created so far. Idempotent; call at the end of
    /// each scan pass and at shutdown.
    ///
    /// A removal that fails is logged and skipped — the owner may still
    /// hold the alias open transiently, and a leftover link is replaced on
    /// the next pass anyway.
    pub fn release_all(&self) {
        let mut links = self.links.lock().unwrap();
        for (source, alias) in links.drain() {
            match fs::remove_file(&alias) {
                Ok(()) => debug!(alias = %alias.display(), "hard link removed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(
                        source = %source.display(),
                        alias = %alias.display(),
                        error = %e,
                        "failed to remove hard link, will retry next pass"
                    );
                }
            }
        }
    }
}

impl Drop for HardLinkRegistry {
    fn drop(&mut self) {
        self.release_all();
    }
}

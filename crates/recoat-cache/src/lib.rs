//! # recoat-cache
//!
//! Read-only traversal of browser disk caches, just enough to resolve one
//! named resource to the file backing its HTTP body.
//!
//! Two on-disk formats are supported behind [`CacheFormat`]:
//!
//! - **Block file**: a shared `index` hash table whose buckets chain entry
//!   records stored in `data_N` block files ([`block`]).
//! - **Simple**: one self-contained file per entry, header/trailer framed,
//!   no index ([`simple`]).
//!
//! The cache is never structurally mutated here; reads go through a
//! [`HardLinkRegistry`] so files held open by the owning application stay
//! readable.

pub mod addr;
pub mod block;
pub mod simple;

#[cfg(test)]
mod testutil;

use std::io;
use std::path::{Path, PathBuf};

use recoat_link::HardLinkRegistry;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

pub use addr::{CacheAddress, FileType};
pub use block::{find_entries_with_key_substring, read_entry, EntryRecord};
pub use simple::{EofRecord, SimpleCacheRecord, SimpleFileHeader};

/// Errors that can occur while traversing a cache
#[derive(Error, Debug)]
pub enum CacheError {
    /// The index or a required file is missing/unreadable; the whole scan
    /// is aborted and the caller reports an empty result.
    #[error("cache unavailable at {path}: {reason}")]
    CacheUnavailable { path: PathBuf, reason: String },

    /// A single entry or chain node is malformed; skip it and continue.
    #[error("corrupt entry: {0}")]
    CorruptEntry(String),

    /// The backing file for one entry could not be opened.
    #[error("entry unavailable at {path}: {reason}")]
    EntryUnavailable { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

// The simple cache is a flat directory; one level of slack covers the
// index-dir subdirectory without sweeping unrelated trees.
const SIMPLE_SWEEP_DEPTH: usize = 2;

/// The two supported on-disk cache formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheFormat {
    BlockFile,
    Simple,
}

impl CacheFormat {
    /// Detect the format of a cache root: a block-file cache always has an
    /// `index` file; everything else is treated as a simple cache.
    pub fn detect(root: &Path) -> Self {
        if root.join("index").is_file() {
            Self::BlockFile
        } else {
            Self::Simple
        }
    }

    /// Resolve `needle` to the paths of the files backing matching
    /// entries' HTTP bodies.
    ///
    /// For the block-file format this walks the index; for the simple
    /// format it sweeps the directory with the cheap header+key probe.
    /// The matched path of a simple-cache entry is the record file itself.
    pub fn find_targets(
        &self,
        root: &Path,
        needle: &str,
        links: &HardLinkRegistry,
    ) -> Result<Vec<PathBuf>> {
        match self {
            Self::BlockFile => block::find_entries_with_key_substring(root, needle, links),
            Self::Simple => find_simple_targets(root, needle, links),
        }
    }
}

fn find_simple_targets(
    root: &Path,
    needle: &str,
    links: &HardLinkRegistry,
) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        warn!(
            path = %root.display(),
            "cache directory missing; close the owning application and try again"
        );
        return Err(CacheError::CacheUnavailable {
            path: root.to_path_buf(),
            reason: "not a directory".into(),
        });
    }

    let mut results = Vec::new();
    for entry in WalkDir::new(root)
        .max_depth(SIMPLE_SWEEP_DEPTH)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()))
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        match simple::file_contains_key_substring(entry.path(), needle, links) {
            Ok(true) => results.push(entry.path().to_path_buf()),
            Ok(false) => {}
            Err(e) => {
                // One busy or vanished file must not abort the sweep.
                debug!(path = %entry.path().display(), error = %e, "skipping unreadable file");
            }
        }
    }

    debug!(needle, matches = results.len(), "simple cache sweep complete");
    Ok(results)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{write_index, write_simple_record};
    use tempfile::TempDir;

    fn registry() -> HardLinkRegistry {
        HardLinkRegistry::new(false, ".recoat-links")
    }

    #[test]
    fn test_detect_block_file() {
        let temp = TempDir::new().unwrap();
        write_index(temp.path(), &[0, 0]);
        assert_eq!(CacheFormat::detect(temp.path()), CacheFormat::BlockFile);
    }

    #[test]
    fn test_detect_simple() {
        let temp = TempDir::new().unwrap();
        assert_eq!(CacheFormat::detect(temp.path()), CacheFormat::Simple);
    }

    #[test]
    fn test_simple_sweep_finds_record_file() {
        let temp = TempDir::new().unwrap();
        let hit = write_simple_record(
            temp.path(),
            "0a2b4c6d8e0f2a4b_0",
            "https://host/app/friends.css",
            b"body",
            b"meta",
        );
        write_simple_record(
            temp.path(),
            "1111111111111111_0",
            "https://host/other.js",
            b"body",
            b"meta",
        );
        // Non-record noise must be ignored, not error the sweep.
        std::fs::write(temp.path().join("index-dir"), b"not a record").unwrap();

        let found = CacheFormat::Simple
            .find_targets(temp.path(), "friends.css", &registry())
            .unwrap();
        assert_eq!(found, vec![hit]);
    }

    #[test]
    fn test_simple_sweep_missing_root() {
        let temp = TempDir::new().unwrap();
        let gone = temp.path().join("nope");
        match CacheFormat::Simple.find_targets(&gone, "x", &registry()) {
            Err(CacheError::CacheUnavailable { .. }) => {}
            other => panic!("expected CacheUnavailable, got {:?}", other),
        }
    }

    #[test]
    fn test_simple_sweep_skips_hidden_alias_dir() {
        let temp = TempDir::new().unwrap();
        let alias_dir = temp.path().join(".recoat-links");
        std::fs::create_dir(&alias_dir).unwrap();
        write_simple_record(
            &alias_dir,
            "aaaaaaaaaaaaaaaa_0",
            "https://host/app/friends.css",
            b"body",
            b"meta",
        );

        let found = CacheFormat::Simple
            .find_targets(temp.path(), "friends.css", &registry())
            .unwrap();
        assert!(found.is_empty());
    }
}

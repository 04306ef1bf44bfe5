//! One scan/patch pass: resolve the target key in the cache, rewrite every
//! located file, then drop the hard-link aliases.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use recoat_cache::{CacheError, CacheFormat, SimpleCacheRecord};
use recoat_link::HardLinkRegistry;
use recoat_patch::text::patch_plain_text;
use recoat_patch::{patch_gzip, patch_simple_record, GzipPatch, PatchContext, PatchError, PATCHED_MARKER};
use tracing::{debug, info, warn};

/// Everything a pass needs besides the cache root.
#[derive(Debug, Clone)]
pub struct PassSettings {
    /// Substring of the entry key identifying the target resource.
    pub needle: String,
    /// Directory holding the user skin and generated side files.
    pub skin_dir: PathBuf,
    /// Base URL of the loopback host serving those files.
    pub loopback_base: String,
    /// Suppress already-patched log lines.
    pub quiet: bool,
}

impl PassSettings {
    /// Context for cache payloads: side files named after the target key.
    fn cache_context(&self) -> PatchContext {
        self.context_for_name(&self.needle)
    }

    /// Context for one named stylesheet (cache target or skin-dir file).
    fn context_for_name(&self, name: &str) -> PatchContext {
        let (stem, ext) = split_name(name);
        let original_name = format!("{}.original.{}", stem, ext);
        let custom_name = format!("{}.custom.{}", stem, ext);
        let base = self.loopback_base.trim_end_matches('/');
        PatchContext {
            marker: PATCHED_MARKER.to_string(),
            original_url: format!("{}/{}", base, original_name),
            custom_url: format!("{}/{}", base, custom_name),
            original_file: self.skin_dir.join(&original_name),
            custom_file: self.skin_dir.join(&custom_name),
        }
    }
}

/// Take the file-name portion of a key (keys are URLs) and split off the
/// extension.
fn split_name(name: &str) -> (String, String) {
    let file = name.rsplit('/').next().unwrap_or(name);
    match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), ext.to_string()),
        _ => (file.to_string(), "css".to_string()),
    }
}

/// Outcome tally of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub patched: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Run one pass over the cache root. Never panics past a bad file: the
/// worst a single target can do is count as failed.
pub fn run_patch_pass(
    root: &Path,
    settings: &PassSettings,
    links: &HardLinkRegistry,
) -> PassSummary {
    let mut summary = PassSummary::default();
    let format = CacheFormat::detect(root);
    debug!(root = %root.display(), ?format, "patch pass starting");

    let targets = match format.find_targets(root, &settings.needle, links) {
        Ok(targets) => targets,
        Err(CacheError::CacheUnavailable { .. }) => {
            // Already logged at the source with actionable text.
            links.release_all();
            return summary;
        }
        Err(e) => {
            warn!(error = %e, "cache scan failed");
            links.release_all();
            return summary;
        }
    };

    if targets.is_empty() {
        debug!(needle = %settings.needle, "no cache entries matched");
    }

    let ctx = settings.cache_context();
    for target in targets {
        match patch_target(&target, format, &ctx, settings.quiet, links) {
            Ok(true) => summary.patched += 1,
            Ok(false) => summary.skipped += 1,
            Err(e) => {
                warn!(
                    path = %target.display(),
                    error = %e,
                    "failed to patch cache entry; close the owning application and try again"
                );
                summary.failed += 1;
            }
        }
    }

    links.release_all();
    info!(
        patched = summary.patched,
        skipped = summary.skipped,
        failed = summary.failed,
        "patch pass complete"
    );
    summary
}

/// Patch one located file. `Ok(false)` means a normal skip (already
/// patched, not gzip-framed, or an entry that stopped being a record).
fn patch_target(
    path: &Path,
    format: CacheFormat,
    ctx: &PatchContext,
    quiet: bool,
    links: &HardLinkRegistry,
) -> anyhow::Result<bool> {
    match format {
        CacheFormat::Simple => {
            let mut file = links
                .open_for_read(path)
                .map_err(|e| anyhow::anyhow!("open {}: {}", path.display(), e))?;
            let mut record = match SimpleCacheRecord::read(&mut file) {
                Ok(record) => record,
                Err(CacheError::CorruptEntry(reason)) => {
                    debug!(path = %path.display(), reason, "not a readable record, skipping");
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            };
            if !patch_simple_record(&mut record, ctx)? {
                if !quiet {
                    info!(path = %path.display(), "record needs no patch");
                }
                return Ok(false);
            }
            fs::write(path, record.to_bytes())?;
            info!(path = %path.display(), key = %record.key, "cache record patched");
            Ok(true)
        }
        CacheFormat::BlockFile => {
            let mut bytes = Vec::new();
            links
                .open_for_read(path)
                .map_err(|e| anyhow::anyhow!("open {}: {}", path.display(), e))?
                .read_to_end(&mut bytes)?;

            match patch_gzip(&bytes, ctx)? {
                GzipPatch::Patched(patched) => {
                    fs::write(path, patched)?;
                    info!(path = %path.display(), "cache payload patched");
                    Ok(true)
                }
                GzipPatch::AlreadyPatched => {
                    if !quiet {
                        info!(path = %path.display(), "payload already patched");
                    }
                    Ok(false)
                }
                GzipPatch::NotGzip => {
                    debug!(path = %path.display(), "payload not gzip-framed, skipping");
                    Ok(false)
                }
            }
        }
    }
}

/// Patch every plain stylesheet in the skin override directory. Side files
/// (`*.original.*`, `*.custom.*`) are never candidates.
pub fn patch_skin_directory(settings: &PassSettings) -> PassSummary {
    let mut summary = PassSummary::default();
    let dir = &settings.skin_dir;
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(path = %dir.display(), error = %e, "no skin directory to patch");
            return summary;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let name = match path.file_name().map(|n| n.to_string_lossy().into_owned()) {
            Some(name) => name,
            None => continue,
        };
        if !name.ends_with(".css") || name.contains(".original.") || name.contains(".custom.") {
            continue;
        }

        let ctx = settings.context_for_name(&name);
        match patch_plain_text(&path, &ctx, settings.quiet) {
            Ok(true) => summary.patched += 1,
            Ok(false) => summary.skipped += 1,
            Err(PatchError::TooSmallToPatch { len, need }) => {
                warn!(path = %path.display(), len, need, "stylesheet too small to patch");
                summary.failed += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to patch stylesheet");
                summary.failed += 1;
            }
        }
    }

    summary
}

/// Patch a single skin-dir stylesheet by name, for per-file dispatch.
pub fn patch_skin_file(settings: &PassSettings, name: &str) -> PassSummary {
    let mut summary = PassSummary::default();
    let path = settings.skin_dir.join(name);
    if !path.is_file() {
        return summary;
    }

    let ctx = settings.context_for_name(name);
    match patch_plain_text(&path, &ctx, settings.quiet) {
        Ok(true) => summary.patched += 1,
        Ok(false) => summary.skipped += 1,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to patch stylesheet");
            summary.failed += 1;
        }
    }
    summary
}

//! Length-preserving patch for uncompressed on-disk stylesheets.
//!
//! Some UI stylesheets live as plain files outside the cache proper. Their
//! loaders key on file size, so the rewrite must keep the byte length
//! exactly: the live file becomes marker + imports padded with newline
//! filler out to the original length, and the original moves to a sibling
//! `*.original.*` file.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::{PatchContext, PatchError, Result, ORIGINAL_MARKER};

const FILLER: u8 = b'\n';

/// Patch a plain-text stylesheet in place, preserving its byte length.
///
/// Returns `true` when the file was rewritten. A file already starting
/// with the patched marker is a no-op; a file starting with the original
/// marker is an extracted original and is never touched. A file shorter
/// than the import header fails with [`PatchError::TooSmallToPatch`] and
/// is left unmodified.
pub fn patch_plain_text(path: &Path, ctx: &PatchContext, quiet: bool) -> Result<bool> {
    let content = fs::read(path)?;

    if content.starts_with(ORIGINAL_MARKER.as_bytes()) {
        debug!(path = %path.display(), "file is an extracted original, leaving untouched");
        return Ok(false);
    }
    if content.starts_with(ctx.marker.as_bytes()) {
        if !quiet {
            info!(path = %path.display(), "file already patched");
        }
        return Ok(false);
    }

    let header = ctx.import_lines();
    if content.len() < header.len() {
        warn!(
            path = %path.display(),
            len = content.len(),
            need = header.len(),
            "file too small to patch, leaving unmodified"
        );
        return Err(PatchError::TooSmallToPatch {
            len: content.len(),
            need: header.len(),
        });
    }

    // Archive the original, marker-prefixed so later passes skip it.
    let archive = original_sibling(path);
    let mut archived = Vec::with_capacity(ORIGINAL_MARKER.len() + 1 + content.len());
    archived.extend_from_slice(ORIGINAL_MARKER.as_bytes());
    archived.push(b'\n');
    archived.extend_from_slice(&content);
    fs::write(&archive, archived)?;

    ctx.ensure_custom_file()?;

    let mut replacement = header.into_bytes();
    replacement.resize(content.len(), FILLER);
    fs::write(path, &replacement)?;

    info!(
        path = %path.display(),
        archive = %archive.display(),
        bytes = replacement.len(),
        "stylesheet patched in place"
    );
    Ok(true)
}

/// `dir/name.ext` → `dir/name.original.ext`.
pub fn original_sibling(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}.original.{}", stem, ext.to_string_lossy()),
        None => format!("{}.original", stem),
    };
    path.with_file_name(name)
}

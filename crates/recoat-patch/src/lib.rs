//! # recoat-patch
//!
//! Byte transforms that graft skin import directives onto cached styles.
//!
//! Three variants share the same marker discipline:
//!
//! - [`patch_gzip`]: a gzip-framed HTTP body (external block-cache file).
//!   The payload is decompressed, prefixed with the marker and two
//!   `@import` directives, brace-neutralized, and recompressed.
//! - [`patch_simple_record`]: the same transform applied to stream 1 of a
//!   simple-cache record, with the trailer's size and CRC32 recomputed.
//! - [`text::patch_plain_text`]: an uncompressed on-disk stylesheet,
//!   rewritten in place at its exact original byte length.
//!
//! Every variant is idempotent: content already carrying the patched
//! marker is left alone.

pub mod text;

use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use recoat_cache::SimpleCacheRecord;
use thiserror::Error;
use tracing::{debug, info};

/// Marks content this tool has already rewritten.
pub const PATCHED_MARKER: &str = "/*recoat*/";
/// Marks an extracted original; such a file is never patched.
pub const ORIGINAL_MARKER: &str = "/*recoat-original*/";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Errors that can occur while patching
#[derive(Error, Debug)]
pub enum PatchError {
    /// The plain-text target is shorter than the import header; patching
    /// would truncate the header, so the file is left unmodified.
    #[error("content of {len} bytes is too small to hold the {need}-byte patch header")]
    TooSmallToPatch { len: usize, need: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, PatchError>;

/// Where a patch points and what it leaves behind.
#[derive(Debug, Clone)]
pub struct PatchContext {
    /// Idempotence marker prepended to patched content.
    pub marker: String,
    /// Loopback URL serving the extracted original.
    pub original_url: String,
    /// Loopback URL serving the user's custom stylesheet.
    pub custom_url: String,
    /// Side file receiving the pre-patch content.
    pub original_file: PathBuf,
    /// User custom file; created empty if absent so the import resolves.
    pub custom_file: PathBuf,
}

impl PatchContext {
    /// Header grafted onto patched content. The trailing `{` opens a rule
    /// that swallows the original body; the patcher appends the matching
    /// `}` after it.
    fn import_header(&self) -> String {
        format!(
            "{}\n@import url(\"{}\");\n@import url(\"{}\");\n{{\n",
            self.marker, self.original_url, self.custom_url
        )
    }

    /// Import lines without the brace wrapper, for whole-file rewrites.
    fn import_lines(&self) -> String {
        format!(
            "{}\n@import url(\"{}\");\n@import url(\"{}\");\n",
            self.marker, self.original_url, self.custom_url
        )
    }

    fn ensure_custom_file(&self) -> io::Result<()> {
        if !self.custom_file.exists() {
            if let Some(parent) = self.custom_file.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&self.custom_file, b"")?;
            info!(path = %self.custom_file.display(), "created empty custom file");
        }
        Ok(())
    }
}

/// Outcome of a gzip patch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GzipPatch {
    /// Rewritten; the new bytes replace the cached payload.
    Patched(Vec<u8>),
    /// Content already starts with the marker; nothing to do.
    AlreadyPatched,
    /// Input is not gzip-framed; not a patchable body.
    NotGzip,
}

/// Patch a gzip-framed stylesheet payload.
///
/// Non-gzip input and already-patched content are normal short-circuits,
/// not errors. On a real patch the pre-patch decompressed bytes are
/// persisted to the context's original side-file and the custom file is
/// created if absent.
pub fn patch_gzip(bytes: &[u8], ctx: &PatchContext) -> Result<GzipPatch> {
    if bytes.len() < GZIP_MAGIC.len() || bytes[..2] != GZIP_MAGIC {
        return Ok(GzipPatch::NotGzip);
    }

    let original = decompress(bytes)?;
    if original.starts_with(ctx.marker.as_bytes()) {
        debug!("payload already carries the patched marker");
        return Ok(GzipPatch::AlreadyPatched);
    }

    if let Some(parent) = ctx.original_file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&ctx.original_file, &original)?;
    ctx.ensure_custom_file()?;

    let header = ctx.import_header();
    let mut patched = Vec::with_capacity(header.len() + original.len() + 2);
    patched.extend_from_slice(header.as_bytes());
    patched.extend_from_slice(&original);
    patched.extend_from_slice(b"\n}");

    let recompressed = compress(&patched)?;
    info!(
        original = %ctx.original_file.display(),
        before = bytes.len(),
        after = recompressed.len(),
        "gzip payload patched"
    );
    Ok(GzipPatch::Patched(recompressed))
}

/// Patch the HTTP body stream of a simple-cache record in place.
///
/// Returns `true` when the record changed; the stream-1 trailer's
/// `stream_size` and `data_crc32` are recomputed so the record can be
/// written back byte-exactly.
pub fn patch_simple_record(record: &mut SimpleCacheRecord, ctx: &PatchContext) -> Result<bool> {
    match patch_gzip(&record.stream1, ctx)? {
        GzipPatch::Patched(new_body) => {
            record.eof1.stream_size = new_body.len() as u32;
            if record.eof1.has_crc32() {
                record.eof1.data_crc32 = crc32fast::hash(&new_body);
            }
            record.stream1 = new_body;
            Ok(true)
        }
        GzipPatch::AlreadyPatched => {
            debug!(key = %record.key, "record already patched");
            Ok(false)
        }
        GzipPatch::NotGzip => {
            debug!(key = %record.key, "record body is not gzip-framed, skipping");
            Ok(false)
        }
    }
}

fn compress(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn decompress(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

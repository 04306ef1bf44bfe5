//! Block-file cache traversal.
//!
//! The legacy cache keeps an `index` file whose hash table maps buckets to
//! entry chains, each node a fixed-layout record inside a shared `data_N`
//! block file. Traversal here is read-only: resolve a key substring to the
//! paths backing the matching entries' HTTP body streams.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use recoat_link::HardLinkRegistry;
use tracing::{debug, warn};

use crate::addr::CacheAddress;
use crate::{CacheError, Result};

/// Fixed index preamble; only `table_length` inside it is parsed.
pub const INDEX_PREAMBLE_SIZE: u64 = 368;
const INDEX_TABLE_LEN_OFFSET: u64 = 28;

/// `table_length == 0` is the format's placeholder for "default size".
pub const DEFAULT_TABLE_LENGTH: u32 = 0x10000;

/// Bytes to skip from the start of a block file before block 0's record
/// origin.
pub const BLOCK_FILE_PREAMBLE: u64 = 8196;

const ENTRY_FIXED_SIZE: usize = 92;
const ENTRY_KEY_LEN_OFFSET: usize = 28;
const ENTRY_DATA_ADDRS_OFFSET: usize = 52;
const ENTRY_DATA_STREAMS: usize = 4;

// A key longer than this is not a key, it is a corrupt length field.
const MAX_KEY_LENGTH: u32 = 64 * 1024;

// Bound on chain traversal so a corrupted self-referential chain
// terminates instead of looping forever.
const MAX_CHAIN_HOPS: usize = 64;

/// One entry record from a block file.
#[derive(Debug, Clone)]
pub struct EntryRecord {
    /// Entry key, UTF-8.
    pub key: String,
    /// Raw address of the next entry in the same hash bucket; `0` ends the
    /// chain.
    pub next: u32,
    /// Initialized data-stream addresses in slot order. Empty slots are
    /// dropped: an evicted entry may keep its key with no content, which
    /// is a normal state, not an error.
    pub data_addrs: Vec<CacheAddress>,
}

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

/// Read the entry record at `addr`.
///
/// Fails with [`CacheError::EntryUnavailable`] when the backing block file
/// cannot be opened and [`CacheError::CorruptEntry`] on a malformed record;
/// both are local to one chain node.
pub fn read_entry(addr: &CacheAddress, links: &HardLinkRegistry) -> Result<EntryRecord> {
    let path = addr.file_path();
    let mut file = links
        .open_for_read(&path)
        .map_err(|e| CacheError::EntryUnavailable {
            path: path.clone(),
            reason: e.to_string(),
        })?;

    let offset = BLOCK_FILE_PREAMBLE + u64::from(addr.block_index()) * u64::from(addr.block_size());
    file.seek(SeekFrom::Start(offset))?;

    let mut fixed = [0u8; ENTRY_FIXED_SIZE];
    file.read_exact(&mut fixed).map_err(|e| short_read(e, "entry record"))?;

    let next = u32_at(&fixed, 0);
    let key_length = u32_at(&fixed, ENTRY_KEY_LEN_OFFSET);
    if key_length > MAX_KEY_LENGTH {
        return Err(CacheError::CorruptEntry(format!(
            "key length {} exceeds limit",
            key_length
        )));
    }

    let mut data_addrs = Vec::with_capacity(ENTRY_DATA_STREAMS);
    for slot in 0..ENTRY_DATA_STREAMS {
        let raw = u32_at(&fixed, ENTRY_DATA_ADDRS_OFFSET + slot * 4);
        let child = CacheAddress::decode(raw, addr.directory());
        if child.is_initialized() {
            data_addrs.push(child);
        }
    }

    let mut key_bytes = vec![0u8; key_length as usize];
    file.read_exact(&mut key_bytes).map_err(|e| short_read(e, "entry key"))?;
    let key = String::from_utf8(key_bytes)
        .map_err(|_| CacheError::CorruptEntry("entry key is not UTF-8".into()))?;

    Ok(EntryRecord { key, next, data_addrs })
}

fn short_read(e: std::io::Error, what: &str) -> CacheError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        CacheError::CorruptEntry(format!("short read in {}", what))
    } else {
        CacheError::Io(e)
    }
}

/// Walk the whole index and return the backing paths of the HTTP body
/// stream (data slot 1) of every entry whose key contains `needle`.
///
/// A missing or unreadable `index` aborts the scan with
/// [`CacheError::CacheUnavailable`], logged here once. Corrupt chain nodes
/// are skipped and the scan continues with the remaining buckets.
pub fn find_entries_with_key_substring(
    directory: &Path,
    needle: &str,
    links: &HardLinkRegistry,
) -> Result<Vec<PathBuf>> {
    let index_path = directory.join("index");
    let mut index = match links.open_for_read(&index_path) {
        Ok(file) => file,
        Err(e) => {
            warn!(
                path = %index_path.display(),
                error = %e,
                "cache index unreadable; close the owning application and try again"
            );
            return Err(CacheError::CacheUnavailable {
                path: index_path,
                reason: e.to_string(),
            });
        }
    };

    let table_length = read_table_length(&mut index).map_err(|e| CacheError::CacheUnavailable {
        path: index_path.clone(),
        reason: e.to_string(),
    })?;

    index.seek(SeekFrom::Start(INDEX_PREAMBLE_SIZE))?;
    let mut table = vec![0u8; table_length as usize * 4];
    index.read_exact(&mut table).map_err(|e| CacheError::CacheUnavailable {
        path: index_path.clone(),
        reason: format!("truncated hash table: {}", e),
    })?;

    let mut results = Vec::new();
    for slot in table.chunks_exact(4) {
        let raw = u32::from_le_bytes(slot.try_into().unwrap());
        let head = CacheAddress::decode(raw, directory);
        if !head.is_initialized() {
            continue;
        }
        walk_chain(&head, needle, links, &mut results);
    }

    debug!(
        needle,
        table_length,
        matches = results.len(),
        "index scan complete"
    );
    Ok(results)
}

fn read_table_length(index: &mut std::fs::File) -> std::io::Result<u32> {
    index.seek(SeekFrom::Start(INDEX_TABLE_LEN_OFFSET))?;
    let mut word = [0u8; 4];
    index.read_exact(&mut word)?;
    let table_length = u32::from_le_bytes(word);
    if table_length == 0 {
        debug!("index header table_length is 0, using default");
        Ok(DEFAULT_TABLE_LENGTH)
    } else {
        Ok(table_length)
    }
}

/// Walk one hash bucket's chain, testing every node including the
/// terminal one.
fn walk_chain(
    head: &CacheAddress,
    needle: &str,
    links: &HardLinkRegistry,
    results: &mut Vec<PathBuf>,
) {
    let mut addr = head.clone();
    let mut hops = 0;
    loop {
        if hops == MAX_CHAIN_HOPS {
            warn!(raw = addr.raw(), "entry chain exceeds hop limit, abandoning");
            return;
        }
        hops += 1;

        let entry = match read_entry(&addr, links) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(raw = addr.raw(), error = %e, "skipping unreadable entry chain");
                return;
            }
        };

        if entry.key.contains(needle) {
            // Slot 1 is the HTTP response body stream; a match with fewer
            // than two streams currently has no content.
            if let Some(body) = entry.data_addrs.get(1) {
                debug!(key = %entry.key, path = %body.file_path().display(), "key matched");
                results.push(body.file_path());
            } else {
                debug!(key = %entry.key, "key matched but entry has no content");
            }
        }

        if entry.next == 0 {
            return;
        }
        let next = CacheAddress::decode(entry.next, addr.directory());
        if !next.is_initialized() {
            return;
        }
        addr = next;
    }
}

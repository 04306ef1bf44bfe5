//! Synthetic on-disk cache fixtures shared by the unit tests.

use std::fs;
use std::path::Path;

use crate::simple::{EOF_SIZE, FINAL_MAGIC, FLAG_HAS_CRC32, FLAG_HAS_KEY_SHA256, INITIAL_MAGIC};

const BLOCK_256: usize = 256;
const BLOCK_FILE_PREAMBLE: usize = 8196;
const INDEX_PREAMBLE: usize = 368;
const INDEX_TABLE_LEN_OFFSET: usize = 28;

/// Build one Block256 entry record: 92-byte fixed layout, key, padding to
/// the block boundary.
pub(crate) fn block_entry(key: &str, next: u32, data_addrs: &[u32; 4]) -> Vec<u8> {
    let mut buf = vec![0u8; 92];
    buf[0..4].copy_from_slice(&next.to_le_bytes());
    buf[28..32].copy_from_slice(&(key.len() as u32).to_le_bytes());
    for (slot, raw) in data_addrs.iter().enumerate() {
        let off = 52 + slot * 4;
        buf[off..off + 4].copy_from_slice(&raw.to_le_bytes());
    }
    buf.extend_from_slice(key.as_bytes());
    assert!(buf.len() <= BLOCK_256, "fixture entry overflows one block");
    buf.resize(BLOCK_256, 0);
    buf
}

/// Write `data_<file_number>` with the given entries at blocks 0, 1, ...
pub(crate) fn write_block_file(dir: &Path, file_number: u32, entries: &[Vec<u8>]) {
    let mut bytes = vec![0u8; BLOCK_FILE_PREAMBLE];
    for entry in entries {
        assert_eq!(entry.len(), BLOCK_256);
        bytes.extend_from_slice(entry);
    }
    fs::write(dir.join(format!("data_{}", file_number)), bytes).unwrap();
}

/// Write an `index` file with the given hash-table slots.
pub(crate) fn write_index(dir: &Path, table: &[u32]) {
    let mut bytes = vec![0u8; INDEX_PREAMBLE];
    bytes[INDEX_TABLE_LEN_OFFSET..INDEX_TABLE_LEN_OFFSET + 4]
        .copy_from_slice(&(table.len() as u32).to_le_bytes());
    for slot in table {
        bytes.extend_from_slice(&slot.to_le_bytes());
    }
    fs::write(dir.join("index"), bytes).unwrap();
}

fn eof_bytes(flags: u32, crc: u32, size: u32) -> Vec<u8> {
    let mut buf = vec![0u8; EOF_SIZE as usize];
    buf[0..8].copy_from_slice(&FINAL_MAGIC.to_le_bytes());
    buf[8..12].copy_from_slice(&flags.to_le_bytes());
    buf[12..16].copy_from_slice(&crc.to_le_bytes());
    buf[16..20].copy_from_slice(&size.to_le_bytes());
    buf
}

/// Build a complete simple-cache file image.
pub(crate) fn simple_record_bytes(
    key: &str,
    stream1: &[u8],
    stream0: &[u8],
    with_key_sha256: bool,
) -> Vec<u8> {
    let mut bytes = Vec::new();

    bytes.extend_from_slice(&INITIAL_MAGIC.to_le_bytes());
    bytes.extend_from_slice(&5u32.to_le_bytes()); // version
    bytes.extend_from_slice(&(key.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&crc32fast::hash(key.as_bytes()).to_le_bytes());
    bytes.extend_from_slice(&[0u8; 4]); // header padding
    bytes.extend_from_slice(key.as_bytes());

    bytes.extend_from_slice(stream1);
    bytes.extend_from_slice(&eof_bytes(
        FLAG_HAS_CRC32,
        crc32fast::hash(stream1),
        stream1.len() as u32,
    ));

    bytes.extend_from_slice(stream0);
    let mut eof0_flags = FLAG_HAS_CRC32;
    if with_key_sha256 {
        eof0_flags |= FLAG_HAS_KEY_SHA256;
        bytes.extend_from_slice(&[0xabu8; 32]);
    }
    bytes.extend_from_slice(&eof_bytes(
        eof0_flags,
        crc32fast::hash(stream0),
        stream0.len() as u32,
    ));

    bytes
}

/// Write a simple-cache file into `dir` under its conventional hash-named
/// file name.
pub(crate) fn write_simple_record(
    dir: &Path,
    name: &str,
    key: &str,
    stream1: &[u8],
    stream0: &[u8],
) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, simple_record_bytes(key, stream1, stream0, true)).unwrap();
    path
}

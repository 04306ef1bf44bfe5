//! Simple-cache record reader.
//!
//! The newer cache format stores one entry per file with no shared index:
//! a fixed header and the key read forward from offset 0, then two payload
//! streams whose sizes are only recorded in EOF trailers, so the trailers
//! are located by seeking backward from the end of the file:
//!
//! ```text
//! header | key | stream1 | eof1 | stream0 | [key sha256] | eof0
//! ```
//!
//! Stream 0 is response metadata, stream 1 the HTTP body. An optional
//! 32-byte key hash sits immediately before the stream-0 trailer when that
//! trailer's has-SHA256 flag is set.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use recoat_link::HardLinkRegistry;

use crate::{CacheError, Result};

pub const INITIAL_MAGIC: u64 = 0xfcfb_6d1b_a772_5c30;
pub const FINAL_MAGIC: u64 = 0xf4fa_6f45_970d_41d8;

/// On-disk size of [`SimpleFileHeader`], native packing included.
pub const HEADER_SIZE: u64 = 24;
/// On-disk size of [`EofRecord`], native packing included.
pub const EOF_SIZE: u64 = 24;

pub const FLAG_HAS_CRC32: u32 = 1;
pub const FLAG_HAS_KEY_SHA256: u32 = 1 << 1;

const KEY_SHA256_SIZE: u64 = 32;
const MAX_KEY_LENGTH: u32 = 64 * 1024;

/// Fixed file header: magic, format version, key length, key hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleFileHeader {
    pub magic: u64,
    pub version: u32,
    pub key_length: u32,
    pub key_hash: u32,
}

impl SimpleFileHeader {
    fn from_bytes(buf: &[u8; HEADER_SIZE as usize]) -> Self {
        Self {
            magic: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            version: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            key_length: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            key_hash: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        }
    }

    fn to_bytes(self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(&self.magic.to_le_bytes());
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.key_length.to_le_bytes());
        buf[16..20].copy_from_slice(&self.key_hash.to_le_bytes());
        buf
    }
}

/// Per-stream EOF trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EofRecord {
    pub magic: u64,
    pub flags: u32,
    pub data_crc32: u32,
    pub stream_size: u32,
}

impl EofRecord {
    pub fn has_crc32(&self) -> bool {
        self.flags & FLAG_HAS_CRC32 != 0
    }

    pub fn has_key_sha256(&self) -> bool {
        self.flags & FLAG_HAS_KEY_SHA256 != 0
    }

    fn from_bytes(buf: &[u8; EOF_SIZE as usize]) -> Self {
        Self {
            magic: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            data_crc32: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            stream_size: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        }
    }

    pub fn to_bytes(self) -> [u8; EOF_SIZE as usize] {
        let mut buf = [0u8; EOF_SIZE as usize];
        buf[0..8].copy_from_slice(&self.magic.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..16].copy_from_slice(&self.data_crc32.to_le_bytes());
        buf[16..20].copy_from_slice(&self.stream_size.to_le_bytes());
        buf
    }
}

/// A fully parsed simple-cache file.
#[derive(Debug, Clone)]
pub struct SimpleCacheRecord {
    pub header: SimpleFileHeader,
    pub key: String,
    /// HTTP body payload.
    pub stream1: Vec<u8>,
    pub eof1: EofRecord,
    /// Response metadata payload.
    pub stream0: Vec<u8>,
    /// Present iff `eof0` carries the has-SHA256 flag.
    pub key_sha256: Option<[u8; 32]>,
    pub eof0: EofRecord,
}

impl SimpleCacheRecord {
    /// Parse a whole record. Header and key are read forward; trailers and
    /// payloads are located by walking backward from end-of-file.
    pub fn read<F: Read + Seek>(file: &mut F) -> Result<Self> {
        let len = file.seek(SeekFrom::End(0))?;

        let (header, key) = read_header_and_key(file)?;
        let stream1_offset = HEADER_SIZE + u64::from(header.key_length);

        // eof0 is the last thing in the file.
        let eof0_offset = checked_back(len, EOF_SIZE)?;
        let eof0 = read_eof(file, eof0_offset)?;

        let sha_size = if eof0.has_key_sha256() { KEY_SHA256_SIZE } else { 0 };
        let sha_offset = checked_back(eof0_offset, sha_size)?;
        let stream0_offset = checked_back(sha_offset, u64::from(eof0.stream_size))?;

        let key_sha256 = if eof0.has_key_sha256() {
            let mut buf = [0u8; KEY_SHA256_SIZE as usize];
            file.seek(SeekFrom::Start(sha_offset))?;
            file.read_exact(&mut buf).map_err(truncated)?;
            Some(buf)
        } else {
            None
        };

        let stream0 = read_payload(file, stream0_offset, eof0.stream_size)?;

        let eof1_offset = checked_back(stream0_offset, EOF_SIZE)?;
        let eof1 = read_eof(file, eof1_offset)?;

        let stream1_start = checked_back(eof1_offset, u64::from(eof1.stream_size))?;
        if stream1_start != stream1_offset {
            return Err(CacheError::CorruptEntry(format!(
                "stream layout mismatch: body starts at {} but key ends at {}",
                stream1_start, stream1_offset
            )));
        }
        let stream1 = read_payload(file, stream1_start, eof1.stream_size)?;

        if eof1.has_crc32() && crc32fast::hash(&stream1) != eof1.data_crc32 {
            return Err(CacheError::CorruptEntry("body stream CRC mismatch".into()));
        }

        Ok(Self {
            header,
            key,
            stream1,
            eof1,
            stream0,
            key_sha256,
            eof0,
        })
    }

    /// Serialize the record back to its exact on-disk layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            (HEADER_SIZE + 2 * EOF_SIZE) as usize
                + self.key.len()
                + self.stream1.len()
                + self.stream0.len()
                + self.key_sha256.map_or(0, |s| s.len()),
        );
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(self.key.as_bytes());
        out.extend_from_slice(&self.stream1);
        out.extend_from_slice(&self.eof1.to_bytes());
        out.extend_from_slice(&self.stream0);
        if let Some(sha) = &self.key_sha256 {
            out.extend_from_slice(sha);
        }
        out.extend_from_slice(&self.eof0.to_bytes());
        out
    }
}

/// Cheap filter: read only header + key and test for the needle, without
/// touching the trailers. A file that is not a simple-cache record is
/// `false`, not an error.
pub fn file_contains_key_substring(path: &Path, needle: &str, links: &HardLinkRegistry) -> Result<bool> {
    let mut file = match links.open_for_read(path) {
        Ok(file) => file,
        Err(e) => {
            return Err(CacheError::EntryUnavailable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        }
    };
    match read_header_and_key(&mut file) {
        Ok((_, key)) => Ok(key.contains(needle)),
        Err(CacheError::CorruptEntry(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_header_and_key<F: Read + Seek>(file: &mut F) -> Result<(SimpleFileHeader, String)> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; HEADER_SIZE as usize];
    file.read_exact(&mut buf).map_err(truncated)?;
    let header = SimpleFileHeader::from_bytes(&buf);
    if header.magic != INITIAL_MAGIC {
        return Err(CacheError::CorruptEntry("bad simple-cache header magic".into()));
    }
    if header.key_length > MAX_KEY_LENGTH {
        return Err(CacheError::CorruptEntry(format!(
            "key length {} exceeds limit",
            header.key_length
        )));
    }

    let mut key_bytes = vec![0u8; header.key_length as usize];
    file.read_exact(&mut key_bytes).map_err(truncated)?;
    let key = String::from_utf8(key_bytes)
        .map_err(|_| CacheError::CorruptEntry("key is not UTF-8".into()))?;
    Ok((header, key))
}

fn read_eof<F: Read + Seek>(file: &mut F, offset: u64) -> Result<EofRecord> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = [0u8; EOF_SIZE as usize];
    file.read_exact(&mut buf).map_err(truncated)?;
    let eof = EofRecord::from_bytes(&buf);
    if eof.magic != FINAL_MAGIC {
        return Err(CacheError::CorruptEntry("bad EOF record magic".into()));
    }
    Ok(eof)
}

fn read_payload<F: Read + Seek>(file: &mut F, offset: u64, size: u32) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; size as usize];
    file.read_exact(&mut buf).map_err(truncated)?;
    Ok(buf)
}

fn checked_back(offset: u64, delta: u64) -> Result<u64> {
    offset
        .checked_sub(delta)
        .ok_or_else(|| CacheError::CorruptEntry("record shorter than its declared streams".into()))
}

fn truncated(e: std::io::Error) -> CacheError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        CacheError::CorruptEntry("truncated record".into())
    } else {
        CacheError::Io(e)
    }
}

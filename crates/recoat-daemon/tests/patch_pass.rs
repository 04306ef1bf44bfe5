//! End-to-end pass tests over synthetic on-disk caches.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use recoat_daemon::scan::{patch_skin_directory, run_patch_pass, PassSettings};
use recoat_link::HardLinkRegistry;

fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

fn gunzip(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut out).unwrap();
    out
}

fn settings(skin_dir: &Path) -> PassSettings {
    PassSettings {
        needle: "friends.css".to_string(),
        skin_dir: skin_dir.to_path_buf(),
        loopback_base: "https://127.0.0.1".to_string(),
        quiet: false,
    }
}

fn registry() -> HardLinkRegistry {
    HardLinkRegistry::new(false, ".recoat-links")
}

/// Lay out a minimal block-file cache: an index whose single occupied
/// bucket chains to one entry pointing its body stream at `f_00002a`.
fn write_block_cache(root: &Path, body: &[u8]) -> PathBuf {
    const BODY_ADDR: u32 = 0x8000_002a; // external, file 0x2a
    const META_ADDR: u32 = 0x8000_0029;
    const ENTRY_ADDR: u32 = 0x8000_0000 | (2 << 28) | (1 << 16); // data_1 block 0

    // Entry record: 92-byte fixed layout, then the key.
    let key = b"https://host/app/friends.css";
    let mut entry = vec![0u8; 92];
    entry[28..32].copy_from_slice(&(key.len() as u32).to_le_bytes());
    entry[52..56].copy_from_slice(&META_ADDR.to_le_bytes());
    entry[56..60].copy_from_slice(&BODY_ADDR.to_le_bytes());
    entry.extend_from_slice(key);
    entry.resize(256, 0);

    let mut data_1 = vec![0u8; 8196];
    data_1.extend_from_slice(&entry);
    fs::write(root.join("data_1"), data_1).unwrap();

    let mut index = vec![0u8; 368];
    index[28..32].copy_from_slice(&8u32.to_le_bytes()); // table_length
    let mut table = vec![0u32; 8];
    table[3] = ENTRY_ADDR;
    for slot in table {
        index.extend_from_slice(&slot.to_le_bytes());
    }
    fs::write(root.join("index"), index).unwrap();

    let body_path = root.join("f_00002a");
    fs::write(&body_path, body).unwrap();
    body_path
}

/// Lay out one simple-cache record file with a gzip-framed body stream.
fn write_simple_cache(root: &Path, name: &str, key: &str, body: &[u8]) -> PathBuf {
    const INITIAL_MAGIC: u64 = 0xfcfb_6d1b_a772_5c30;
    const FINAL_MAGIC: u64 = 0xf4fa_6f45_970d_41d8;

    fn eof(flags: u32, crc: u32, size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; 24];
        buf[0..8].copy_from_slice(&FINAL_MAGIC.to_le_bytes());
        buf[8..12].copy_from_slice(&flags.to_le_bytes());
        buf[12..16].copy_from_slice(&crc.to_le_bytes());
        buf[16..20].copy_from_slice(&(size as u32).to_le_bytes());
        buf
    }

    let meta = b"HTTP/1.1 200 OK";
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&INITIAL_MAGIC.to_le_bytes());
    bytes.extend_from_slice(&5u32.to_le_bytes());
    bytes.extend_from_slice(&(key.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&crc32fast::hash(key.as_bytes()).to_le_bytes());
    bytes.extend_from_slice(&[0u8; 4]);
    bytes.extend_from_slice(key.as_bytes());
    bytes.extend_from_slice(body);
    bytes.extend_from_slice(&eof(1, crc32fast::hash(body), body.len()));
    bytes.extend_from_slice(meta);
    bytes.extend_from_slice(&eof(1, crc32fast::hash(meta), meta.len()));

    let path = root.join(name);
    fs::write(&path, bytes).unwrap();
    path
}

#[test]
fn test_block_cache_pass_patches_external_body() {
    let cache = tempfile::TempDir::new().unwrap();
    let skins = tempfile::TempDir::new().unwrap();

    let css = b".friend { display: none }";
    let body_path = write_block_cache(cache.path(), &gzip(css));

    let settings = settings(skins.path());
    let summary = run_patch_pass(cache.path(), &settings, &registry());
    assert_eq!(summary.patched, 1);
    assert_eq!(summary.failed, 0);

    // The cached payload now opens with the marker and both imports.
    let patched = String::from_utf8(gunzip(&fs::read(&body_path).unwrap())).unwrap();
    assert!(patched.starts_with("/*recoat*/"));
    assert!(patched.contains("@import url(\"https://127.0.0.1/friends.original.css\");"));
    assert!(patched.contains("@import url(\"https://127.0.0.1/friends.custom.css\");"));
    assert!(patched.contains(".friend { display: none }"));

    // Side files landed in the skin dir.
    assert_eq!(
        fs::read(skins.path().join("friends.original.css")).unwrap(),
        css
    );
    assert!(skins.path().join("friends.custom.css").exists());

    // A second pass is a clean no-op.
    let again = run_patch_pass(cache.path(), &settings, &registry());
    assert_eq!(again.patched, 0);
    assert_eq!(again.skipped, 1);
}

#[test]
fn test_simple_cache_pass_rewrites_record() {
    let cache = tempfile::TempDir::new().unwrap();
    let skins = tempfile::TempDir::new().unwrap();

    let css = b"h1 { color: red }";
    let record_path = write_simple_cache(
        cache.path(),
        "3a7bd3e2360a3d29_0",
        "https://host/app/friends.css",
        &gzip(css),
    );
    write_simple_cache(
        cache.path(),
        "9c41f0d88e57a1b2_0",
        "https://host/other.js",
        &gzip(b"var x;"),
    );

    let settings = settings(skins.path());
    let summary = run_patch_pass(cache.path(), &settings, &registry());
    assert_eq!(summary.patched, 1);

    // The record still parses after rewrite: body is gzip, marker inside,
    // trailer size/CRC consistent (read() verifies the CRC itself).
    let mut file = fs::File::open(&record_path).unwrap();
    let record = recoat_cache::SimpleCacheRecord::read(&mut file).unwrap();
    let body = String::from_utf8(gunzip(&record.stream1)).unwrap();
    assert!(body.starts_with("/*recoat*/"));
    assert_eq!(record.eof1.stream_size as usize, record.stream1.len());

    // Idempotent on re-run.
    let again = run_patch_pass(cache.path(), &settings, &registry());
    assert_eq!(again.patched, 0);
}

#[test]
fn test_missing_cache_yields_empty_summary() {
    let skins = tempfile::TempDir::new().unwrap();
    let gone = skins.path().join("no-cache-here");

    let summary = run_patch_pass(&gone, &settings(skins.path()), &registry());
    assert_eq!(summary.patched + summary.skipped + summary.failed, 0);
}

#[test]
fn test_skin_directory_pass() {
    let skins = tempfile::TempDir::new().unwrap();
    let library = skins.path().join("library.css");
    fs::write(&library, vec![b'x'; 2048]).unwrap();

    let settings = settings(skins.path());
    let summary = patch_skin_directory(&settings);
    assert_eq!(summary.patched, 1);

    // Length preserved, archive created, and the archive is skipped on
    // the next pass rather than re-patched.
    assert_eq!(fs::metadata(&library).unwrap().len(), 2048);
    assert!(skins.path().join("library.original.css").exists());

    let again = patch_skin_directory(&settings);
    assert_eq!(again.patched, 0);
    assert_eq!(again.failed, 0);
}

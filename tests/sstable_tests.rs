//! Tests for checkpoint files
//!
//! These tests verify:
//! - Checkpoint creation and metadata
//! - Iteration over every entry in key order
//! - Ordering enforcement in the builder
//! - File format validation (magic, truncation, checksum)

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use atlasnode::storage::sstable::{SSTable, SSTableBuilder, SSTableReader};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_checkpoint() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("checkpoint_000001.sst");
    (temp_dir, path)
}

/// Create a checkpoint with numbered entries
fn create_checkpoint(path: &PathBuf, count: usize, lsn: u64) -> SSTable {
    let mut builder = SSTableBuilder::new(path, lsn).unwrap();
    for i in 0..count {
        let key = format!("key{:05}", i);
        let value = format!("value{}", i);
        builder.add(key.as_bytes(), value.as_bytes()).unwrap();
    }
    builder.finish().unwrap()
}

fn read_all(path: &PathBuf) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut reader = SSTableReader::open(path).unwrap();
    let entries = reader.iter().unwrap().collect::<Result<Vec<_>, _>>().unwrap();
    entries
}

// =============================================================================
// Builder Tests
// =============================================================================

#[test]
fn test_builder_creates_file() {
    let (_temp, path) = setup_temp_checkpoint();

    let table = create_checkpoint(&path, 5, 12);

    assert!(path.exists());
    assert_eq!(table.entry_count, 5);
    assert_eq!(table.lsn, 12);
    assert_eq!(table.file_size, fs::metadata(&path).unwrap().len());
}

#[test]
fn test_builder_empty_checkpoint() {
    let (_temp, path) = setup_temp_checkpoint();

    let table = SSTableBuilder::new(&path, 0).unwrap().finish().unwrap();

    assert_eq!(table.entry_count, 0);
    assert!(read_all(&path).is_empty());
}

#[test]
fn test_builder_rejects_unsorted_keys() {
    let (_temp, path) = setup_temp_checkpoint();
    let mut builder = SSTableBuilder::new(&path, 1).unwrap();
    builder.add(b"banana", b"1").unwrap();

    assert!(builder.add(b"apple", b"2").is_err());
    assert!(builder.add(b"banana", b"3").is_err());
}

#[test]
fn test_builder_size_tracks_bytes() {
    let (_temp, path) = setup_temp_checkpoint();
    let mut builder = SSTableBuilder::new(&path, 1).unwrap();
    let before = builder.size();

    builder.add(b"key", b"value").unwrap();

    assert_eq!(builder.size(), before + 8 + 3 + 5);
}

// =============================================================================
// Reader Tests
// =============================================================================

#[test]
fn test_reader_reports_metadata() {
    let (_temp, path) = setup_temp_checkpoint();
    create_checkpoint(&path, 10, 42);

    let reader = SSTableReader::open(&path).unwrap();

    assert_eq!(reader.entry_count(), 10);
    assert_eq!(reader.lsn(), 42);
    assert_eq!(reader.metadata().path, path);
}

#[test]
fn test_iterator_yields_sorted_entries() {
    let (_temp, path) = setup_temp_checkpoint();
    create_checkpoint(&path, 100, 1);

    let entries = read_all(&path);

    assert_eq!(entries.len(), 100);
    assert_eq!(entries[0], (b"key00000".to_vec(), b"value0".to_vec()));
    assert_eq!(entries[99], (b"key00099".to_vec(), b"value99".to_vec()));
    assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
}

#[test]
fn test_iterator_handles_empty_values_and_binary_keys() {
    let (_temp, path) = setup_temp_checkpoint();
    let mut builder = SSTableBuilder::new(&path, 3).unwrap();
    builder.add(b"\x00", b"").unwrap();
    builder.add(b"\xff\xff/Version", &7u64.to_be_bytes()).unwrap();
    builder.finish().unwrap();

    let entries = read_all(&path);

    assert_eq!(entries[0], (vec![0u8], Vec::new()));
    assert_eq!(entries[1].1, 7u64.to_be_bytes().to_vec());
}

// =============================================================================
// Format Validation Tests
// =============================================================================

#[test]
fn test_open_rejects_bad_magic() {
    let (_temp, path) = setup_temp_checkpoint();
    create_checkpoint(&path, 3, 1);
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.write_all(b"NOPE").unwrap();

    assert!(SSTableReader::open(&path).is_err());
}

#[test]
fn test_open_rejects_truncated_file() {
    let (_temp, path) = setup_temp_checkpoint();
    fs::write(&path, b"ATNC").unwrap();

    assert!(SSTableReader::open(&path).is_err());
}

#[test]
fn test_iterator_detects_corrupted_data() {
    let (_temp, path) = setup_temp_checkpoint();
    create_checkpoint(&path, 3, 1);
    // Flip a byte inside the first value
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(22 + 8 + 8)).unwrap();
    file.write_all(b"X").unwrap();
    drop(file);

    let mut reader = SSTableReader::open(&path).unwrap();
    let results: Vec<_> = reader.iter().unwrap().collect();

    assert!(results.iter().any(|r| r.is_err()));
}

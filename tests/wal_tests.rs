//! Tests for the commit log
//!
//! These tests verify:
//! - Records round-trip through writer and reader
//! - LSNs continue after reopen and after truncate
//! - Recovery from a clean log, an empty log and a missing log
//! - Recovery cuts a torn tail and stops at a corrupted record
//! - Verify mode reports without modifying the file

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use atlasnode::wal::{Operation, WalEntry, WalReader, WalRecovery, WalWriter, HEADER_SIZE};
use atlasnode::AtlasError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_log() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("commit.log");
    (temp_dir, path)
}

fn set_op(i: usize) -> Operation {
    Operation::Set {
        key: format!("key{}", i).into_bytes(),
        value: format!("value{}", i).into_bytes(),
    }
}

/// One commit record per entry, each holding a single set
fn write_records(path: &Path, count: usize) {
    let mut writer = WalWriter::open(path, 0, true).unwrap();
    for i in 0..count {
        writer.append(vec![set_op(i)]).unwrap();
    }
}

fn append_raw(path: &Path, bytes: &[u8]) {
    let mut file = OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

// =============================================================================
// Writer / Reader Tests
// =============================================================================

#[test]
fn test_append_assigns_increasing_lsns() {
    let (_temp, path) = setup_temp_log();
    let mut writer = WalWriter::open(&path, 0, false).unwrap();

    assert_eq!(writer.append(vec![set_op(1)]).unwrap(), 1);
    assert_eq!(writer.append(vec![set_op(2)]).unwrap(), 2);
    assert_eq!(writer.current_lsn(), 2);
    assert_eq!(writer.size(), fs::metadata(&path).unwrap().len());
}

#[test]
fn test_reader_returns_records_in_order() {
    let (_temp, path) = setup_temp_log();
    {
        let mut writer = WalWriter::open(&path, 0, true).unwrap();
        writer
            .append(vec![
                set_op(1),
                Operation::ClearRange {
                    begin: b"a".to_vec(),
                    end: b"c".to_vec(),
                },
            ])
            .unwrap();
        writer.append(vec![set_op(2)]).unwrap();
    }

    let entries: Vec<WalEntry> = WalReader::open(&path)
        .unwrap()
        .entries()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].lsn, 1);
    assert_eq!(entries[0].ops.len(), 2);
    assert!(matches!(entries[0].ops[1], Operation::ClearRange { .. }));
    assert_eq!(entries[1], WalEntry::new(2, vec![set_op(2)]));
}

#[test]
fn test_reopen_continues_after_last_lsn() {
    let (_temp, path) = setup_temp_log();
    write_records(&path, 3);

    let (_, recovery) = WalRecovery::recover(&path).unwrap();
    let mut writer = WalWriter::open(&path, recovery.last_lsn, true).unwrap();

    assert_eq!(writer.append(vec![set_op(9)]).unwrap(), 4);
}

#[test]
fn test_truncate_keeps_lsns_increasing() {
    let (_temp, path) = setup_temp_log();
    let mut writer = WalWriter::open(&path, 0, true).unwrap();
    writer.append(vec![set_op(1)]).unwrap();
    writer.append(vec![set_op(2)]).unwrap();

    writer.truncate().unwrap();

    assert_eq!(writer.size(), 0);
    assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    assert_eq!(writer.append(vec![set_op(3)]).unwrap(), 3);
}

#[test]
fn test_decode_rejects_checksum_mismatch() {
    let entry = WalEntry::new(7, vec![set_op(1)]);
    let bytes = entry.encode().unwrap();
    let payload = &bytes[HEADER_SIZE..];

    let result = WalEntry::decode(7, 0xdead_beef, payload);

    assert!(matches!(result, Err(AtlasError::WalCorruption(_))));
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[test]
fn test_recover_missing_file() {
    let (_temp, path) = setup_temp_log();

    let (entries, result) = WalRecovery::recover(&path).unwrap();

    assert!(entries.is_empty());
    assert_eq!(result, Default::default());
}

#[test]
fn test_recover_empty_file() {
    let (_temp, path) = setup_temp_log();
    File::create(&path).unwrap();

    let (entries, result) = WalRecovery::recover(&path).unwrap();

    assert_eq!(entries.len(), 0);
    assert_eq!(result.entries_recovered, 0);
    assert!(!result.was_truncated);
}

#[test]
fn test_recover_clean_log() {
    let (_temp, path) = setup_temp_log();
    write_records(&path, 5);

    let (entries, result) = WalRecovery::recover(&path).unwrap();

    assert_eq!(entries.len(), 5);
    assert_eq!(result.entries_recovered, 5);
    assert_eq!(result.last_lsn, 5);
    assert!(!result.was_truncated);
}

#[test]
fn test_recover_truncates_partial_header() {
    let (_temp, path) = setup_temp_log();
    write_records(&path, 3);
    let clean_len = fs::metadata(&path).unwrap().len();
    append_raw(&path, &[1, 2, 3, 4, 5]);

    let (entries, result) = WalRecovery::recover(&path).unwrap();

    assert_eq!(entries.len(), 3);
    assert!(result.was_truncated);
    assert_eq!(result.valid_bytes, clean_len);
    assert_eq!(fs::metadata(&path).unwrap().len(), clean_len);
}

#[test]
fn test_recover_truncates_partial_payload() {
    let (_temp, path) = setup_temp_log();
    write_records(&path, 2);
    let clean_len = fs::metadata(&path).unwrap().len();
    let torn = WalEntry::new(3, vec![set_op(3)]).encode().unwrap();
    append_raw(&path, &torn[..torn.len() - 3]);

    let (entries, result) = WalRecovery::recover(&path).unwrap();

    assert_eq!(entries.len(), 2);
    assert_eq!(result.last_lsn, 2);
    assert_eq!(fs::metadata(&path).unwrap().len(), clean_len);
}

#[test]
fn test_recover_stops_at_corrupted_record() {
    let (_temp, path) = setup_temp_log();
    write_records(&path, 2);
    let mut bad = WalEntry::new(3, vec![set_op(3)]).encode().unwrap();
    let last = bad.len() - 1;
    bad[last] ^= 0xff;
    append_raw(&path, &bad);
    append_raw(&path, &WalEntry::new(4, vec![set_op(4)]).encode().unwrap());

    let (entries, result) = WalRecovery::recover(&path).unwrap();

    assert_eq!(entries.len(), 2);
    assert!(result.was_truncated);
    assert_eq!(result.last_lsn, 2);
}

#[test]
fn test_recovered_log_accepts_new_records() {
    let (_temp, path) = setup_temp_log();
    write_records(&path, 2);
    append_raw(&path, &[0xaa; 10]);

    let (_, result) = WalRecovery::recover(&path).unwrap();
    {
        let mut writer = WalWriter::open(&path, result.last_lsn, true).unwrap();
        writer.append(vec![set_op(3)]).unwrap();
    }
    let (entries, result) = WalRecovery::recover(&path).unwrap();

    assert_eq!(entries.len(), 3);
    assert_eq!(result.last_lsn, 3);
    assert!(!result.was_truncated);
}

#[test]
fn test_verify_does_not_modify_file() {
    let (_temp, path) = setup_temp_log();
    write_records(&path, 2);
    append_raw(&path, &[9; 7]);
    let len_before = fs::metadata(&path).unwrap().len();

    let result = WalRecovery::verify(&path).unwrap();

    assert!(result.was_truncated);
    assert_eq!(result.entries_recovered, 2);
    assert_eq!(fs::metadata(&path).unwrap().len(), len_before);
}

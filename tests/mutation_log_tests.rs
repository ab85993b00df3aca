//! Tests for the mutation log
//!
//! These tests verify:
//! - Appends group mutations by version and track bytes
//! - Atomic operations and backward versions are rejected
//! - Drain targets cover whole versions within the byte budget
//! - Popping removes exactly the drained prefix

use atlasnode::mutation::AtomicOp;
use atlasnode::update::MutationLog;
use atlasnode::Mutation;

// =============================================================================
// Helper Functions
// =============================================================================

/// One 10-byte set per version in `versions`
fn setup_log(versions: &[u64]) -> MutationLog {
    let mut log = MutationLog::new();
    for &v in versions {
        log.append(v, Mutation::set(format!("key{:02}", v % 100), "value")).unwrap();
    }
    log
}

// =============================================================================
// Append Tests
// =============================================================================

#[test]
fn test_append_groups_by_version() {
    let mut log = MutationLog::new();
    log.append(1, Mutation::set("a", "1")).unwrap();
    log.append(1, Mutation::clear_range("b", "c")).unwrap();
    log.append(3, Mutation::set("d", "4")).unwrap();

    assert_eq!(log.len(), 2);
    assert_eq!(log.bytes(), 2 + 2 + 2);
    assert_eq!(log.first_version(), Some(1));
    assert_eq!(log.last_version(), Some(3));
}

#[test]
fn test_append_rejects_backward_version() {
    let mut log = setup_log(&[5]);

    assert!(log.append(4, Mutation::set("a", "1")).is_err());
    assert!(log.append(5, Mutation::set("a", "1")).is_ok());
}

#[test]
fn test_append_rejects_atomic() {
    let mut log = MutationLog::new();

    let result = log.append(1, Mutation::atomic(AtomicOp::Add, "a", vec![1u8]));

    assert!(result.is_err());
    assert!(log.is_empty());
}

// =============================================================================
// Drain Target Tests
// =============================================================================

#[test]
fn test_drain_target_stops_at_floor() {
    let log = setup_log(&[1, 2, 3, 4]);

    assert_eq!(log.drain_target(2, usize::MAX), 2);
    assert_eq!(log.drain_target(10, usize::MAX), 10);
}

#[test]
fn test_drain_target_respects_budget() {
    // 10 bytes per version
    let log = setup_log(&[1, 2, 3, 4]);

    assert_eq!(log.drain_target(4, 25), 2);
    assert_eq!(log.drain_target(4, 20), 2);
}

#[test]
fn test_drain_target_always_takes_first_version() {
    let log = setup_log(&[7, 8]);

    assert_eq!(log.drain_target(8, 1), 7);
}

#[test]
fn test_drain_target_never_splits_a_version() {
    let mut log = MutationLog::new();
    for i in 0..10 {
        log.append(1, Mutation::set(format!("k{}", i), "v")).unwrap();
    }
    log.append(2, Mutation::set("x", "y")).unwrap();

    assert_eq!(log.drain_target(2, 5), 1);
}

#[test]
fn test_drain_target_on_empty_log_is_floor() {
    let log = MutationLog::new();

    assert_eq!(log.drain_target(42, 0), 42);
}

// =============================================================================
// Pop Tests
// =============================================================================

#[test]
fn test_entries_through_copies_in_order() {
    let log = setup_log(&[1, 2, 3]);

    let entries = log.entries_through(2);

    assert_eq!(entries.iter().map(|(v, _)| *v).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(log.len(), 3);
}

#[test]
fn test_pop_through_removes_prefix() {
    let mut log = setup_log(&[1, 2, 3]);

    let popped = log.pop_through(2);

    assert_eq!(popped.len(), 2);
    assert_eq!(popped[1].version, 2);
    assert_eq!(popped[0].bytes(), 10);
    assert_eq!(log.first_version(), Some(3));
    assert_eq!(log.bytes(), 10);
}

#[test]
fn test_reset_empties_log() {
    let mut log = setup_log(&[1, 2]);

    log.reset();

    assert!(log.is_empty());
    assert_eq!(log.bytes(), 0);
    assert_eq!(log.drain_target(5, 100), 5);
}

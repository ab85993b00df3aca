//! Tests for the update applier
//!
//! These tests drive `UpdateApplier::apply_batch` directly, without the
//! durability loop, so every step is deterministic.
//!
//! These tests verify:
//! - Batches publish versions and replays of applied versions are skipped
//! - Atomic operations see memory first, then the durable store
//! - Clears stretch over empty key space and merge
//! - Control mutations: assignment, unassignment, configuration, rollback
//! - Mutations for fetching ranges are buffered, unassigned ones dropped
//! - Malformed mutations are rejected

use std::sync::Arc;

use atlasnode::context::EngineContext;
use atlasnode::mutation::{apply_atomic, Expanded, PRIVATE_PREFIX};
use atlasnode::mvcc::{Lookup, MemEntry};
use atlasnode::peer::MemoryPeer;
use atlasnode::read;
use atlasnode::shard::{ShardState, ShardTable};
use atlasnode::storage::{DurableStore, MemoryStore};
use atlasnode::tlog::MemoryLog;
use atlasnode::update::{BatchOutcome, UpdateApplier};
use atlasnode::{AtlasError, AtomicOp, Config, KeyRange, KeyValue, Mutation};
use bytes::Bytes;

// =============================================================================
// Helper Functions
// =============================================================================

fn r(b: &'static str, e: &'static str) -> KeyRange {
    KeyRange::new(Bytes::from_static(b.as_bytes()), Bytes::from_static(e.as_bytes()))
}

fn counter(n: u64) -> Bytes {
    Bytes::copy_from_slice(&n.to_le_bytes())
}

/// Applier with the whole keyspace assigned empty at version 1
fn setup_applier() -> (Arc<EngineContext>, UpdateApplier, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let ctx = Arc::new(
        EngineContext::new(
            Config::builder().build(),
            0,
            ShardTable::new(),
            store.clone(),
            Arc::new(MemoryPeer::new()),
        )
        .unwrap(),
    );
    let log = MemoryLog::new();
    let mut applier = UpdateApplier::new(ctx.clone(), Box::new(log.cursor()));
    let outcome = applier
        .apply_batch(1, vec![Mutation::assign_range(&KeyRange::all(), true)])
        .unwrap();
    assert_eq!(outcome, BatchOutcome::Applied);
    (ctx, applier, store)
}

fn memory_entries(ctx: &EngineContext, version: u64) -> Vec<MemEntry> {
    ctx.store
        .view(version)
        .unwrap()
        .range(&KeyRange::all(), false)
        .collect()
}

// =============================================================================
// Batch Tests
// =============================================================================

#[test]
fn test_batches_publish_versions() {
    let (ctx, mut applier, _store) = setup_applier();

    applier.apply_batch(2, vec![Mutation::set("a", "1")]).unwrap();
    applier.apply_batch(5, vec![Mutation::set("a", "2")]).unwrap();

    assert_eq!(ctx.version.get(), 5);
    assert_eq!(read::get(&ctx, b"a", 2).unwrap(), Some(Bytes::from("1")));
    assert_eq!(read::get(&ctx, b"a", 4).unwrap(), Some(Bytes::from("1")));
    assert_eq!(read::get(&ctx, b"a", 5).unwrap(), Some(Bytes::from("2")));
    assert_eq!(read::get(&ctx, b"b", 5).unwrap(), None);
}

#[test]
fn test_applied_version_is_skipped() {
    let (ctx, mut applier, _store) = setup_applier();
    applier.apply_batch(2, vec![Mutation::set("a", "1")]).unwrap();

    let again = applier.apply_batch(2, vec![Mutation::set("a", "other")]).unwrap();
    let older = applier.apply_batch(1, vec![Mutation::clear("a")]).unwrap();

    assert_eq!(again, BatchOutcome::Skipped);
    assert_eq!(older, BatchOutcome::Skipped);
    assert_eq!(read::get(&ctx, b"a", 2).unwrap(), Some(Bytes::from("1")));
}

#[test]
fn test_empty_batch_still_publishes() {
    let (ctx, mut applier, _store) = setup_applier();

    applier.apply_batch(3, Vec::new()).unwrap();

    assert_eq!(ctx.version.get(), 3);
    assert_eq!(ctx.store.latest_version(), 3);
}

#[test]
fn test_mutation_log_records_expanded_writes() {
    let (ctx, mut applier, _store) = setup_applier();

    applier
        .apply_batch(
            2,
            vec![
                Mutation::set("a", "1"),
                Mutation::atomic(AtomicOp::Add, "n", counter(2)),
            ],
        )
        .unwrap();

    let entries = ctx.log.lock().entries_through(2);
    assert!(entries.contains(&(2, Mutation::set("a", "1"))));
    assert!(entries.contains(&(2, Mutation::set("n", counter(2)))));
    assert!(entries
        .iter()
        .all(|(_, m)| !matches!(m, Mutation::Atomic { .. })));
}

// =============================================================================
// Atomic Operation Tests
// =============================================================================

#[test]
fn test_atomic_add_chains_in_memory() {
    let (ctx, mut applier, _store) = setup_applier();

    applier
        .apply_batch(2, vec![Mutation::atomic(AtomicOp::Add, "n", counter(5))])
        .unwrap();
    applier
        .apply_batch(
            3,
            vec![
                Mutation::atomic(AtomicOp::Add, "n", counter(3)),
                Mutation::atomic(AtomicOp::Add, "n", counter(1)),
            ],
        )
        .unwrap();

    assert_eq!(read::get(&ctx, b"n", 2).unwrap(), Some(counter(5)));
    assert_eq!(read::get(&ctx, b"n", 3).unwrap(), Some(counter(9)));
}

#[test]
fn test_atomic_reads_durable_value() {
    let (ctx, mut applier, store) = setup_applier();
    store.set(Bytes::from("n"), counter(40)).unwrap();
    store.commit().unwrap();

    applier
        .apply_batch(2, vec![Mutation::atomic(AtomicOp::Add, "n", counter(2))])
        .unwrap();

    assert_eq!(ctx.store.read(b"n", 2), Some(Lookup::Value(counter(42))));
}

#[test]
fn test_atomic_after_clear_ignores_durable_value() {
    let (ctx, mut applier, store) = setup_applier();
    store.set(Bytes::from("n"), counter(40)).unwrap();
    store.commit().unwrap();

    applier
        .apply_batch(
            2,
            vec![
                Mutation::clear("n"),
                Mutation::atomic(AtomicOp::Add, "n", counter(2)),
            ],
        )
        .unwrap();

    assert_eq!(ctx.store.read(b"n", 2), Some(Lookup::Value(counter(2))));
}

#[test]
fn test_compare_and_clear() {
    let (ctx, mut applier, _store) = setup_applier();
    applier
        .apply_batch(2, vec![Mutation::set("a", "x"), Mutation::set("b", "y")])
        .unwrap();

    applier
        .apply_batch(
            3,
            vec![
                Mutation::atomic(AtomicOp::CompareAndClear, "a", "x"),
                Mutation::atomic(AtomicOp::CompareAndClear, "b", "nope"),
                Mutation::atomic(AtomicOp::CompareAndClear, "c", "x"),
            ],
        )
        .unwrap();

    assert_eq!(read::get(&ctx, b"a", 3).unwrap(), None);
    assert_eq!(read::get(&ctx, b"b", 3).unwrap(), Some(Bytes::from("y")));
    assert_eq!(ctx.store.read(b"c", 3), Some(Lookup::Missing));
}

#[test]
fn test_apply_atomic_ops() {
    assert_eq!(
        apply_atomic(AtomicOp::Add, Some(&[0xffu8, 0x00][..]), &[0x01, 0x00]),
        Expanded::Set(Bytes::from_static(&[0x00, 0x01]))
    );
    assert_eq!(
        apply_atomic(AtomicOp::And, Some(&[0b1100u8][..]), &[0b1010]),
        Expanded::Set(Bytes::from_static(&[0b1000]))
    );
    assert_eq!(
        apply_atomic(AtomicOp::Max, Some(&[5u8, 0][..]), &[4, 0]),
        Expanded::Set(Bytes::from_static(&[5, 0]))
    );
    assert_eq!(
        apply_atomic(AtomicOp::Min, Some(&[5u8, 0][..]), &[4, 0]),
        Expanded::Set(Bytes::from_static(&[4, 0]))
    );
    assert_eq!(
        apply_atomic(AtomicOp::ByteMin, Some(&b"apple"[..]), b"banana"),
        Expanded::Set(Bytes::from_static(b"apple"))
    );
    assert_eq!(
        apply_atomic(AtomicOp::AppendIfFits, Some(&b"ab"[..]), b"cd"),
        Expanded::Set(Bytes::from_static(b"abcd"))
    );
    assert_eq!(
        apply_atomic(AtomicOp::Xor, None, b"\x01"),
        Expanded::Set(Bytes::from_static(b"\x01"))
    );
    assert_eq!(
        apply_atomic(AtomicOp::CompareAndClear, None, b"x"),
        Expanded::Unchanged
    );
}

// =============================================================================
// Clear Tests
// =============================================================================

#[test]
fn test_clear_extends_to_next_memory_key() {
    let (ctx, mut applier, _store) = setup_applier();
    applier.apply_batch(2, vec![Mutation::set("m", "1")]).unwrap();

    applier.apply_batch(3, vec![Mutation::clear_range("a", "b")]).unwrap();
    applier.apply_batch(4, vec![Mutation::clear_range("b", "c")]).unwrap();

    assert_eq!(
        memory_entries(&ctx, 4),
        vec![MemEntry::Clear(r("a", "m")), MemEntry::Set(KeyValue::new("m", "1"))]
    );
    ctx.store.check_invariants().unwrap();
}

#[test]
fn test_clear_extension_stops_at_durable_key() {
    let (ctx, mut applier, store) = setup_applier();
    store.set(Bytes::from("d"), Bytes::from("disk")).unwrap();
    store.commit().unwrap();

    applier.apply_batch(2, vec![Mutation::clear_range("a", "b")]).unwrap();

    assert_eq!(memory_entries(&ctx, 2), vec![MemEntry::Clear(r("a", "d"))]);
    assert_eq!(read::get(&ctx, b"d", 2).unwrap(), Some(Bytes::from("disk")));
}

#[test]
fn test_clear_hides_durable_rows() {
    let (ctx, mut applier, store) = setup_applier();
    store.set(Bytes::from("b"), Bytes::from("disk")).unwrap();
    store.commit().unwrap();

    applier.apply_batch(2, vec![Mutation::clear_range("a", "c")]).unwrap();

    assert_eq!(read::get(&ctx, b"b", 1).unwrap(), Some(Bytes::from("disk")));
    assert_eq!(read::get(&ctx, b"b", 2).unwrap(), None);
}

// =============================================================================
// Control Mutation Tests
// =============================================================================

#[test]
fn test_set_and_clear_cluster_config() {
    let (ctx, mut applier, _store) = setup_applier();
    let mut conf_key = PRIVATE_PREFIX.to_vec();
    conf_key.extend_from_slice(b"conf/replicas");
    let mut conf_end = conf_key.clone();
    conf_end.push(0);

    applier
        .apply_batch(2, vec![Mutation::set_config("replicas", "3")])
        .unwrap();
    assert_eq!(
        ctx.cluster_config.read().get("replicas"),
        Some(&Bytes::from("3"))
    );

    applier
        .apply_batch(3, vec![Mutation::clear_range(conf_key, conf_end)])
        .unwrap();
    assert!(ctx.cluster_config.read().get("replicas").is_none());
}

#[test]
fn test_unassign_clears_memory() {
    let (ctx, mut applier, _store) = setup_applier();
    applier.apply_batch(2, vec![Mutation::set("b", "1")]).unwrap();

    applier
        .apply_batch(3, vec![Mutation::unassign_range(&r("a", "c"))])
        .unwrap();

    assert_eq!(ctx.store.read(b"b", 2), Some(Lookup::Value(Bytes::from("1"))));
    assert_eq!(ctx.store.read(b"b", 3), Some(Lookup::Cleared));
    assert!(matches!(read::get(&ctx, b"b", 3), Err(AtlasError::WrongShard)));
    assert_eq!(
        ctx.shards.read().descriptor_at(b"b").unwrap().state,
        ShardState::Unassigned
    );
    let entries = ctx.log.lock().entries_through(3);
    assert!(entries.contains(&(3, Mutation::clear_range("a", "c"))));
}

#[test]
fn test_unassigned_mutations_are_dropped() {
    let (ctx, mut applier, _store) = setup_applier();
    applier
        .apply_batch(2, vec![Mutation::unassign_range(&r("x", "z"))])
        .unwrap();
    let logged = ctx.log.lock().len();

    applier
        .apply_batch(3, vec![Mutation::set("y", "lost"), Mutation::set("a", "kept")])
        .unwrap();

    // Only the unassignment's clear covers the key
    assert_eq!(ctx.store.read(b"y", 3), Some(Lookup::Cleared));
    assert_eq!(ctx.store.read(b"a", 3), Some(Lookup::Value(Bytes::from("kept"))));
    assert_eq!(ctx.log.lock().len(), logged + 1);
}

#[test]
fn test_fetching_range_buffers_mutations() {
    let (ctx, mut applier, _store) = setup_applier();
    // The dirty range keeps the fetch waiting: nothing makes version 2 durable
    applier
        .apply_batch(2, vec![Mutation::unassign_range(&r("p", "q"))])
        .unwrap();
    applier
        .apply_batch(3, vec![Mutation::assign_range(&r("p", "q"), false)])
        .unwrap();
    let fetch = match ctx.shards.read().descriptor_at(b"p").unwrap().state {
        ShardState::Fetching { fetch } => fetch,
        other => panic!("expected a fetching shard, got {:?}", other),
    };

    applier
        .apply_batch(
            4,
            vec![Mutation::set("pp", "1"), Mutation::clear_range("o", "pz")],
        )
        .unwrap();

    assert_eq!(ctx.shards.read().fetch(fetch).unwrap().backlog_len(), 2);
    assert_eq!(ctx.store.read(b"pp", 4), Some(Lookup::Cleared));
    assert!(matches!(read::get(&ctx, b"pp", 4), Err(AtlasError::WrongShard)));
    ctx.stop();
}

#[test]
fn test_rollback_resets_to_durable_version() {
    let (ctx, mut applier, _store) = setup_applier();
    applier.apply_batch(2, vec![Mutation::set("a", "1")]).unwrap();

    let outcome = applier.apply_batch(3, vec![Mutation::epoch_end(2)]).unwrap();

    assert_eq!(outcome, BatchOutcome::RolledBack);
    assert_eq!(ctx.version.get(), 0);
    assert_eq!(ctx.store.latest_version(), 0);
    assert!(ctx.log.lock().is_empty());
    // Nothing durable records the assignment, so the rebuilt table is empty
    assert_eq!(
        ctx.shards.read().descriptor_at(b"a").unwrap().state,
        ShardState::Unassigned
    );
}

#[test]
fn test_rollback_below_durable_is_rejected() {
    let (ctx, mut applier, _store) = setup_applier();
    applier.apply_batch(6, Vec::new()).unwrap();
    ctx.durable_version.advance(5);

    let result = applier.apply_batch(7, vec![Mutation::epoch_end(3)]);

    assert!(matches!(result, Err(AtlasError::InvariantViolation(_))));
}

// =============================================================================
// Validation Tests
// =============================================================================

#[test]
fn test_unknown_private_mutation_is_rejected() {
    let (_ctx, mut applier, _store) = setup_applier();
    let mut key = PRIVATE_PREFIX.to_vec();
    key.extend_from_slice(b"bogus");

    let result = applier.apply_batch(2, vec![Mutation::set(key, "x")]);

    assert!(matches!(result, Err(AtlasError::UnexpectedMutation(_))));
}

#[test]
fn test_system_key_write_is_rejected() {
    let (_ctx, mut applier, _store) = setup_applier();

    let result = applier.apply_batch(2, vec![Mutation::set(&b"\xff\x01"[..], "x")]);

    assert!(matches!(result, Err(AtlasError::UnexpectedMutation(_))));
}

//! Tests for shard migration
//!
//! These tests verify:
//! - A fetched range holds the peer's snapshot plus mutations that arrived
//!   during the copy, and becomes readable only once durable
//! - Long copies split and hand their tail to new fetches
//! - Peer failures, including empty blocks that claim more rows, are retried
//! - Unassigning a fetching range cancels the copy and leaves nothing behind

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use atlasnode::peer::MemoryPeer;
use atlasnode::shard::ShardState;
use atlasnode::storage::MemoryStore;
use atlasnode::tlog::MemoryLog;
use atlasnode::{AtlasError, Mutation};
use common::{fast_config, r, Harness, WAIT};

// =============================================================================
// Helper Functions
// =============================================================================

/// Harness whose peer holds `rows` from version 0 on
fn setup_with_peer(config: atlasnode::Config, rows: &[(&'static str, &'static str)]) -> Harness {
    let peer = Arc::new(MemoryPeer::new());
    for (k, v) in rows {
        peer.set(*k, *v, 0);
    }
    Harness::open_with(config, Arc::new(MemoryStore::new()), MemoryLog::new(), peer)
}

/// Wait until the peer has seen at least `count` requests
fn wait_for_requests(peer: &MemoryPeer, count: u64) {
    let deadline = Instant::now() + WAIT;
    while peer.request_count() < count {
        assert!(Instant::now() < deadline, "peer never received {} requests", count);
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn is_fetching(state: Option<ShardState>) -> bool {
    matches!(state, Some(ShardState::Fetching { .. }))
}

// =============================================================================
// Migration Tests
// =============================================================================

#[test]
fn test_fetched_range_becomes_readable() {
    let mut h = setup_with_peer(fast_config().build(), &[("a", "1"), ("d", "2")]);

    h.commit(vec![Mutation::assign_range(&r("a", "e"), false)]);
    assert!(h.pump_until_readable(&r("a", "e")));

    let version = h.engine.version();
    assert_eq!(
        h.scan(&r("a", "e"), version),
        vec![("a".into(), "1".into()), ("d".into(), "2".into())]
    );
    // Readable only once the transfer version is durable
    match h.engine.shard_state(b"a") {
        Some(ShardState::ReadWrite { readable_since }) => {
            assert!(h.engine.durable_version() >= readable_since)
        }
        other => panic!("expected a read-write shard, got {:?}", other),
    }
    h.engine.check_invariants().unwrap();
}

#[test]
fn test_fetch_replays_mutations_from_the_copy() {
    let mut h = setup_with_peer(fast_config().build(), &[("a", "1"), ("d", "2")]);
    h.peer.pause();

    h.commit(vec![Mutation::assign_range(&r("a", "e"), false)]);
    // The snapshot version is chosen before the first peer request
    wait_for_requests(&h.peer, 1);
    h.commit(vec![Mutation::set("b", "3")]);
    h.commit(vec![Mutation::clear_range("c", "e")]);
    assert!(is_fetching(h.engine.shard_state(b"b")));
    assert!(matches!(h.engine.get(b"b", h.engine.version()), Err(AtlasError::WrongShard)));

    h.peer.resume();
    assert!(h.pump_until_readable(&r("a", "e")));

    let version = h.engine.version();
    assert_eq!(
        h.scan(&r("a", "e"), version),
        vec![("a".into(), "1".into()), ("b".into(), "3".into())]
    );
}

#[test]
fn test_fetch_ignores_peer_rows_outside_range() {
    let mut h = setup_with_peer(fast_config().build(), &[("a", "1"), ("m", "2"), ("z", "3")]);

    h.commit(vec![Mutation::assign_range(&r("k", "n"), false)]);
    assert!(h.pump_until_readable(&r("k", "n")));
    h.engine.flush(WAIT).unwrap();

    assert_eq!(h.committed_user_rows(), vec![("m".into(), "2".into())]);
}

#[test]
fn test_long_copy_splits() {
    let config = fast_config()
        .fetch_block_bytes(8)
        .fetch_iteration_bytes(20)
        .build();
    let rows: Vec<(&'static str, &'static str)> = [
        "k0", "k1", "k2", "k3", "k4", "k5", "k6", "k7", "k8", "k9",
    ]
    .iter()
    .map(|k| (*k, "vvvvvvvv"))
    .collect();
    let mut h = setup_with_peer(config, &rows);

    h.commit(vec![Mutation::assign_range(&r("k", "l"), false)]);
    assert!(h.pump_until_readable(&r("k", "l")));

    let version = h.engine.version();
    let scanned = h.scan(&r("k", "l"), version);
    assert_eq!(scanned.len(), 10);
    assert!(scanned.iter().all(|(_, v)| v == "vvvvvvvv"));
    // One row per block, and every copy stops after two blocks
    assert!(h.peer.request_count() >= 10);
    h.engine.check_invariants().unwrap();
}

#[test]
fn test_peer_failures_are_retried() {
    let mut h = setup_with_peer(fast_config().build(), &[("a", "1")]);
    h.peer.fail_next(3);

    h.commit(vec![Mutation::assign_range(&r("a", "b"), false)]);
    assert!(h.pump_until_readable(&r("a", "b")));

    assert_eq!(h.get("a", h.engine.version()), Some("1".into()));
    assert!(h.peer.request_count() >= 4);
    assert!(h.engine.is_running());
}

#[test]
fn test_empty_block_with_more_rows_is_retried() {
    let mut h = setup_with_peer(fast_config().build(), &[("a", "1"), ("b", "2")]);
    h.peer.empty_next(2);

    h.commit(vec![Mutation::assign_range(&r("a", "c"), false)]);
    assert!(h.pump_until_readable(&r("a", "c")));

    assert_eq!(
        h.scan(&r("a", "c"), h.engine.version()),
        vec![("a".into(), "1".into()), ("b".into(), "2".into())]
    );
    assert!(h.peer.request_count() >= 3);
    assert!(h.engine.is_running());
}

#[test]
fn test_concurrent_fetches() {
    let mut h = setup_with_peer(
        fast_config().fetch_parallelism(1).build(),
        &[("a", "1"), ("g", "2"), ("p", "3")],
    );

    h.commit(vec![
        Mutation::assign_range(&r("a", "c"), false),
        Mutation::assign_range(&r("f", "h"), false),
        Mutation::assign_range(&r("o", "q"), false),
    ]);
    assert!(h.pump_until(|e| {
        [r("a", "c"), r("f", "h"), r("o", "q")]
            .iter()
            .all(|range| e.wait_readable(range, Duration::ZERO))
    }));

    let version = h.engine.version();
    assert_eq!(h.get("a", version), Some("1".into()));
    assert_eq!(h.get("g", version), Some("2".into()));
    assert_eq!(h.get("p", version), Some("3".into()));
}

#[test]
fn test_finished_neighbor_fetch_leaves_shard_alone() {
    let mut h = setup_with_peer(fast_config().build(), &[("n", "2")]);
    h.commit(vec![Mutation::assign_range(&r("a", "m"), true)]);
    h.commit(vec![Mutation::set("b", "1")]);
    let before = h.engine.shards();

    h.commit(vec![Mutation::assign_range(&r("m", "z"), false)]);
    assert!(h.pump_until_readable(&r("m", "z")));

    // [a, m) keeps its own descriptor and availability version
    let old = before.iter().find(|d| d.range == r("a", "m")).unwrap();
    let now = h.engine.shards();
    assert!(now.contains(old));
    let version = h.engine.version();
    assert_eq!(h.get("b", h.engine.oldest_version()), Some("1".into()));
    assert_eq!(
        h.scan(&r("a", "z"), version),
        vec![("b".into(), "1".into()), ("n".into(), "2".into())]
    );
}

// =============================================================================
// Cancellation Tests
// =============================================================================

#[test]
fn test_unassign_cancels_fetch() {
    let mut h = setup_with_peer(fast_config().build(), &[("b", "1"), ("c", "2")]);
    h.peer.pause();
    h.commit(vec![Mutation::assign_range(&r("a", "m"), false)]);
    wait_for_requests(&h.peer, 1);

    h.commit(vec![Mutation::unassign_range(&r("a", "m"))]);
    h.peer.resume();
    for _ in 0..20 {
        h.commit(Vec::new());
    }
    h.engine.flush(WAIT).unwrap();

    assert_eq!(h.engine.shard_state(b"b"), Some(ShardState::Unassigned));
    assert!(matches!(h.engine.get(b"b", h.engine.version()), Err(AtlasError::WrongShard)));
    assert!(h.committed_user_rows().is_empty());
    assert!(h.engine.is_running());
}

#[test]
fn test_partial_unassign_restarts_remainder() {
    let mut h = setup_with_peer(fast_config().build(), &[("b", "1"), ("h", "2")]);
    h.peer.pause();
    h.commit(vec![Mutation::assign_range(&r("a", "m"), false)]);
    wait_for_requests(&h.peer, 1);

    h.commit(vec![Mutation::unassign_range(&r("a", "f"))]);
    h.peer.resume();
    assert!(h.pump_until_readable(&r("f", "m")));

    let version = h.engine.version();
    assert_eq!(h.get("h", version), Some("2".into()));
    assert!(matches!(h.engine.get(b"b", version), Err(AtlasError::WrongShard)));
    h.engine.flush(WAIT).unwrap();
    assert_eq!(h.committed_user_rows(), vec![("h".into(), "2".into())]);
}

#[test]
fn test_reassign_waits_for_dirty_range() {
    let mut h = Harness::assigned(fast_config().build());
    h.commit(vec![Mutation::set("c", "old")]);
    h.commit(vec![Mutation::unassign_range(&r("a", "m"))]);

    h.peer.set("c", "new", 0);
    h.commit(vec![Mutation::assign_range(&r("a", "m"), false)]);
    assert!(h.pump_until_readable(&r("a", "m")));

    assert_eq!(h.get("c", h.engine.version()), Some("new".into()));
}

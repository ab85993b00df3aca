//! Storage Module
//!
//! The durable key-value store the engine persists into, plus the pool
//! that runs durable reads off the caller's thread.
//!
//! ## Responsibilities
//! - `DurableStore`: ordered byte-range store with staged writes and commits
//! - Reads observe staged (uncommitted) writes; a crash keeps committed state only
//! - `ReadPool`: durable reads with a timeout, so no reader blocks forever
//!
//! ## Implementations
//! ```text
//! ┌──────────────┐   in-memory, crash simulation, fault injection
//! │ MemoryStore  │
//! └──────────────┘
//! ┌──────────────┐   BTreeMap image + commit log (wal/) + checkpoints (sstable/)
//! │  FileStore   │   {data_dir}/commit.log, checkpoint_NNNNNN.sst
//! └──────────────┘
//! ```

mod file;
mod memory;
mod pool;
pub mod sstable;

use std::collections::BTreeMap;
use std::ops::Bound;

use crossbeam::channel::Receiver;

use crate::error::{AtlasError, Result};
use crate::types::{Key, KeyRange, KeyValue, RangeResult, Value, KEYSPACE_END};

pub use file::FileStore;
pub use memory::MemoryStore;
pub use pool::ReadPool;

/// Ordered byte-range store the engine makes its state durable in
///
/// Writes are staged until `commit`. Only one writer stages at a time (the
/// engine serializes writers under its durable writer lock); readers may run
/// concurrently.
pub trait DurableStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Value>>;

    /// Rows of `range` in key order; a negative `limit` reads backward from
    /// the end. Stops at `|limit|` rows or once `byte_limit` bytes are
    /// returned, setting `more` if rows remain.
    fn read_range(&self, range: &KeyRange, limit: i64, byte_limit: usize) -> Result<RangeResult>;

    fn set(&self, key: Key, value: Value) -> Result<()>;

    fn clear_range(&self, range: &KeyRange) -> Result<()>;

    /// Make every staged write durable
    fn commit(&self) -> Result<()>;

    /// Background failures; any message received here is fatal to the engine
    fn error_stream(&self) -> Receiver<AtlasError>;
}

/// First user key at or after `key`, as seen by the durable store
pub fn next_user_key(store: &dyn DurableStore, key: &[u8]) -> Result<Option<Key>> {
    if key >= KEYSPACE_END {
        return Ok(None);
    }
    let range = KeyRange::new(Key::copy_from_slice(key), Key::from_static(KEYSPACE_END));
    let rows = store.read_range(&range, 1, usize::MAX)?;
    Ok(rows.rows.into_iter().next().map(|kv| kv.key))
}

// =============================================================================
// BTreeMap helpers shared by the reference stores
// =============================================================================

pub(crate) fn map_read_range(
    map: &BTreeMap<Key, Value>,
    range: &KeyRange,
    limit: i64,
    byte_limit: usize,
) -> RangeResult {
    let mut result = RangeResult::default();
    if range.is_empty() || limit == 0 {
        return result;
    }
    let bounds = (
        Bound::Included(range.begin.clone()),
        Bound::Excluded(range.end.clone()),
    );
    let max_rows = limit.unsigned_abs() as usize;
    let mut bytes = 0;
    let mut take = |key: &Key, value: &Value| -> bool {
        if result.rows.len() >= max_rows || bytes >= byte_limit {
            result.more = true;
            return false;
        }
        bytes += key.len() + value.len();
        result.rows.push(KeyValue::new(key.clone(), value.clone()));
        true
    };
    if limit > 0 {
        for (key, value) in map.range(bounds) {
            if !take(key, value) {
                break;
            }
        }
    } else {
        for (key, value) in map.range(bounds).rev() {
            if !take(key, value) {
                break;
            }
        }
    }
    result
}

pub(crate) fn map_clear_range(map: &mut BTreeMap<Key, Value>, range: &KeyRange) {
    if range.is_empty() {
        return;
    }
    let mut tail = map.split_off(&range.begin);
    let mut kept = tail.split_off(&range.end);
    map.append(&mut kept);
}

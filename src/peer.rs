//! Fetch sources for shard migration
//!
//! A [`PeerSource`] serves a consistent snapshot of a key range at a version,
//! one block at a time.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{AtlasError, Result};
use crate::types::{Key, KeyRange, KeyValue, Value, Version};

/// Rows of one fetch block, ascending by key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchBlock {
    pub rows: Vec<KeyValue>,
    /// Rows remain past the last one returned
    pub more: bool,
}

/// A node that can stream a key range as of some version
pub trait PeerSource: Send + Sync {
    /// Rows of `range` at `version`, up to about `byte_limit` bytes
    fn fetch_block(&self, range: &KeyRange, version: Version, byte_limit: usize) -> Result<FetchBlock>;
}

#[derive(Default)]
struct Faults {
    fail_next: u32,
    empty_next: u32,
    delay: Option<Duration>,
    paused: bool,
}

/// Multi-version in-memory peer with fault injection
pub struct MemoryPeer {
    /// key → (version, value or deletion), ascending by version
    history: Mutex<BTreeMap<Key, Vec<(Version, Option<Value>)>>>,
    faults: Mutex<Faults>,
    resumed: Condvar,
    requests: AtomicU64,
}

impl MemoryPeer {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
            resumed: Condvar::new(),
            requests: AtomicU64::new(0),
        }
    }

    /// Record `key = value` from `version` on
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>, version: Version) {
        self.history
            .lock()
            .entry(key.into())
            .or_default()
            .push((version, Some(value.into())));
    }

    /// Record the deletion of every key in `range` from `version` on
    pub fn clear(&self, range: &KeyRange, version: Version) {
        let mut history = self.history.lock();
        for (_, versions) in history.range_mut((
            Bound::Included(range.begin.clone()),
            Bound::Excluded(range.end.clone()),
        )) {
            versions.push((version, None));
        }
    }

    /// Fail the next `count` requests
    pub fn fail_next(&self, count: u32) {
        self.faults.lock().fail_next = count;
    }

    /// Answer the next `count` requests with an empty block that claims
    /// more rows
    pub fn empty_next(&self, count: u32) {
        self.faults.lock().empty_next = count;
    }

    /// Sleep this long before answering each request
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.faults.lock().delay = delay;
    }

    /// Hold every request until `resume`
    pub fn pause(&self) {
        self.faults.lock().paused = true;
    }

    pub fn resume(&self) {
        self.faults.lock().paused = false;
        self.resumed.notify_all();
    }

    /// Requests served or failed so far
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Default for MemoryPeer {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerSource for MemoryPeer {
    fn fetch_block(&self, range: &KeyRange, version: Version, byte_limit: usize) -> Result<FetchBlock> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let delay = {
            let mut faults = self.faults.lock();
            while faults.paused {
                self.resumed.wait(&mut faults);
            }
            if faults.fail_next > 0 {
                faults.fail_next -= 1;
                return Err(AtlasError::FetchFailed(format!(
                    "injected peer failure for {:?}",
                    range
                )));
            }
            if faults.empty_next > 0 {
                faults.empty_next -= 1;
                return Ok(FetchBlock {
                    rows: Vec::new(),
                    more: true,
                });
            }
            faults.delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let history = self.history.lock();
        let mut block = FetchBlock::default();
        let mut bytes = 0;
        for (key, versions) in history.range((
            Bound::Included(range.begin.clone()),
            Bound::Excluded(range.end.clone()),
        )) {
            let visible = versions
                .iter()
                .rev()
                .find(|(v, _)| *v <= version)
                .and_then(|(_, value)| value.clone());
            let Some(value) = visible else { continue };
            if !block.rows.is_empty() && bytes >= byte_limit {
                block.more = true;
                break;
            }
            bytes += key.len() + value.len();
            block.rows.push(KeyValue::new(key.clone(), value));
        }
        Ok(block)
    }
}

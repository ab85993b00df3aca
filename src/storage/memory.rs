//! In-memory durable store
//!
//! Keeps a committed image and a working image (committed plus staged
//! writes). `crash()` throws the working image away, which is exactly what a
//! process crash does to a real store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use super::{map_clear_range, map_read_range, DurableStore};
use crate::error::{AtlasError, Result};
use crate::types::{Key, KeyRange, KeyValue, RangeResult, Value};

enum Staged {
    Set(Key, Value),
    Clear(KeyRange),
}

#[derive(Default)]
struct Images {
    committed: BTreeMap<Key, Value>,
    working: BTreeMap<Key, Value>,
    staged: Vec<Staged>,
}

#[derive(Default)]
struct Faults {
    fail_commits: bool,
    commit_delay: Option<Duration>,
}

/// Durable store held entirely in memory
pub struct MemoryStore {
    images: RwLock<Images>,
    faults: Mutex<Faults>,
    commits: AtomicU64,
    error_tx: Sender<AtlasError>,
    error_rx: Receiver<AtlasError>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (error_tx, error_rx) = unbounded();
        Self {
            images: RwLock::new(Images::default()),
            faults: Mutex::new(Faults::default()),
            commits: AtomicU64::new(0),
            error_tx,
            error_rx,
        }
    }

    /// Lose every write staged since the last commit
    pub fn crash(&self) {
        let mut images = self.images.write();
        images.working = images.committed.clone();
        images.staged.clear();
    }

    /// Committed rows in key order
    pub fn committed_rows(&self) -> Vec<KeyValue> {
        self.images
            .read()
            .committed
            .iter()
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
            .collect()
    }

    /// Number of successful commits so far
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Fault Injection
    // =========================================================================

    /// Make every following commit fail with a storage error
    pub fn fail_commits(&self, fail: bool) {
        self.faults.lock().fail_commits = fail;
    }

    /// Delay every following commit
    pub fn set_commit_delay(&self, delay: Option<Duration>) {
        self.faults.lock().commit_delay = delay;
    }

    /// Report a background failure on the error stream
    pub fn inject_error(&self, error: AtlasError) {
        let _ = self.error_tx.send(error);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        Ok(self.images.read().working.get(key).cloned())
    }

    fn read_range(&self, range: &KeyRange, limit: i64, byte_limit: usize) -> Result<RangeResult> {
        Ok(map_read_range(&self.images.read().working, range, limit, byte_limit))
    }

    fn set(&self, key: Key, value: Value) -> Result<()> {
        let mut images = self.images.write();
        images.working.insert(key.clone(), value.clone());
        images.staged.push(Staged::Set(key, value));
        Ok(())
    }

    fn clear_range(&self, range: &KeyRange) -> Result<()> {
        let mut images = self.images.write();
        map_clear_range(&mut images.working, range);
        images.staged.push(Staged::Clear(range.clone()));
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let (fail, delay) = {
            let faults = self.faults.lock();
            (faults.fail_commits, faults.commit_delay)
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if fail {
            return Err(AtlasError::Storage("injected commit failure".to_string()));
        }

        let mut images = self.images.write();
        let staged = std::mem::take(&mut images.staged);
        for write in staged {
            match write {
                Staged::Set(key, value) => {
                    images.committed.insert(key, value);
                }
                Staged::Clear(range) => map_clear_range(&mut images.committed, &range),
            }
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn error_stream(&self) -> Receiver<AtlasError> {
        self.error_rx.clone()
    }
}

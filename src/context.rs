//! Engine context
//!
//! The single object every component receives. It owns the shared
//! structures and the synchronization between the update applier, the
//! durability loop, fetches and readers.
//!
//! ## Lock Order
//! ```text
//! writer_lock ──▶ floors ──▶ mutation log
//!      │
//!      └────────▶ shards ──▶ fetch budget
//! ```
//! A thread holding a lock on the right never waits for one on its left.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::error;

use crate::config::Config;
use crate::error::{AtlasError, Result};
use crate::mvcc::VersionedStore;
use crate::peer::PeerSource;
use crate::shard::ShardTable;
use crate::storage::{DurableStore, ReadPool};
use crate::types::{Key, Value, Version};
use crate::update::MutationLog;

// =============================================================================
// Version Watch
// =============================================================================

/// A published version that threads can wait on
pub struct VersionWatch {
    value: Mutex<Version>,
    changed: Condvar,
    closed: AtomicBool,
}

impl VersionWatch {
    pub fn new(version: Version) -> Self {
        Self {
            value: Mutex::new(version),
            changed: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn get(&self) -> Version {
        *self.value.lock()
    }

    /// Publish `version` if it moves the watch forward
    pub fn advance(&self, version: Version) {
        let mut value = self.value.lock();
        if version > *value {
            *value = version;
            self.changed.notify_all();
        }
    }

    /// Publish `version` unconditionally (rollback)
    pub fn reset(&self, version: Version) {
        *self.value.lock() = version;
        self.changed.notify_all();
    }

    /// Wait until the watch reaches `version`; false on timeout or close
    pub fn wait_at_least(&self, version: Version, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut value = self.value.lock();
        while *value < version {
            if self.closed.load(Ordering::SeqCst) {
                return false;
            }
            if self.changed.wait_until(&mut value, deadline).timed_out() {
                return *value >= version;
            }
        }
        true
    }

    /// Wake every waiter for good
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _guard = self.value.lock();
        self.changed.notify_all();
    }
}

// =============================================================================
// Floors and Reader Pins
// =============================================================================

#[derive(Debug, Default)]
struct FloorState {
    oldest: Version,
    /// version → readers pinned at it
    pins: BTreeMap<Version, usize>,
}

/// `oldestVersion` together with reader pins, under one lock
///
/// A reader either pins before the floor moves past it, or sees the new
/// floor and fails with `TransactionTooOld`.
pub struct Floors {
    state: Mutex<FloorState>,
}

impl Floors {
    pub fn new(oldest: Version) -> Self {
        Self {
            state: Mutex::new(FloorState {
                oldest,
                pins: BTreeMap::new(),
            }),
        }
    }

    pub fn oldest(&self) -> Version {
        self.state.lock().oldest
    }

    /// Keep `version` readable until the returned pin drops
    pub fn pin(&self, version: Version) -> Result<ReadPin<'_>> {
        let mut state = self.state.lock();
        if version < state.oldest {
            return Err(AtlasError::TransactionTooOld {
                requested: version,
                oldest: state.oldest,
            });
        }
        *state.pins.entry(version).or_insert(0) += 1;
        Ok(ReadPin {
            floors: self,
            version,
        })
    }

    pub fn min_pin(&self) -> Option<Version> {
        self.state.lock().pins.keys().next().copied()
    }

    /// Move the floor toward `candidate`, never past a pin; returns the floor
    ///
    /// `choose` maps the pin-clamped candidate to the floor actually used
    /// (the durability loop rounds it down to whole drained versions).
    pub fn advance(&self, candidate: Version, choose: impl FnOnce(Version) -> Version) -> Version {
        let mut state = self.state.lock();
        let clamped = match state.pins.keys().next() {
            Some(&pin) => candidate.min(pin),
            None => candidate,
        };
        let chosen = choose(clamped.max(state.oldest));
        if chosen > state.oldest {
            state.oldest = chosen;
        }
        state.oldest
    }

    /// Rollback: the floor moves back with the version
    pub fn reset(&self, oldest: Version) {
        self.state.lock().oldest = oldest;
    }

    fn unpin(&self, version: Version) {
        let mut state = self.state.lock();
        if let Some(count) = state.pins.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                state.pins.remove(&version);
            }
        }
    }
}

/// Reader pin on a version
pub struct ReadPin<'a> {
    floors: &'a Floors,
    version: Version,
}

impl ReadPin<'_> {
    pub fn version(&self) -> Version {
        self.version
    }
}

impl Drop for ReadPin<'_> {
    fn drop(&mut self) {
        self.floors.unpin(self.version);
    }
}

// =============================================================================
// Fetch Budget and Parallelism
// =============================================================================

#[derive(Debug, Default)]
struct BudgetState {
    in_use: usize,
    /// Bytes written into the durable store but not yet committed
    uncommitted: usize,
}

/// Global budget of fetched bytes not yet committed
pub struct FetchBudget {
    capacity: usize,
    state: Mutex<BudgetState>,
    freed: Condvar,
}

impl FetchBudget {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(BudgetState::default()),
            freed: Condvar::new(),
        }
    }

    /// Reserve `bytes`, waiting at most `timeout`; false on timeout
    ///
    /// A request larger than the whole budget is granted once nothing else
    /// is outstanding.
    pub fn acquire(&self, bytes: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.in_use > 0 && state.in_use + bytes > self.capacity {
            if self.freed.wait_until(&mut state, deadline).timed_out() {
                return false;
            }
        }
        state.in_use += bytes;
        true
    }

    /// Return bytes that were reserved but never written
    pub fn release(&self, bytes: usize) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(bytes);
        self.freed.notify_all();
    }

    /// Reserved bytes are now staged in the durable store
    pub fn record_written(&self, bytes: usize) {
        self.state.lock().uncommitted += bytes;
    }

    /// Staged bytes the next commit covers; caller holds the writer lock
    pub fn take_uncommitted(&self) -> usize {
        std::mem::take(&mut self.state.lock().uncommitted)
    }

    pub fn uncommitted(&self) -> usize {
        self.state.lock().uncommitted
    }

    pub fn in_use(&self) -> usize {
        self.state.lock().in_use
    }
}

/// Counting semaphore bounding simultaneous block streaming
pub struct Semaphore {
    permits: Mutex<usize>,
    returned: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            returned: Condvar::new(),
        }
    }

    /// Take a permit, waiting at most `timeout`
    pub fn acquire(&self, timeout: Duration) -> Option<SemaphorePermit<'_>> {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.returned.wait_until(&mut permits, deadline).timed_out() && *permits == 0 {
                return None;
            }
        }
        *permits -= 1;
        Some(SemaphorePermit { semaphore: self })
    }
}

pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        *self.semaphore.permits.lock() += 1;
        self.semaphore.returned.notify_one();
    }
}

// =============================================================================
// Engine Context
// =============================================================================

/// Shared state of one storage engine instance
pub struct EngineContext {
    pub config: Config,

    // -------------------------------------------------------------------------
    // Data structures
    // -------------------------------------------------------------------------
    pub store: VersionedStore,
    pub log: Mutex<MutationLog>,
    pub shards: RwLock<ShardTable>,
    pub durable: Arc<dyn DurableStore>,
    pub peer: Arc<dyn PeerSource>,
    pub read_pool: ReadPool,

    // -------------------------------------------------------------------------
    // Versions
    // -------------------------------------------------------------------------
    /// Latest fully applied version
    pub version: VersionWatch,
    /// Latest version whose mutations are committed to the durable store
    pub durable_version: VersionWatch,
    /// `oldestVersion` and reader pins
    pub floors: Floors,
    /// Floor the durability loop works toward
    pub desired_oldest: AtomicU64,
    /// Floor requested by `Engine::flush`
    pub flush_target: AtomicU64,

    // -------------------------------------------------------------------------
    // Coordination
    // -------------------------------------------------------------------------
    /// Serializes every write into the durable store
    pub writer_lock: Mutex<()>,
    pub fetch_budget: FetchBudget,
    pub fetch_slots: Semaphore,
    /// `(keys, floor)` batches the applier reclaims at its next batch
    pub reclaim: Mutex<Vec<(Vec<Key>, Version)>>,
    pub reads_in_flight: AtomicUsize,
    pub cluster_config: RwLock<BTreeMap<String, Value>>,

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------
    shutdown: AtomicBool,
    fatal: Mutex<Option<String>>,
    fatal_tx: Sender<AtlasError>,
    fatal_rx: Receiver<AtlasError>,
}

impl EngineContext {
    pub fn new(
        config: Config,
        version: Version,
        shards: ShardTable,
        durable: Arc<dyn DurableStore>,
        peer: Arc<dyn PeerSource>,
    ) -> Result<Self> {
        let read_pool = ReadPool::new(config.read_pool_threads)?;
        let (fatal_tx, fatal_rx) = unbounded();
        Ok(Self {
            store: VersionedStore::new(version),
            log: Mutex::new(MutationLog::new()),
            shards: RwLock::new(shards),
            durable,
            peer,
            read_pool,
            version: VersionWatch::new(version),
            durable_version: VersionWatch::new(version),
            floors: Floors::new(version),
            desired_oldest: AtomicU64::new(version),
            flush_target: AtomicU64::new(0),
            writer_lock: Mutex::new(()),
            fetch_budget: FetchBudget::new(config.fetch_budget_bytes),
            fetch_slots: Semaphore::new(config.fetch_parallelism),
            reclaim: Mutex::new(Vec::new()),
            reads_in_flight: AtomicUsize::new(0),
            cluster_config: RwLock::new(BTreeMap::new()),
            shutdown: AtomicBool::new(false),
            fatal: Mutex::new(None),
            fatal_tx,
            fatal_rx,
            config,
        })
    }

    pub fn oldest_version(&self) -> Version {
        self.floors.oldest()
    }

    /// Take the durable writer lock
    pub fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer_lock.lock()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn is_stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Ask every loop to stop and wake all waiters
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.version.close();
        self.durable_version.close();
    }

    /// Record a fatal error and stop the engine; only the first one is kept
    pub fn fail(&self, err: AtlasError) {
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_some() {
                return;
            }
            error!(error = %err, "fatal engine error, stopping");
            *fatal = Some(err.to_string());
        }
        let _ = self.fatal_tx.send(err);
        self.stop();
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().clone()
    }

    pub fn fatal_events(&self) -> Receiver<AtlasError> {
        self.fatal_rx.clone()
    }

    /// Error to hand callers once the engine stops
    pub fn stopped_error(&self) -> AtlasError {
        match self.fatal_error() {
            Some(msg) => AtlasError::Stopped(msg),
            None => AtlasError::ShuttingDown,
        }
    }
}

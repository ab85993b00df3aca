//! Engine Module
//!
//! Opens the storage engine over its collaborators and owns the threads
//! that run it.
//!
//! ## Responsibilities
//! - Restore persisted state and rebuild the shard table
//! - Position the log cursor just past the durable version
//! - Run the update applier, the durability loop and restored fetches
//! - Serve versioned reads
//! - Surface the first fatal error and stop
//!
//! ## Threads
//! ```text
//! update-applier ──┐                      ┌── read-pool-N (durable reads)
//! durability-loop ─┼── Arc<EngineContext> ┤
//! fetch-N ─────────┘                      └── durable-commit
//! ```

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::context::EngineContext;
use crate::durability::DurabilityLoop;
use crate::error::{AtlasError, Result};
use crate::fetch;
use crate::mvcc::{StoreStats, VersionedView};
use crate::peer::PeerSource;
use crate::persist;
use crate::read;
use crate::shard::{ShardDescriptor, ShardState, ShardTable};
use crate::storage::{DurableStore, FileStore};
use crate::tlog::LogCursor;
use crate::types::{KeyRange, RangeResult, Value, Version};
use crate::update::UpdateApplier;

/// A running storage engine
///
/// ## Concurrency Model
///
/// - **Applier**: the only writer of the in-memory index and the mutation log
/// - **Durability loop**: the only thread moving floors forward
/// - **Fetches**: write blocks straight into the durable store
/// - **Readers**: any thread; reads pin their version and never block the
///   writers
///
/// All durable-store writes are serialized by the context's writer lock.
pub struct Engine {
    ctx: Arc<EngineContext>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Open an engine over the given durable store, log cursor and peer
    ///
    /// On startup:
    /// 1. Validate the configuration
    /// 2. Restore (or initialize) persisted metadata
    /// 3. Rebuild the shard table from the persisted range maps
    /// 4. Restart the log cursor after the durable version
    /// 5. Start the applier, the durability loop and pending fetches
    pub fn open(
        config: Config,
        durable: Arc<dyn DurableStore>,
        mut cursor: Box<dyn LogCursor>,
        peer: Arc<dyn PeerSource>,
    ) -> Result<Self> {
        // Step 1: Validate
        config.validate()?;

        // Step 2: Restore persisted state
        let restored = persist::restore(durable.as_ref(), config.node_id)?;

        // Step 3: Rebuild the shard table
        let (table, fetches) = ShardTable::from_persisted(&restored.shards, restored.version, 0, 1);
        table.check_invariants()?;

        // Step 4: Replay the log from just past the durable version
        cursor.restart_from(restored.version + 1)?;

        let ctx = Arc::new(EngineContext::new(config, restored.version, table, durable, peer)?);
        info!(
            node_id = ctx.config.node_id,
            version = restored.version,
            shards = ctx.shards.read().len(),
            fetches = fetches.len(),
            "engine opened"
        );

        // Step 5: Start the loops
        let mut threads = Vec::with_capacity(2);
        threads.push(UpdateApplier::new(ctx.clone(), cursor).spawn()?);
        threads.push(DurabilityLoop::new(ctx.clone())?.spawn()?);
        for id in fetches {
            fetch::spawn(&ctx, id)?;
        }

        Ok(Self {
            ctx,
            threads: Mutex::new(threads),
        })
    }

    /// Open over a [`FileStore`] rooted at `config.data_dir`
    pub fn open_file(config: Config, cursor: Box<dyn LogCursor>, peer: Arc<dyn PeerSource>) -> Result<Self> {
        let durable = Arc::new(FileStore::open_with_config(&config)?);
        Self::open(config, durable, cursor, peer)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Value of `key` as of `version`
    pub fn get(&self, key: &[u8], version: Version) -> Result<Option<Value>> {
        read::get(&self.ctx, key, version)
    }

    /// Rows of `range` as of `version`
    ///
    /// A negative `limit` reads backward from the end of the range. The
    /// read is clamped to the readable shards around its start; `more` is set
    /// when rows may remain.
    pub fn get_range(
        &self,
        range: &KeyRange,
        version: Version,
        limit: i64,
        byte_limit: usize,
    ) -> Result<RangeResult> {
        read::get_range(&self.ctx, range, version, limit, byte_limit)
    }

    // =========================================================================
    // Versions
    // =========================================================================

    /// Latest applied version
    pub fn version(&self) -> Version {
        self.ctx.version.get()
    }

    pub fn durable_version(&self) -> Version {
        self.ctx.durable_version.get()
    }

    /// Oldest version still readable
    pub fn oldest_version(&self) -> Version {
        self.ctx.oldest_version()
    }

    /// Wait until `version` is applied; false on timeout
    pub fn wait_for_version(&self, version: Version, timeout: Duration) -> bool {
        self.ctx.version.wait_at_least(version, timeout)
    }

    /// Wait until `version` is durable; false on timeout
    pub fn wait_for_durable(&self, version: Version, timeout: Duration) -> bool {
        self.ctx.durable_version.wait_at_least(version, timeout)
    }

    /// Make everything applied so far durable
    pub fn flush(&self, timeout: Duration) -> Result<Version> {
        let version = self.ctx.version.get();
        self.ctx
            .flush_target
            .fetch_max(version, std::sync::atomic::Ordering::SeqCst);
        if self.ctx.durable_version.wait_at_least(version, timeout) {
            return Ok(version);
        }
        if self.ctx.is_stopping() {
            return Err(self.ctx.stopped_error());
        }
        Err(AtlasError::Timeout(format!("flush to version {}", version)))
    }

    // =========================================================================
    // Shards
    // =========================================================================

    /// State of the shard holding `key`
    pub fn shard_state(&self, key: &[u8]) -> Option<ShardState> {
        self.ctx.shards.read().descriptor_at(key).map(|d| d.state)
    }

    pub fn shards(&self) -> Vec<ShardDescriptor> {
        self.ctx.shards.read().descriptors().cloned().collect()
    }

    /// Wait until every shard overlapping `range` serves reads; false on timeout
    pub fn wait_readable(&self, range: &KeyRange, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let readable = {
                let table = self.ctx.shards.read();
                let pieces = table.pieces(range);
                !pieces.is_empty()
                    && pieces
                        .iter()
                        .all(|(_, state)| matches!(state, ShardState::ReadWrite { .. }))
            };
            if readable {
                return true;
            }
            let now = Instant::now();
            if now >= deadline || self.ctx.is_stopping() {
                return false;
            }
            let durable = self.ctx.durable_version.get();
            self.ctx
                .durable_version
                .wait_at_least(durable + 1, (deadline - now).min(Duration::from_millis(10)));
        }
    }

    /// Cluster configuration value set through the mutation stream
    pub fn cluster_config(&self, name: &str) -> Option<Value> {
        self.ctx.cluster_config.read().get(name).cloned()
    }

    // =========================================================================
    // Introspection (for testing and debugging)
    // =========================================================================

    /// Memory-only view at `version`
    pub fn memory_view(&self, version: Version) -> Option<VersionedView> {
        self.ctx.store.view(version)
    }

    pub fn store_stats(&self) -> StoreStats {
        self.ctx.store.stats()
    }

    /// Versions and bytes waiting in the mutation log
    pub fn mutation_log_size(&self) -> (usize, usize) {
        let log = self.ctx.log.lock();
        (log.len(), log.bytes())
    }

    /// Check the in-memory index and the shard table
    pub fn check_invariants(&self) -> Result<()> {
        self.ctx.store.check_invariants()?;
        self.ctx.shards.read().check_invariants()
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// First fatal error, if the engine stopped on one
    pub fn fatal_error(&self) -> Option<String> {
        self.ctx.fatal_error()
    }

    /// Wait for a fatal error; `None` on timeout
    pub fn wait_fatal(&self, timeout: Duration) -> Option<AtlasError> {
        self.ctx.fatal_events().recv_timeout(timeout).ok()
    }

    pub fn is_running(&self) -> bool {
        !self.ctx.is_stopping()
    }

    /// Stop every loop and wait for the applier and durability threads
    pub fn shutdown(&self) {
        self.ctx.stop();
        let threads = std::mem::take(&mut *self.threads.lock());
        if threads.is_empty() {
            return;
        }
        for handle in threads {
            if handle.join().is_err() {
                warn!("engine thread panicked during shutdown");
            }
        }
        info!(
            version = self.ctx.version.get(),
            durable = self.ctx.durable_version.get(),
            "engine stopped"
        );
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

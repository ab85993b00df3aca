//! UpdateApplier
//!
//! Consumes the ordered mutation stream and turns each batch into a new
//! version of the in-memory index.
//!
//! ## Batch Steps
//! ```text
//! cursor ──▶ skip if applied ──▶ durability lag wait ──▶ create version v
//!        ──▶ reclaim durable entries ──▶ transfer completed fetches at v
//!        ──▶ eager reads ──▶ control + data mutations ──▶ publish v
//! ```
//! Publishing `v` is the only point that releases readers waiting for it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use super::eager::{EagerReads, EagerResults};
use crate::context::EngineContext;
use crate::error::{AtlasError, Result};
use crate::fetch;
use crate::mutation::{apply_atomic, ControlMutation, Expanded, Mutation};
use crate::mvcc::Lookup;
use crate::persist;
use crate::shard::{FetchId, FetchPhase, ShardState, ShardTable, Transfer};
use crate::tlog::{LogCursor, LogMessage};
use crate::types::{printable, Key, KeyRange, Value, Version, KEYSPACE_END};

/// What `apply_batch` did with a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Applied,
    /// Version already applied
    Skipped,
    /// Batch carried an epoch end; state was rolled back to the durable version
    RolledBack,
}

pub struct UpdateApplier {
    ctx: Arc<EngineContext>,
    cursor: Box<dyn LogCursor>,
}

impl UpdateApplier {
    pub fn new(ctx: Arc<EngineContext>, cursor: Box<dyn LogCursor>) -> Self {
        Self { ctx, cursor }
    }

    /// Run the applier on its own thread until the engine stops
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name("update-applier".to_string())
            .spawn(move || self.run())?;
        Ok(handle)
    }

    pub fn run(mut self) {
        info!(version = self.ctx.version.get(), "update applier started");
        let poll = self.ctx.config.log_poll_interval();
        while !self.ctx.is_stopping() {
            let message = match self.cursor.next(poll) {
                Ok(Some(message)) => message,
                Ok(None) => {
                    self.cursor.advance_to(self.ctx.durable_version.get());
                    continue;
                }
                Err(e) => {
                    self.ctx.fail(e);
                    break;
                }
            };
            let result = match message {
                LogMessage::Skip { version } => {
                    debug!(version, "skipping log message");
                    Ok(BatchOutcome::Skipped)
                }
                LogMessage::Batch { version, mutations } => self.apply_batch(version, mutations),
            };
            match result {
                Ok(_) => self.cursor.advance_to(self.ctx.durable_version.get()),
                Err(_) if self.ctx.is_stopping() => break,
                Err(e) => {
                    self.ctx.fail(e);
                    break;
                }
            }
        }
        info!(version = self.ctx.version.get(), "update applier stopped");
    }

    /// Apply one batch at `version`
    pub fn apply_batch(&mut self, version: Version, mutations: Vec<Mutation>) -> Result<BatchOutcome> {
        let current = self.ctx.version.get();
        if version <= current {
            debug!(version, current, "batch already applied, skipping");
            return Ok(BatchOutcome::Skipped);
        }

        self.wait_for_durability_lag(version, current)?;
        self.ctx.store.create_new_version(version)?;
        self.reclaim();

        let transfers = self.begin_transfers(version)?;

        let mut eager = EagerReads::new();
        for (transfer, _) in &transfers {
            for (_, m) in &transfer.backlog {
                eager.add(m);
            }
        }
        for m in mutations.iter().filter(|m| !m.is_private()) {
            eager.add(m);
        }
        let eager = eager.run(&self.ctx)?;

        for (transfer, markers) in transfers {
            self.replay_transfer(transfer, version, &eager)?;
            self.append_all(version, markers)?;
        }

        let count = mutations.len();
        for mutation in mutations {
            if mutation.is_private() {
                match ControlMutation::decode(&mutation)? {
                    ControlMutation::Assign {
                        range,
                        assigned: true,
                        known_empty,
                    } => self.assign(&range, known_empty, version)?,
                    ControlMutation::Assign { range, .. } => self.unassign(&range, version)?,
                    ControlMutation::EpochEnd { target } => {
                        self.rollback(target)?;
                        return Ok(BatchOutcome::RolledBack);
                    }
                    ControlMutation::SetConfig { name, value } => self.set_config(name, value),
                }
            } else {
                mutation.validate_data()?;
                self.route(mutation, version, &eager)?;
            }
        }

        self.ctx.version.advance(version);
        let retained = version.saturating_sub(self.ctx.config.retention_versions);
        let desired = self.ctx.oldest_version().max(retained);
        self.ctx.desired_oldest.fetch_max(desired, Ordering::SeqCst);
        debug!(version, mutations = count, "batch applied");
        Ok(BatchOutcome::Applied)
    }

    // =========================================================================
    // Batch Preparation
    // =========================================================================

    /// Block while `version` would run too far ahead of the durable version
    fn wait_for_durability_lag(&self, version: Version, current: Version) -> Result<()> {
        let lag = self.ctx.config.max_version_lag;
        if version <= lag {
            return Ok(());
        }
        // The durability loop never passes the published version
        let needed = (version - lag).min(current);
        if self.ctx.durable_version.get() >= needed {
            return Ok(());
        }
        warn!(
            version,
            durable = self.ctx.durable_version.get(),
            needed,
            "applier blocked on durability lag"
        );
        self.ctx.flush_target.fetch_max(needed, Ordering::SeqCst);
        let poll = self.ctx.config.log_poll_interval();
        while !self.ctx.durable_version.wait_at_least(needed, poll) {
            if self.ctx.is_stopping() {
                return Err(self.ctx.stopped_error());
            }
        }
        Ok(())
    }

    /// Drop latest-root entries the durable store now answers for
    fn reclaim(&self) {
        let batches = std::mem::take(&mut *self.ctx.reclaim.lock());
        let mut removed = 0;
        for (keys, floor) in &batches {
            removed += self.ctx.store.reclaim(keys, *floor);
        }
        if removed > 0 {
            debug!(removed, batches = batches.len(), "reclaimed durable entries");
        }
    }

    /// Move every completed fetch to `Waiting` at `version`
    fn begin_transfers(&self, version: Version) -> Result<Vec<(Transfer, Vec<Mutation>)>> {
        let mut table = self.ctx.shards.write();
        let mut transfers = Vec::new();
        for id in table.completed_fetches() {
            if let Some(transfer) = table.begin_transfer(id, version) {
                let markers = persist::shard_marker_mutations(&table, &transfer.range);
                transfers.push((transfer, markers));
            }
        }
        if !transfers.is_empty() {
            table.check_invariants()?;
        }
        Ok(transfers)
    }

    /// Replace the range's memory with its fetched copy plus the replayed backlog
    fn replay_transfer(&self, transfer: Transfer, version: Version, eager: &EagerResults) -> Result<()> {
        self.ctx.store.erase_range(&transfer.range);
        let backlog = transfer.backlog.len();
        for (_, mutation) in transfer.backlog {
            self.apply_data(mutation, &transfer.range, version, eager)?;
        }
        info!(
            fetch = transfer.fetch,
            range = ?transfer.range,
            version,
            backlog,
            "fetch transferred"
        );
        Ok(())
    }

    // =========================================================================
    // Data Mutations
    // =========================================================================

    /// Apply, buffer or drop each shard's piece of `mutation`
    fn route(&self, mutation: Mutation, version: Version, eager: &EagerResults) -> Result<()> {
        let range = match &mutation {
            Mutation::Set { key, .. } | Mutation::Atomic { key, .. } => KeyRange::single(key),
            Mutation::ClearRange { begin, end } => KeyRange::new(begin.clone(), end.clone()),
        };
        if range.is_empty() {
            return Ok(());
        }

        let mut applied = Vec::new();
        {
            let mut table = self.ctx.shards.write();
            for (piece, state) in table.pieces(&range) {
                let Some(clipped) = mutation.clipped_to(&piece) else {
                    continue;
                };
                match state {
                    ShardState::ReadWrite { .. } | ShardState::Waiting { .. } => {
                        let bound = table
                            .descriptor_at(&piece.begin)
                            .map_or_else(|| piece.clone(), |d| d.range.clone());
                        applied.push((clipped, bound));
                    }
                    ShardState::Fetching { fetch } => table.buffer(fetch, version, clipped),
                    ShardState::Unassigned => {}
                }
            }
        }

        for (clipped, bound) in applied {
            self.apply_data(clipped, &bound, version, eager)?;
        }
        Ok(())
    }

    /// Expand `mutation` and apply it to memory and the mutation log
    ///
    /// `bound` is the shard the mutation lies in; clear extensions stay
    /// inside it.
    fn apply_data(
        &self,
        mutation: Mutation,
        bound: &KeyRange,
        version: Version,
        eager: &EagerResults,
    ) -> Result<()> {
        match mutation {
            Mutation::Set { key, value } => self.apply_set(key, value, version),
            Mutation::ClearRange { begin, end } => {
                if begin >= end {
                    return Ok(());
                }
                let end = self.extend_clear(end, bound, eager);
                self.apply_clear(KeyRange::new(begin, end), version)
            }
            Mutation::Atomic { op, key, param } => {
                let prior = self.prior_value(&key, eager)?;
                match apply_atomic(op, prior.as_deref(), &param) {
                    Expanded::Set(value) => self.apply_set(key, value, version),
                    Expanded::Clear => self.apply_clear(KeyRange::single(&key), version),
                    Expanded::Unchanged => Ok(()),
                }
            }
        }
    }

    fn apply_set(&self, key: Key, value: Value, version: Version) -> Result<()> {
        self.ctx.store.set(key.clone(), value.clone(), version)?;
        self.ctx.log.lock().append(version, Mutation::Set { key, value })
    }

    fn apply_clear(&self, range: KeyRange, version: Version) -> Result<()> {
        self.ctx.store.clear(&range, version)?;
        self.ctx.log.lock().append(
            version,
            Mutation::ClearRange {
                begin: range.begin,
                end: range.end,
            },
        )
    }

    /// Value an atomic operation sees: memory first, then the eager read
    ///
    /// Every atomic key of the batch was read eagerly; a key without a
    /// result means the batch was expanded from the wrong mutation set.
    fn prior_value(&self, key: &Key, eager: &EagerResults) -> Result<Option<Value>> {
        match self.ctx.store.latest().get(key) {
            Lookup::Value(value) => Ok(Some(value)),
            Lookup::Cleared => Ok(None),
            Lookup::Missing => match eager.value(key) {
                Some(value) => Ok(value.cloned()),
                None => Err(AtlasError::InvariantViolation(format!(
                    "atomic operation on {} without an eager read",
                    printable(key)
                ))),
            },
        }
    }

    /// Stretch a clear's end over keys that exist neither in memory nor on disk
    ///
    /// Adjacent clears then merge into one entry.
    fn extend_clear(&self, end: Key, bound: &KeyRange, eager: &EagerResults) -> Key {
        if end >= bound.end {
            return end;
        }
        let disk_next = match eager.next_key(&end) {
            Some(Some(next)) => next.clone(),
            Some(None) => Key::from_static(KEYSPACE_END),
            None => return end,
        };
        let memory_next = self
            .ctx
            .store
            .latest()
            .next_entry_key(&end)
            .unwrap_or_else(|| Key::from_static(KEYSPACE_END));
        disk_next.min(memory_next).min(bound.end.clone()).max(end)
    }

    fn append_all(&self, version: Version, mutations: Vec<Mutation>) -> Result<()> {
        let mut log = self.ctx.log.lock();
        for mutation in mutations {
            log.append(version, mutation)?;
        }
        Ok(())
    }

    // =========================================================================
    // Control Mutations
    // =========================================================================

    fn assign(&self, range: &KeyRange, known_empty: bool, version: Version) -> Result<()> {
        let (fetches, markers) = {
            let mut table = self.ctx.shards.write();
            let fetches = table.assign(range, known_empty, version);
            table.check_invariants()?;
            (fetches, persist::shard_marker_mutations(&table, range))
        };
        self.append_all(version, markers)?;
        info!(range = ?range, known_empty, version, fetches = fetches.len(), "range assigned");
        self.start_fetches(fetches)
    }

    fn unassign(&self, range: &KeyRange, version: Version) -> Result<()> {
        let (outcome, markers) = {
            let mut table = self.ctx.shards.write();
            let outcome = table.unassign(range, version);
            table.check_invariants()?;
            (outcome, persist::shard_marker_mutations(&table, range))
        };

        for piece in &outcome.cleared {
            self.apply_clear(piece.clone(), version)?;
        }
        if !outcome.cancelled.is_empty() {
            // No block lands after this clear: fetches check their flag under the same lock
            let _writer = self.ctx.lock_writer();
            for (piece, handle) in &outcome.cancelled {
                if handle.wrote() {
                    self.ctx.durable.clear_range(piece)?;
                }
                info!(fetch = handle.id, range = ?piece, version, "fetch cancelled");
            }
        }
        self.append_all(version, markers)?;
        info!(
            range = ?range,
            version,
            cleared = outcome.cleared.len(),
            cancelled = outcome.cancelled.len(),
            restarted = outcome.restarted.len(),
            "range unassigned"
        );
        self.start_fetches(outcome.restarted)
    }

    fn set_config(&self, name: String, value: Option<Value>) {
        let mut config = self.ctx.cluster_config.write();
        match value {
            Some(value) => {
                info!(name = %name, "cluster configuration set");
                config.insert(name, value);
            }
            None => {
                info!(name = %name, "cluster configuration cleared");
                config.remove(&name);
            }
        }
    }

    fn start_fetches(&self, fetches: Vec<FetchId>) -> Result<()> {
        for id in fetches {
            fetch::spawn(&self.ctx, id)?;
        }
        Ok(())
    }

    // =========================================================================
    // Rollback
    // =========================================================================

    /// Discard everything newer than the durable version and replay from there
    fn rollback(&mut self, target: Version) -> Result<()> {
        let ctx = self.ctx.clone();
        let durable = {
            let _writer = ctx.lock_writer();
            let durable = ctx.durable_version.get();
            if target < durable {
                return Err(AtlasError::InvariantViolation(format!(
                    "rollback to {} is below durable version {}",
                    target, durable
                )));
            }
            warn!(target, durable, version = ctx.version.get(), "rolling back to durable version");

            let (epoch, next_fetch, abandoned) = {
                let mut table = ctx.shards.write();
                let abandoned: Vec<_> = table
                    .fetch_ids()
                    .into_iter()
                    .filter_map(|id| table.fetch(id))
                    .filter(|a| match a.phase() {
                        FetchPhase::Waiting { transferred } => transferred > durable,
                        _ => true,
                    })
                    .map(|a| (a.range.clone(), a.handle.clone()))
                    .collect();
                table.cancel_all();
                (table.epoch(), table.next_fetch_id(), abandoned)
            };
            for (range, handle) in &abandoned {
                if handle.wrote() {
                    ctx.durable.clear_range(range)?;
                }
            }

            ctx.store.reset(durable);
            ctx.log.lock().reset();
            ctx.reclaim.lock().clear();

            let runs = persist::read_shard_runs(ctx.durable.as_ref())?;
            let (table, fetches) = ShardTable::from_persisted(&runs, durable, epoch, next_fetch);
            table.check_invariants()?;
            *ctx.shards.write() = table;

            ctx.version.reset(durable);
            ctx.floors.reset(durable);
            ctx.desired_oldest.store(durable, Ordering::SeqCst);
            ctx.flush_target.store(durable, Ordering::SeqCst);
            info!(durable, fetches = fetches.len(), abandoned = abandoned.len(), "rollback complete");
            self.start_fetches(fetches)?;
            durable
        };
        self.cursor.restart_from(durable + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::peer::MemoryPeer;
    use crate::storage::{DurableStore, MemoryStore};
    use crate::tlog::MemoryLog;
    use bytes::Bytes;

    fn setup() -> (UpdateApplier, Arc<MemoryStore>) {
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
        ctx.store.create_new_version(1).unwrap();
        let log = MemoryLog::new();
        (UpdateApplier::new(ctx, Box::new(log.cursor())), store)
    }

    #[test]
    fn test_prior_value_requires_eager_read() {
        let (applier, store) = setup();
        store.set(Bytes::from_static(b"a"), Bytes::from_static(b"disk")).unwrap();
        store.commit().unwrap();

        let result = applier.prior_value(&Bytes::from_static(b"a"), &EagerResults::default());

        assert!(matches!(result, Err(AtlasError::InvariantViolation(_))));
    }

    #[test]
    fn test_prior_value_prefers_memory() {
        let (applier, _store) = setup();
        applier
            .ctx
            .store
            .set(Bytes::from_static(b"a"), Bytes::from_static(b"mem"), 1)
            .unwrap();

        let value = applier
            .prior_value(&Bytes::from_static(b"a"), &EagerResults::default())
            .unwrap();

        assert_eq!(value, Some(Bytes::from_static(b"mem")));
    }
}

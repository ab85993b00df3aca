//! DurabilityLoop
//!
//! Drains the mutation log into the durable store in whole versions,
//! advancing the floors behind it.
//!
//! ## Iteration
//! ```text
//! writer lock ─▶ target = drain point <= min(desired, version, oldest pin)
//!   ─▶ publish oldestVersion ─▶ write mutations + \xff\xff/Version
//!   ─▶ commit (hard timeout) ─▶ pop log ─▶ forget versions < target
//!   ─▶ publish durableVersion ─▶ queue reclaim ─▶ release fetch budget
//! ```
//! Commits also run when fetches staged blocks, so their budget comes back
//! and dirty ranges become durable.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, info, warn};

use crate::context::EngineContext;
use crate::error::{AtlasError, Result};
use crate::mutation::Mutation;
use crate::persist::{encode_version, METADATA_PREFIX, VERSION_KEY};
use crate::storage::DurableStore;
use crate::types::{Key, KeyRange};
use crate::update::LogEntry;

// =============================================================================
// Commit Thread
// =============================================================================

/// Runs durable commits on a dedicated thread so the loop can time them out
struct Committer {
    requests: Sender<()>,
    results: Receiver<Result<()>>,
}

impl Committer {
    fn spawn(durable: Arc<dyn DurableStore>) -> Result<Self> {
        let (requests, queue) = unbounded::<()>();
        let (done, results) = bounded(1);
        thread::Builder::new()
            .name("durable-commit".to_string())
            .spawn(move || {
                for () in queue.iter() {
                    if done.send(durable.commit()).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self { requests, results })
    }

    fn commit(&self, timeout: Duration) -> Result<()> {
        self.requests
            .send(())
            .map_err(|_| AtlasError::Storage("commit thread exited".to_string()))?;
        match self.results.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(AtlasError::CommitTimeout(timeout.as_millis() as u64)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(AtlasError::Storage("commit thread exited".to_string()))
            }
        }
    }
}

// =============================================================================
// Durability Loop
// =============================================================================

/// What one iteration moved to the durable store
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Progress {
    versions: u64,
    mutations: usize,
    fetched_bytes: usize,
}

impl Progress {
    fn is_idle(&self) -> bool {
        self.versions == 0 && self.fetched_bytes == 0
    }
}

pub struct DurabilityLoop {
    ctx: Arc<EngineContext>,
    committer: Committer,
}

impl DurabilityLoop {
    pub fn new(ctx: Arc<EngineContext>) -> Result<Self> {
        let committer = Committer::spawn(ctx.durable.clone())?;
        Ok(Self { ctx, committer })
    }

    /// Run the loop on its own thread until the engine stops
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name("durability-loop".to_string())
            .spawn(move || self.run())?;
        Ok(handle)
    }

    pub fn run(self) {
        info!(durable = self.ctx.durable_version.get(), "durability loop started");
        let errors = self.ctx.durable.error_stream();
        let interval = self.ctx.config.durability_interval();
        while !self.ctx.is_stopping() {
            match errors.try_recv() {
                Ok(e) => {
                    self.ctx.fail(e);
                    break;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }
            match self.iterate() {
                Ok(progress) if progress.is_idle() => {
                    let version = self.ctx.version.get();
                    self.ctx.version.wait_at_least(version + 1, interval);
                }
                Ok(_) => {}
                Err(_) if self.ctx.is_stopping() => break,
                Err(e) => {
                    self.ctx.fail(e);
                    break;
                }
            }
        }
        info!(durable = self.ctx.durable_version.get(), "durability loop stopped");
    }

    /// Make one whole-version step durable
    fn iterate(&self) -> Result<Progress> {
        let ctx = &self.ctx;
        let _writer = ctx.lock_writer();

        let durable = ctx.durable_version.get();
        let version = ctx.version.get();
        let desired = ctx
            .desired_oldest
            .load(Ordering::SeqCst)
            .max(ctx.flush_target.load(Ordering::SeqCst))
            .min(version);
        let fetch_pending = ctx.fetch_budget.uncommitted() > 0;
        if desired <= durable && !fetch_pending {
            return Ok(Progress::default());
        }

        let budget = ctx.config.durability_bytes_per_iteration;
        let target = if desired > durable {
            ctx.floors
                .advance(desired, |floor| ctx.log.lock().drain_target(floor, budget))
                .max(durable)
        } else {
            durable
        };
        if target <= durable && !fetch_pending {
            // Held back by a reader pin
            return Ok(Progress::default());
        }

        let mut progress = Progress::default();
        if target > durable {
            let drained = ctx.log.lock().entries_through(target);
            progress.mutations = drained.len();
            for (_, mutation) in drained {
                write_mutation(ctx.durable.as_ref(), mutation)?;
            }
            ctx.durable
                .set(Key::from_static(VERSION_KEY), encode_version(target))?;
            progress.versions = target - durable;
        }
        progress.fetched_bytes = ctx.fetch_budget.take_uncommitted();

        if let Err(e) = self.committer.commit(ctx.config.commit_timeout()) {
            warn!(target, error = %e, "durable commit failed");
            return Err(e);
        }

        if target > durable {
            let popped = ctx.log.lock().pop_through(target);
            let released = ctx.store.forget_versions_before(target);
            ctx.durable_version.advance(target);
            let keys = reclaim_keys(&popped);
            if !keys.is_empty() {
                ctx.reclaim.lock().push((keys, target));
            }
            debug!(
                durable = target,
                versions = progress.versions,
                mutations = progress.mutations,
                roots_released = released,
                "durable version advanced"
            );
        }
        if progress.fetched_bytes > 0 {
            ctx.fetch_budget.release(progress.fetched_bytes);
            debug!(bytes = progress.fetched_bytes, "fetched bytes committed");
        }
        Ok(progress)
    }
}

fn write_mutation(store: &dyn DurableStore, mutation: Mutation) -> Result<()> {
    match mutation {
        Mutation::Set { key, value } => store.set(key, value),
        Mutation::ClearRange { begin, end } => store.clear_range(&KeyRange::new(begin, end)),
        Mutation::Atomic { key, .. } => Err(AtlasError::InvariantViolation(format!(
            "unexpanded atomic operation on {:?} in the mutation log",
            key
        ))),
    }
}

/// Begin keys of drained user mutations; metadata never enters memory
fn reclaim_keys(entries: &[LogEntry]) -> Vec<Key> {
    let mut keys: Vec<Key> = entries
        .iter()
        .flat_map(|e| e.mutations.iter())
        .map(|m| m.begin_key().clone())
        .filter(|k| !k.starts_with(METADATA_PREFIX))
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

//! FetchCoordinator
//!
//! Copies an incoming key range from a peer into the durable store, one
//! named thread per migration.
//!
//! ## Protocol
//! ```text
//! wait dirty version durable ─▶ clear range on disk ─▶ fetch_version = version
//!   ─▶ stream blocks into the durable store (byte budget, writer lock)
//!   ─▶ complete ─▶ applier transfers at t = version + 1 (Waiting)
//!   ─▶ wait durable >= t ─▶ ReadWrite
//! ```
//! A copy that runs past `fetch_iteration_bytes`, or loses its peer after
//! copying something, splits at the last copied key and hands the rest to a
//! new fetch. Nothing after the transfer is retried here: a failure there is
//! fatal to the engine.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::context::{EngineContext, SemaphorePermit};
use crate::error::{AtlasError, Result};
use crate::peer::FetchBlock;
use crate::shard::{FetchHandle, FetchId, FetchPhase};
use crate::types::{key_after, Key, KeyRange, Version};

/// Start the thread driving migration `id`
pub fn spawn(ctx: &Arc<EngineContext>, id: FetchId) -> Result<()> {
    let ctx = ctx.clone();
    thread::Builder::new()
        .name(format!("fetch-{}", id))
        .spawn(move || {
            let Some(task) = FetchTask::new(ctx.clone(), id) else {
                debug!(fetch = id, "fetch gone before it started");
                return;
            };
            match task.run() {
                Ok(()) => {}
                Err(_) if ctx.is_stopping() => {}
                Err(e) if e.is_fatal() => ctx.fail(e),
                Err(e) => warn!(fetch = id, error = %e, "fetch abandoned"),
            }
        })?;
    Ok(())
}

/// How a wait or copy ended early
enum Interrupted {
    Cancelled,
    Stopping,
}

struct FetchTask {
    ctx: Arc<EngineContext>,
    id: FetchId,
    handle: FetchHandle,
    range: KeyRange,
}

impl FetchTask {
    fn new(ctx: Arc<EngineContext>, id: FetchId) -> Option<Self> {
        let (handle, range) = {
            let table = ctx.shards.read();
            let adding = table.fetch(id)?;
            (adding.handle.clone(), adding.range.clone())
        };
        Some(Self {
            ctx,
            id,
            handle,
            range,
        })
    }

    fn run(mut self) -> Result<()> {
        info!(fetch = self.id, range = ?self.range, "fetch started");

        if let Some(reason) = self.wait_for_clean_range() {
            return self.interrupted(reason);
        }

        let ctx = self.ctx.clone();
        let fetch_version = {
            let Some(_permit) = acquire_slot(&ctx, &self.handle) else {
                return self.interrupted(self.reason());
            };
            let fetch_version = match self.prepare()? {
                Some(version) => version,
                None => return self.interrupted(self.reason()),
            };
            if let Some(reason) = self.copy(fetch_version)? {
                return self.interrupted(reason);
            }
            fetch_version
        };

        if !self.ctx.shards.write().complete_fetch(self.id) {
            return self.interrupted(Interrupted::Cancelled);
        }
        info!(fetch = self.id, range = ?self.range, fetch_version, "fetch copied, awaiting transfer");

        let transferred = match self.wait_for_transfer() {
            Ok(t) => t,
            Err(reason) => return self.interrupted(reason),
        };
        self.finish(transferred)
    }

    // =========================================================================
    // Before Copying
    // =========================================================================

    /// Wait until every unassignment overlapping the range is durable
    fn wait_for_clean_range(&self) -> Option<Interrupted> {
        let poll = self.ctx.config.log_poll_interval();
        loop {
            if self.interrupted_now() {
                return Some(self.reason());
            }
            let durable = self.ctx.durable_version.get();
            let dirty = self.ctx.shards.write().dirty_version(&self.range, durable);
            match dirty {
                None => return None,
                Some(version) => {
                    debug!(fetch = self.id, dirty = version, durable, "fetch waiting for dirty range");
                    self.ctx.flush_target.fetch_max(version, Ordering::SeqCst);
                    self.ctx.durable_version.wait_at_least(version, poll);
                }
            }
        }
    }

    /// Clear leftovers of earlier copies and pick the snapshot version
    fn prepare(&self) -> Result<Option<Version>> {
        {
            let _writer = self.ctx.lock_writer();
            if self.interrupted_now() {
                return Ok(None);
            }
            self.ctx.durable.clear_range(&self.range)?;
        }
        let fetch_version = self.ctx.version.get();
        if !self.ctx.shards.write().start_fetch(self.id, fetch_version) {
            return Ok(None);
        }
        debug!(fetch = self.id, fetch_version, "fetch snapshot chosen");
        Ok(Some(fetch_version))
    }

    // =========================================================================
    // Copying
    // =========================================================================

    /// Stream the range into the durable store
    fn copy(&mut self, fetch_version: Version) -> Result<Option<Interrupted>> {
        let block_bytes = self.ctx.config.fetch_block_bytes;
        let iteration_bytes = self.ctx.config.fetch_iteration_bytes;
        let retry_backoff = self.ctx.config.fetch_retry_backoff();
        let poll = self.ctx.config.log_poll_interval();

        let mut next = self.range.begin.clone();
        let mut copied = 0usize;
        let mut failures = 0u32;
        loop {
            if self.interrupted_now() {
                return Ok(Some(self.reason()));
            }
            let remaining = KeyRange::new(next.clone(), self.range.end.clone());
            if remaining.is_empty() {
                break;
            }
            if copied >= iteration_bytes {
                self.split(&next)?;
                break;
            }

            let block = match self
                .ctx
                .peer
                .fetch_block(&remaining, fetch_version, block_bytes)
                .and_then(checked_block)
            {
                Ok(block) => block,
                Err(e) if copied > 0 => {
                    warn!(fetch = self.id, error = %e, at = ?next, "peer failed mid-copy, splitting");
                    self.split(&next)?;
                    break;
                }
                Err(e) => {
                    failures += 1;
                    let backoff = backoff(retry_backoff, failures);
                    warn!(
                        fetch = self.id,
                        error = %e,
                        failures,
                        backoff_ms = backoff.as_millis() as u64,
                        "peer request failed, retrying"
                    );
                    self.pause(backoff);
                    continue;
                }
            };
            failures = 0;

            let bytes: usize = block.rows.iter().map(|kv| kv.size()).sum();
            while !self.ctx.fetch_budget.acquire(bytes, poll) {
                if self.interrupted_now() {
                    return Ok(Some(self.reason()));
                }
            }
            {
                let _writer = self.ctx.lock_writer();
                if self.interrupted_now() {
                    self.ctx.fetch_budget.release(bytes);
                    return Ok(Some(self.reason()));
                }
                for row in &block.rows {
                    if let Err(e) = self.ctx.durable.set(row.key.clone(), row.value.clone()) {
                        self.ctx.fetch_budget.release(bytes);
                        return Err(e);
                    }
                }
                self.handle.mark_wrote();
                self.ctx.fetch_budget.record_written(bytes);
            }
            copied += bytes;

            match block.rows.last() {
                Some(last) if block.more => next = key_after(&last.key),
                _ => break,
            }
        }
        debug!(fetch = self.id, range = ?self.range, copied, "fetch copy finished");
        Ok(None)
    }

    /// Hand `[at, end)` to a new fetch; this one keeps `[begin, at)`
    fn split(&mut self, at: &Key) -> Result<()> {
        let child = self.ctx.shards.write().split_fetch(self.id, at);
        match child {
            Some(child) => {
                info!(fetch = self.id, child, at = ?at, "fetch split");
                self.range.end = at.clone();
                spawn(&self.ctx, child)
            }
            None => Err(AtlasError::FetchFailed(format!(
                "fetch {} cannot split {:?} at {:?}",
                self.id, self.range, at
            ))),
        }
    }

    // =========================================================================
    // After Copying
    // =========================================================================

    /// Wait for the applier to replay the backlog; returns the transfer version
    fn wait_for_transfer(&self) -> std::result::Result<Version, Interrupted> {
        let poll = self.ctx.config.log_poll_interval();
        loop {
            if self.ctx.is_stopping() {
                return Err(Interrupted::Stopping);
            }
            let phase = self.ctx.shards.read().fetch_phase(self.id);
            match phase {
                Some(FetchPhase::Waiting { transferred }) => return Ok(transferred),
                Some(_) => {
                    let version = self.ctx.version.get();
                    self.ctx.version.wait_at_least(version + 1, poll);
                }
                None => return Err(Interrupted::Cancelled),
            }
        }
    }

    /// Wait for the transfer to be durable, then serve reads
    fn finish(&self, transferred: Version) -> Result<()> {
        self.ctx.flush_target.fetch_max(transferred, Ordering::SeqCst);
        let poll = self.ctx.config.log_poll_interval();
        while !self.ctx.durable_version.wait_at_least(transferred, poll) {
            if self.ctx.is_stopping() {
                return Ok(());
            }
        }
        let ranges = self.ctx.shards.write().finish_fetch(self.id);
        info!(fetch = self.id, transferred, ranges = ?ranges, "fetch finished, range readable");
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn interrupted_now(&self) -> bool {
        self.handle.is_cancelled() || self.ctx.is_stopping()
    }

    fn reason(&self) -> Interrupted {
        if self.handle.is_cancelled() {
            Interrupted::Cancelled
        } else {
            Interrupted::Stopping
        }
    }

    fn interrupted(&self, reason: Interrupted) -> Result<()> {
        match reason {
            Interrupted::Cancelled => info!(fetch = self.id, range = ?self.range, "fetch cancelled"),
            Interrupted::Stopping => debug!(fetch = self.id, "fetch stopped with the engine"),
        }
        Ok(())
    }

    /// Sleep for `duration` unless the engine stops first
    fn pause(&self, duration: Duration) {
        self.ctx.durable_version.wait_at_least(Version::MAX, duration);
    }
}

/// A block claiming more rows must carry at least one, or the copy could
/// never advance past it
fn checked_block(block: FetchBlock) -> Result<FetchBlock> {
    if block.more && block.rows.is_empty() {
        return Err(AtlasError::FetchFailed(
            "peer returned an empty block with more rows".to_string(),
        ));
    }
    Ok(block)
}

/// Take a streaming slot, giving up once the fetch is cancelled
fn acquire_slot<'a>(ctx: &'a EngineContext, handle: &FetchHandle) -> Option<SemaphorePermit<'a>> {
    let poll = ctx.config.log_poll_interval();
    loop {
        if handle.is_cancelled() || ctx.is_stopping() {
            return None;
        }
        if let Some(permit) = ctx.fetch_slots.acquire(poll) {
            return Some(permit);
        }
    }
}

/// Capped exponential backoff
fn backoff(base: Duration, failures: u32) -> Duration {
    base * 2u32.pow(failures.min(6).saturating_sub(1))
}

//! In-flight migration bookkeeping

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::FetchId;
use crate::mutation::Mutation;
use crate::types::{KeyRange, Version};

/// Shared flags between the shard table and a fetch thread
#[derive(Debug, Clone)]
pub struct FetchHandle {
    pub id: FetchId,
    cancelled: Arc<AtomicBool>,
    wrote: Arc<AtomicBool>,
}

impl FetchHandle {
    pub(crate) fn new(id: FetchId) -> Self {
        Self {
            id,
            cancelled: Arc::new(AtomicBool::new(false)),
            wrote: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Record that blocks reached the durable store; caller holds the writer lock
    pub fn mark_wrote(&self) {
        self.wrote.store(true, Ordering::SeqCst);
    }

    pub fn wrote(&self) -> bool {
        self.wrote.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPhase {
    /// Streaming blocks from the peer
    Fetching,
    /// All blocks durable-staged; the applier transfers at its next batch
    Complete,
    /// Backlog replayed at `transferred`
    Waiting { transferred: Version },
}

/// One migration: a range being copied plus its mutation backlog
#[derive(Debug)]
pub struct AddingShard {
    pub range: KeyRange,
    pub handle: FetchHandle,
    pub(crate) backlog: Vec<(Version, Mutation)>,
    pub(crate) fetch_version: Option<Version>,
    pub(crate) phase: FetchPhase,
}

impl AddingShard {
    pub(crate) fn new(id: FetchId, range: KeyRange) -> Self {
        Self {
            range,
            handle: FetchHandle::new(id),
            backlog: Vec::new(),
            fetch_version: None,
            phase: FetchPhase::Fetching,
        }
    }

    pub fn phase(&self) -> FetchPhase {
        self.phase
    }

    pub fn fetch_version(&self) -> Option<Version> {
        self.fetch_version
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Buffer a mutation arriving while the copy runs
    ///
    /// Mutations at or below the snapshot version are already in the copy.
    pub(crate) fn buffer(&mut self, version: Version, mutation: Mutation) {
        if self.fetch_version.map_or(true, |fv| version > fv) {
            self.backlog.push((version, mutation));
        }
    }

    /// Backlog entries restricted to `range`
    pub(crate) fn backlog_within(&self, range: &KeyRange) -> Vec<(Version, Mutation)> {
        self.backlog
            .iter()
            .filter_map(|(v, m)| m.clipped_to(range).map(|m| (*v, m)))
            .collect()
    }
}

/// Work the applier performs to hand a completed copy over
#[derive(Debug)]
pub struct Transfer {
    pub fetch: FetchId,
    pub range: KeyRange,
    /// Backlog entries newer than the snapshot, in arrival order
    pub backlog: Vec<(Version, Mutation)>,
}

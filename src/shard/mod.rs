//! Shard Module
//!
//! Total range map from key range to shard descriptor, plus the arena of
//! in-flight migrations.
//!
//! ## State Machine
//! ```text
//!                 assign                 copy done            durable >= t
//!  Unassigned ───────────▶ Fetching ───────────▶ Waiting(t) ───────────▶ ReadWrite
//!      ▲     known_empty       │    applier transfer at t                   │
//!      │ ─────────────────────────────────────────────────────────────────▶│
//!      │                       │                                            │
//!      └───────────────────────┴──────────── unassign ──────────────────────┘
//! ```
//! Mutations for a `Fetching` range are buffered in its migration's backlog.
//! `Waiting` ranges apply mutations like `ReadWrite` but refuse reads.

mod adding;
mod table;

use crate::types::{KeyRange, Version};

pub use adding::{AddingShard, FetchHandle, FetchPhase, Transfer};
pub use table::{ShardTable, UnassignOutcome};

/// Handle of an in-flight migration in the shard arena
pub type FetchId = u64;

/// State of one shard descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    /// Not owned by this node
    Unassigned,
    /// Copy from a peer in progress; mutations go to the backlog
    Fetching { fetch: FetchId },
    /// Backlog replayed at `transferred`; waiting for it to become durable
    Waiting { fetch: FetchId, transferred: Version },
    /// Serving reads at versions >= `readable_since`
    ReadWrite { readable_since: Version },
}

impl ShardState {
    /// Mutations are applied to memory and the mutation log
    pub fn applies_mutations(&self) -> bool {
        matches!(self, ShardState::ReadWrite { .. } | ShardState::Waiting { .. })
    }

    /// Persisted `ShardAssigned` marker
    pub fn is_assigned(&self) -> bool {
        !matches!(self, ShardState::Unassigned)
    }

    /// Persisted `ShardAvailable` marker
    pub fn is_available(&self) -> bool {
        self.applies_mutations()
    }

    pub fn fetch_id(&self) -> Option<FetchId> {
        match self {
            ShardState::Fetching { fetch } | ShardState::Waiting { fetch, .. } => Some(*fetch),
            _ => None,
        }
    }
}

/// A shard descriptor: one contiguous range in one state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    pub range: KeyRange,
    pub state: ShardState,
    /// Table epoch at which this descriptor last changed
    pub changed_at: u64,
}

impl ShardDescriptor {
    /// Readable at `version` by a reader that started at table epoch `epoch`
    pub fn readable_at(&self, version: Version, epoch: u64) -> bool {
        match self.state {
            ShardState::ReadWrite { readable_since } => readable_since <= version && self.changed_at <= epoch,
            _ => false,
        }
    }
}

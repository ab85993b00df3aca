//! Log system interface
//!
//! The update applier consumes an ordered, gap-free stream of versioned
//! mutation batches through a [`LogCursor`].

mod memory;

use std::time::Duration;

use crate::error::Result;
use crate::mutation::Mutation;
use crate::types::Version;

pub use memory::{MemoryLog, MemoryLogCursor};

/// One message of the mutation stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogMessage {
    /// Mutations committed at `version`, in commit order
    Batch {
        version: Version,
        mutations: Vec<Mutation>,
    },
    /// Upstream bookkeeping the storage engine ignores
    Skip { version: Version },
}

impl LogMessage {
    pub fn version(&self) -> Version {
        match self {
            LogMessage::Batch { version, .. } | LogMessage::Skip { version } => *version,
        }
    }
}

/// Ordered cursor over the mutation stream
pub trait LogCursor: Send {
    /// Next message, waiting up to `timeout`; `Ok(None)` if nothing arrived
    fn next(&mut self, timeout: Duration) -> Result<Option<LogMessage>>;

    /// Highest version the log system has committed
    fn known_committed_version(&self) -> Version;

    /// Everything at or below `version` is durable here; upstream may discard it
    fn advance_to(&mut self, version: Version);

    /// Reposition so the next message has version >= `version`
    ///
    /// Fails with `LogPopped` if that part of the stream was discarded.
    fn restart_from(&mut self, version: Version) -> Result<()>;
}

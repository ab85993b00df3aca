//! In-process log system
//!
//! Batches are pushed by a test or the simulator and read back through a
//! cursor. Delivering an epoch-end mutation voids the batches it rolls back,
//! so a cursor restarted below the epoch end never sees them again.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::{LogCursor, LogMessage};
use crate::error::{AtlasError, Result};
use crate::mutation::{ControlMutation, Mutation};
use crate::types::Version;

#[derive(Default)]
struct LogState {
    messages: BTreeMap<Version, LogMessage>,
    last_pushed: Version,
    popped: Version,
}

struct Shared {
    state: Mutex<LogState>,
    arrived: Condvar,
}

/// Shared handle to an in-process log
#[derive(Clone)]
pub struct MemoryLog {
    shared: Arc<Shared>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LogState::default()),
                arrived: Condvar::new(),
            }),
        }
    }

    /// Append a batch; versions must strictly increase
    pub fn push(&self, version: Version, mutations: Vec<Mutation>) -> Result<()> {
        self.append(LogMessage::Batch { version, mutations })
    }

    /// Append a message the storage engine skips
    pub fn push_skip(&self, version: Version) -> Result<()> {
        self.append(LogMessage::Skip { version })
    }

    /// Cursor positioned at the start of the retained stream
    pub fn cursor(&self) -> MemoryLogCursor {
        MemoryLogCursor {
            shared: self.shared.clone(),
            position: 0,
        }
    }

    /// Highest version pushed so far
    pub fn last_version(&self) -> Version {
        self.shared.state.lock().last_pushed
    }

    /// Highest version a cursor reported durable
    pub fn popped_version(&self) -> Version {
        self.shared.state.lock().popped
    }

    /// Messages still retained
    pub fn retained(&self) -> usize {
        self.shared.state.lock().messages.len()
    }

    fn append(&self, message: LogMessage) -> Result<()> {
        let mut state = self.shared.state.lock();
        let version = message.version();
        if version <= state.last_pushed {
            return Err(AtlasError::InvariantViolation(format!(
                "log version {} does not follow {}",
                version, state.last_pushed
            )));
        }
        state.last_pushed = version;
        state.messages.insert(version, message);
        self.shared.arrived.notify_all();
        Ok(())
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over a [`MemoryLog`]
pub struct MemoryLogCursor {
    shared: Arc<Shared>,
    /// Next message must have version >= position
    position: Version,
}

impl LogCursor for MemoryLogCursor {
    fn next(&mut self, timeout: Duration) -> Result<Option<LogMessage>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if self.position <= state.popped && state.popped > 0 {
                return Err(AtlasError::LogPopped {
                    requested: self.position,
                    popped: state.popped,
                });
            }
            let next = state
                .messages
                .range((Bound::Included(self.position), Bound::Unbounded))
                .next()
                .map(|(_, m)| m.clone());
            if let Some(message) = next {
                let version = message.version();
                self.position = version + 1;
                if let Some(target) = epoch_end_target(&message).filter(|t| *t < version) {
                    let voided: Vec<Version> = state
                        .messages
                        .range((Bound::Excluded(target), Bound::Included(version)))
                        .map(|(v, _)| *v)
                        .collect();
                    for v in &voided {
                        state.messages.remove(v);
                    }
                    debug!(target, epoch_end = version, voided = voided.len(), "log epoch ended");
                }
                return Ok(Some(message));
            }
            if self
                .shared
                .arrived
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Ok(None);
            }
        }
    }

    fn known_committed_version(&self) -> Version {
        self.shared.state.lock().last_pushed
    }

    fn advance_to(&mut self, version: Version) {
        let mut state = self.shared.state.lock();
        if version <= state.popped {
            return;
        }
        state.popped = version;
        let kept = state.messages.split_off(&(version + 1));
        state.messages = kept;
    }

    fn restart_from(&mut self, version: Version) -> Result<()> {
        let state = self.shared.state.lock();
        if version <= state.popped && state.popped > 0 {
            return Err(AtlasError::LogPopped {
                requested: version,
                popped: state.popped,
            });
        }
        self.position = version;
        Ok(())
    }
}

fn epoch_end_target(message: &LogMessage) -> Option<Version> {
    match message {
        LogMessage::Batch { mutations, .. } => mutations
            .iter()
            .filter(|m| m.is_private())
            .find_map(|m| match ControlMutation::decode(m) {
                Ok(ControlMutation::EpochEnd { target }) => Some(target),
                _ => None,
            }),
        LogMessage::Skip { .. } => None,
    }
}

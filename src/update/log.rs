//! MutationLog
//!
//! Version-ordered journal of expanded mutations waiting for the durability
//! loop. Entries hold only `Set` and `ClearRange`; atomic operations are
//! expanded before they get here.

use std::collections::VecDeque;

use crate::error::{AtlasError, Result};
use crate::mutation::Mutation;
use crate::types::Version;

/// Mutations applied at one version, in apply order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub version: Version,
    pub mutations: Vec<Mutation>,
    bytes: usize,
}

impl LogEntry {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

#[derive(Debug, Default)]
pub struct MutationLog {
    entries: VecDeque<LogEntry>,
    bytes: usize,
}

impl MutationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `mutation` at `version`; versions never go backward
    pub fn append(&mut self, version: Version, mutation: Mutation) -> Result<()> {
        if let Mutation::Atomic { .. } = mutation {
            return Err(AtlasError::InvariantViolation(
                "atomic operation reached the mutation log unexpanded".to_string(),
            ));
        }
        let size = mutation.size();
        match self.entries.back_mut() {
            Some(last) if last.version == version => {
                last.mutations.push(mutation);
                last.bytes += size;
            }
            Some(last) if last.version > version => {
                return Err(AtlasError::InvariantViolation(format!(
                    "mutation log append at {} after {}",
                    version, last.version
                )));
            }
            _ => self.entries.push_back(LogEntry {
                version,
                mutations: vec![mutation],
                bytes: size,
            }),
        }
        self.bytes += size;
        Ok(())
    }

    /// Highest version `<= floor` whose entries fit in `budget` bytes
    ///
    /// Only whole versions are drained. The first version is always taken
    /// even when it alone exceeds the budget, so the loop makes progress.
    pub fn drain_target(&self, floor: Version, budget: usize) -> Version {
        let mut used = 0;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.version > floor {
                return floor;
            }
            used += entry.bytes;
            if used > budget && i > 0 {
                return entry.version - 1;
            }
            if used >= budget {
                return entry.version;
            }
        }
        floor
    }

    /// Copies of every mutation at or below `version`, in order
    pub fn entries_through(&self, version: Version) -> Vec<(Version, Mutation)> {
        self.entries
            .iter()
            .take_while(|e| e.version <= version)
            .flat_map(|e| e.mutations.iter().map(move |m| (e.version, m.clone())))
            .collect()
    }

    /// Remove and return every entry at or below `version`
    pub fn pop_through(&mut self, version: Version) -> Vec<LogEntry> {
        let count = self.entries.iter().take_while(|e| e.version <= version).count();
        let popped: Vec<LogEntry> = self.entries.drain(..count).collect();
        self.bytes -= popped.iter().map(|e| e.bytes).sum::<usize>();
        popped
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes of all retained mutations
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn first_version(&self) -> Option<Version> {
        self.entries.front().map(|e| e.version)
    }

    pub fn last_version(&self) -> Option<Version> {
        self.entries.back().map(|e| e.version)
    }
}

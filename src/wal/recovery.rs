//! Commit log recovery
//!
//! Replays the log after a crash.

use std::fs::OpenOptions;
use std::path::Path;

use tracing::warn;

use super::{WalEntry, WalReader};
use crate::error::{AtlasError, Result};

/// Handles commit log recovery after a crash
pub struct WalRecovery;

/// Result of a recovery operation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of records successfully recovered
    pub entries_recovered: u64,

    /// Last valid LSN (0 if none)
    pub last_lsn: u64,

    /// Whether a torn or corrupt tail was cut off
    pub was_truncated: bool,

    /// Bytes kept in the file
    pub valid_bytes: u64,
}

impl WalRecovery {
    /// Recover every record of `path`, truncating a torn tail
    ///
    /// Commits are appended one record at a time, so only the last record
    /// can be incomplete; everything before the first bad record is kept.
    pub fn recover(path: &Path) -> Result<(Vec<WalEntry>, RecoveryResult)> {
        if !path.exists() {
            return Ok((Vec::new(), RecoveryResult::default()));
        }
        let (entries, result) = Self::scan(path)?;
        if result.was_truncated {
            warn!(
                path = %path.display(),
                valid_bytes = result.valid_bytes,
                last_lsn = result.last_lsn,
                "truncating torn commit log tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(result.valid_bytes)?;
            file.sync_all()?;
        }
        Ok((entries, result))
    }

    /// Check the log without modifying it
    pub fn verify(path: &Path) -> Result<RecoveryResult> {
        Self::scan(path).map(|(_, result)| result)
    }

    fn scan(path: &Path) -> Result<(Vec<WalEntry>, RecoveryResult)> {
        let file_len = std::fs::metadata(path)?.len();
        let mut reader = WalReader::open(path)?;
        let mut entries = Vec::new();
        let mut result = RecoveryResult::default();
        loop {
            match reader.next_entry() {
                Ok(Some(entry)) => {
                    if entry.lsn <= result.last_lsn {
                        return Err(AtlasError::WalCorruption(format!(
                            "lsn {} follows lsn {}",
                            entry.lsn, result.last_lsn
                        )));
                    }
                    result.last_lsn = entry.lsn;
                    result.entries_recovered += 1;
                    entries.push(entry);
                }
                Ok(None) => break,
                Err(AtlasError::WalCorruption(reason)) => {
                    warn!(%reason, "commit log ends in a bad record");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        result.valid_bytes = reader.position();
        result.was_truncated = result.valid_bytes < file_len;
        Ok((entries, result))
    }
}

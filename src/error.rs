//! Error types for AtlasNode
//!
//! Provides a unified error type for all operations.
//!
//! Errors fall into two classes:
//! - **retryable**: surfaced to the caller, the engine keeps running
//!   (`WrongShard`, `TransactionTooOld`, `FutureVersion`, `Overloaded`, `Timeout`)
//! - **fatal**: in-memory state can no longer be trusted and the engine stops
//!   until it is rebooted and recovered from the durable store

use thiserror::Error;

use crate::types::Version;

/// Result type alias using AtlasError
pub type Result<T> = std::result::Result<T, AtlasError>;

/// Unified error type for AtlasNode operations
#[derive(Debug, Error)]
pub enum AtlasError {
    // -------------------------------------------------------------------------
    // Retryable client errors
    // -------------------------------------------------------------------------
    #[error("Wrong shard: key range is not readable on this node")]
    WrongShard,

    #[error("Transaction too old: version {requested} is below oldest version {oldest}")]
    TransactionTooOld { requested: Version, oldest: Version },

    #[error("Future version: version {requested} is ahead of applied version {current}")]
    FutureVersion { requested: Version, current: Version },

    #[error("Overloaded: {0}")]
    Overloaded(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // WAL Errors
    // -------------------------------------------------------------------------
    #[error("WAL corruption detected: {0}")]
    WalCorruption(String),

    #[error("WAL write failed: {0}")]
    WalWrite(String),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Durable commit exceeded {0} ms")]
    CommitTimeout(u64),

    #[error("Persisted format mismatch: {0}")]
    FormatMismatch(String),

    // -------------------------------------------------------------------------
    // Pipeline Errors
    // -------------------------------------------------------------------------
    #[error("Log popped: version {requested} is below the log's popped version {popped}")]
    LogPopped { requested: Version, popped: Version },

    #[error("Unexpected mutation: {0}")]
    UnexpectedMutation(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Engine stopped after fatal error: {0}")]
    Stopped(String),
}

impl AtlasError {
    /// Whether the caller may retry the operation (possibly on another node)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AtlasError::WrongShard
                | AtlasError::TransactionTooOld { .. }
                | AtlasError::FutureVersion { .. }
                | AtlasError::Overloaded(_)
                | AtlasError::Timeout(_)
        )
    }

    /// Whether the error means the engine must stop and be rebooted
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
            && !matches!(
                self,
                AtlasError::FetchFailed(_) | AtlasError::Config(_) | AtlasError::ShuttingDown
            )
    }
}

impl From<bincode::Error> for AtlasError {
    fn from(e: bincode::Error) -> Self {
        AtlasError::Serialization(e.to_string())
    }
}

//! # AtlasNode
//!
//! The per-node storage engine of a distributed, transactional key-value
//! database:
//! - Multi-version reads at any retained version (copy-on-write treap)
//! - Exactly-once application of a replicated, versioned mutation stream
//! - Shard migration from peers without losing or duplicating mutations
//! - Asynchronous durability, decoupled from the apply pipeline
//!
//! ## Architecture Overview
//!
//! ```text
//!        log system (LogCursor)                 peers (PeerSource)
//!               │                                      │
//! ┌─────────────▼──────────────┐         ┌─────────────▼─────────────┐
//! │       UpdateApplier        │◀────────│     FetchCoordinator      │
//! │  (one writer, per batch)   │ transfer│  (thread per migration)   │
//! └──┬──────────┬──────────┬───┘         └─────────────┬─────────────┘
//!    │          │          │                           │ blocks
//!    ▼          ▼          ▼                           │
//! ┌─────────┐ ┌────────┐ ┌────────────┐                │
//! │Versioned│ │Mutation│ │ ShardTable │                │
//! │  Store  │ │  Log   │ │            │                │
//! └───▲─────┘ └───┬────┘ └─────▲──────┘                │
//!     │           │ drain      │                       │
//!     │   ┌───────▼───────┐    │                       │
//!     │   │DurabilityLoop │────┼─────────┐             │
//!     │   └───────────────┘    │         ▼             ▼
//!     │                        │  ┌──────────────────────────┐
//! ┌───┴────────────────────────┴┐ │  DurableStore            │
//! │          ReadPath           │▶│  (MemoryStore/FileStore) │
//! └─────────────────────────────┘ └──────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod types;
pub mod mutation;

pub mod mvcc;
pub mod shard;
pub mod update;
pub mod fetch;
pub mod durability;
pub mod read;

pub mod context;
pub mod persist;
pub mod storage;
pub mod wal;
pub mod tlog;
pub mod peer;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{AtlasError, Result};
pub use config::Config;
pub use engine::Engine;
pub use mutation::{AtomicOp, Mutation};
pub use types::{Key, KeyRange, KeyValue, RangeResult, Value, Version};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of AtlasNode
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

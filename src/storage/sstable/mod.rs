//! SSTable Module
//!
//! Sorted, immutable checkpoint of the file store's committed contents.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (22 bytes)                                       │
//! │   Magic: "ATNC" (4) | Version: u16 (2) | Count: u64 (8) │
//! │   LSN: u64 (8)  last commit record folded in            │
//! ├─────────────────────────────────────────────────────────┤
//! │ Data Block (variable)                                   │
//! │   [KeyLen: u32][ValLen: u32][Key][Value]                │
//! │   ... repeated for each entry, ascending keys ...       │
//! ├─────────────────────────────────────────────────────────┤
//! │ Footer (8 bytes)                                        │
//! │   DataCRC: u32 (4) | Padding (4)                        │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod builder;
mod iterator;
mod reader;

use std::path::PathBuf;

pub use builder::SSTableBuilder;
pub use iterator::SSTableIterator;
pub use reader::SSTableReader;

// =============================================================================
// Shared Constants (used by builder, reader, iterator)
// =============================================================================

pub(crate) const MAGIC: &[u8; 4] = b"ATNC";

pub(crate) const VERSION: u16 = 1;

/// Magic (4) + Version (2) + EntryCount (8) + LSN (8)
pub(crate) const HEADER_SIZE: u64 = 22;

/// DataCRC (4) + Padding (4)
pub(crate) const FOOTER_SIZE: u64 = 8;

/// Metadata of a finished checkpoint file
#[derive(Debug, Clone)]
pub struct SSTable {
    pub path: PathBuf,
    pub entry_count: u64,
    /// Commit log LSN this checkpoint includes
    pub lsn: u64,
    pub file_size: u64,
}

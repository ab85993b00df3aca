//! Commit log record definitions
//!
//! One record per durable-store commit: every write staged since the
//! previous commit, in the order it was issued.

use serde::{Deserialize, Serialize};

use crate::error::{AtlasError, Result};

/// Bytes before the payload: LSN (8) + CRC (4) + Len (4)
pub const HEADER_SIZE: usize = 16;

/// A single commit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Log Sequence Number, one per commit
    pub lsn: u64,

    /// Writes made durable by this commit
    pub ops: Vec<Operation>,
}

/// Writes that can be logged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Set { key: Vec<u8>, value: Vec<u8> },
    ClearRange { begin: Vec<u8>, end: Vec<u8> },
}

impl WalEntry {
    pub fn new(lsn: u64, ops: Vec<Operation>) -> Self {
        Self { lsn, ops }
    }

    /// Encode as `[lsn][crc][len][payload]`
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(&self.ops)?;
        if payload.len() > u32::MAX as usize {
            return Err(AtlasError::WalWrite(format!(
                "record of {} bytes exceeds the length field",
                payload.len()
            )));
        }
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode the payload that followed a verified header
    pub fn decode(lsn: u64, crc: u32, payload: &[u8]) -> Result<Self> {
        let actual = crc32fast::hash(payload);
        if actual != crc {
            return Err(AtlasError::WalCorruption(format!(
                "checksum mismatch at lsn {}: stored {:08x}, computed {:08x}",
                lsn, crc, actual
            )));
        }
        let ops = bincode::deserialize(payload)?;
        Ok(Self { lsn, ops })
    }
}

/// Split a 16-byte header into (lsn, crc, len)
pub(crate) fn parse_header(header: &[u8; HEADER_SIZE]) -> (u64, u32, usize) {
    let mut lsn = [0u8; 8];
    lsn.copy_from_slice(&header[0..8]);
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&header[8..12]);
    let mut len = [0u8; 4];
    len.copy_from_slice(&header[12..16]);
    (
        u64::from_le_bytes(lsn),
        u32::from_le_bytes(crc),
        u32::from_le_bytes(len) as usize,
    )
}

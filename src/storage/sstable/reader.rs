//! SSTable Reader
//!
//! Opens checkpoint files and streams their entries.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{AtlasError, Result};

use super::iterator::SSTableIterator;
use super::{SSTable, FOOTER_SIZE, HEADER_SIZE, MAGIC, VERSION};

/// Reader for checkpoint files
pub struct SSTableReader {
    pub(super) file: BufReader<File>,
    meta: SSTable,
    pub(super) data_end: u64,
    pub(super) data_crc: u32,
}

impl SSTableReader {
    /// Open a checkpoint, validating header and footer
    ///
    /// The data checksum is verified while iterating.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < HEADER_SIZE + FOOTER_SIZE {
            return Err(AtlasError::Storage(format!(
                "checkpoint {} is truncated ({} bytes)",
                path.display(),
                file_size
            )));
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        if &header[0..4] != MAGIC {
            return Err(AtlasError::Storage(format!(
                "Invalid checkpoint magic: expected ATNC, got {:?}",
                &header[0..4]
            )));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != VERSION {
            return Err(AtlasError::Storage(format!(
                "Unsupported checkpoint version: {}",
                version
            )));
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&header[6..14]);
        let entry_count = u64::from_le_bytes(word);
        word.copy_from_slice(&header[14..22]);
        let lsn = u64::from_le_bytes(word);

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact(&mut footer)?;
        let data_crc = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);

        file.seek(SeekFrom::Start(0))?;
        Ok(Self {
            file: BufReader::new(file),
            meta: SSTable {
                path: path.to_path_buf(),
                entry_count,
                lsn,
                file_size,
            },
            data_end: file_size - FOOTER_SIZE,
            data_crc,
        })
    }

    pub fn entry_count(&self) -> u64 {
        self.meta.entry_count
    }

    /// Commit log LSN included in this checkpoint
    pub fn lsn(&self) -> u64 {
        self.meta.lsn
    }

    pub fn metadata(&self) -> &SSTable {
        &self.meta
    }

    /// Iterate all entries in key order
    pub fn iter(&mut self) -> Result<SSTableIterator<'_>> {
        let end = self.data_end;
        let crc = self.data_crc;
        SSTableIterator::new(&mut self.file, end, crc)
    }
}

//! SSTable Builder
//!
//! Writes a sorted checkpoint file.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{AtlasError, Result};

use super::{SSTable, HEADER_SIZE, MAGIC, VERSION};

/// Builder for checkpoint files; entries must arrive in ascending key order
pub struct SSTableBuilder {
    path: PathBuf,
    writer: BufWriter<File>,
    entry_count: u64,
    lsn: u64,
    bytes_written: u64,
    last_key: Option<Vec<u8>>,
    data_hasher: crc32fast::Hasher,
}

impl SSTableBuilder {
    /// Create the file and write a header with a placeholder entry count
    pub fn new(path: &Path, lsn: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&0u64.to_le_bytes())?;
        writer.write_all(&lsn.to_le_bytes())?;

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            entry_count: 0,
            lsn,
            bytes_written: HEADER_SIZE,
            last_key: None,
            data_hasher: crc32fast::Hasher::new(),
        })
    }

    /// Append one entry
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                return Err(AtlasError::Storage(
                    "checkpoint keys must be strictly ascending".to_string(),
                ));
            }
        }

        let key_len = (key.len() as u32).to_le_bytes();
        let val_len = (value.len() as u32).to_le_bytes();
        for part in [&key_len[..], &val_len[..], key, value] {
            self.writer.write_all(part)?;
            self.data_hasher.update(part);
        }

        self.bytes_written += 8 + key.len() as u64 + value.len() as u64;
        self.entry_count += 1;
        self.last_key = Some(key.to_vec());
        Ok(())
    }

    /// Write the footer, patch the entry count, and fsync
    pub fn finish(mut self) -> Result<SSTable> {
        let data_crc = self.data_hasher.finalize();
        self.writer.write_all(&data_crc.to_le_bytes())?;
        self.writer.write_all(&[0u8; 4])?;
        self.writer.flush()?;

        let mut file = self
            .writer
            .into_inner()
            .map_err(|e| AtlasError::Storage(format!("Failed to flush checkpoint: {}", e)))?;
        // Entry count sits after magic + version
        file.seek(SeekFrom::Start(6))?;
        file.write_all(&self.entry_count.to_le_bytes())?;
        file.sync_all()?;

        let file_size = file.metadata()?.len();
        Ok(SSTable {
            path: self.path,
            entry_count: self.entry_count,
            lsn: self.lsn,
            file_size,
        })
    }

    /// Bytes written so far
    pub fn size(&self) -> u64 {
        self.bytes_written
    }
}

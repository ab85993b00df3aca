//! Commit log writer
//!
//! Appends commit records to the log file.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{Operation, WalEntry};
use crate::error::{AtlasError, Result};

/// Appends commit records; one writer per log file
pub struct WalWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    /// LSN the next record receives
    next_lsn: u64,
    /// Current file length in bytes
    size: u64,
    /// fsync after every append
    sync: bool,
}

impl WalWriter {
    /// Open or create a log file, appending after `last_lsn`
    ///
    /// The caller recovers the file first so the tail holds no torn record.
    pub fn open(path: &Path, last_lsn: u64, sync: bool) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let size = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            next_lsn: last_lsn + 1,
            size,
            sync,
        })
    }

    /// Append one record holding `ops`, returning its LSN
    pub fn append(&mut self, ops: Vec<Operation>) -> Result<u64> {
        let lsn = self.next_lsn;
        let bytes = WalEntry::new(lsn, ops).encode()?;
        self.writer
            .write_all(&bytes)
            .map_err(|e| AtlasError::WalWrite(format!("append lsn {}: {}", lsn, e)))?;
        self.writer.flush()?;
        if self.sync {
            self.writer.get_ref().sync_data()?;
        }
        self.next_lsn += 1;
        self.size += bytes.len() as u64;
        Ok(lsn)
    }

    /// Force file contents to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Drop every record; LSNs keep increasing
    pub fn truncate(&mut self) -> Result<()> {
        self.writer.flush()?;
        let file = self.writer.get_mut();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.sync_all()?;
        self.size = 0;
        Ok(())
    }

    /// LSN of the last appended record (0 if none)
    pub fn current_lsn(&self) -> u64 {
        self.next_lsn - 1
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

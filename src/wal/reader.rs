//! Commit log reader
//!
//! Sequential reads of commit records.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

use super::entry::{parse_header, HEADER_SIZE};
use super::WalEntry;
use crate::error::{AtlasError, Result};

/// Reads records from a commit log file
pub struct WalReader {
    reader: BufReader<File>,
    /// Byte offset just past the last complete record
    position: u64,
}

impl WalReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            position: 0,
        })
    }

    /// Next record; `Ok(None)` at a clean end of file
    ///
    /// A torn header or payload at the tail is reported as `WalCorruption`,
    /// same as a checksum mismatch.
    pub fn next_entry(&mut self) -> Result<Option<WalEntry>> {
        let mut header = [0u8; HEADER_SIZE];
        let read = read_full(&mut self.reader, &mut header)?;
        if read == 0 {
            return Ok(None);
        }
        if read < HEADER_SIZE {
            return Err(AtlasError::WalCorruption(format!(
                "partial header at offset {}",
                self.position
            )));
        }
        let (lsn, crc, len) = parse_header(&header);
        let mut payload = vec![0u8; len];
        if read_full(&mut self.reader, &mut payload)? < len {
            return Err(AtlasError::WalCorruption(format!(
                "partial record at offset {} (lsn {})",
                self.position, lsn
            )));
        }
        let entry = WalEntry::decode(lsn, crc, &payload)?;
        self.position += (HEADER_SIZE + len) as u64;
        Ok(Some(entry))
    }

    /// Offset just past the last record returned
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Iterate records until end of file or the first error
    pub fn entries(self) -> WalIterator {
        WalIterator {
            reader: self,
            done: false,
        }
    }
}

/// Iterator over commit records
pub struct WalIterator {
    reader: WalReader,
    done: bool,
}

impl Iterator for WalIterator {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Read until `buf` is full or EOF; returns bytes read
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

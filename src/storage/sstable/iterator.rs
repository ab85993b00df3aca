//! SSTable Iterator
//!
//! Sequential iteration over a checkpoint's entries.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};

use crate::error::{AtlasError, Result};

use super::HEADER_SIZE;

/// Iterator over checkpoint entries in sorted key order
///
/// Yields an error instead of the end of iteration if the data checksum
/// does not match the footer.
pub struct SSTableIterator<'a> {
    file: &'a mut BufReader<File>,
    end_offset: u64,
    current_offset: u64,
    expected_crc: u32,
    hasher: Option<crc32fast::Hasher>,
}

impl<'a> SSTableIterator<'a> {
    pub(super) fn new(file: &'a mut BufReader<File>, end_offset: u64, expected_crc: u32) -> Result<Self> {
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        Ok(Self {
            file,
            end_offset,
            current_offset: HEADER_SIZE,
            expected_crc,
            hasher: Some(crc32fast::Hasher::new()),
        })
    }

    fn read_entry(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut header = [0u8; 8];
        self.file.read_exact(&mut header)?;
        let key_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let val_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if self.current_offset + 8 + (key_len + val_len) as u64 > self.end_offset {
            return Err(AtlasError::Storage(format!(
                "checkpoint entry at offset {} runs past the data block",
                self.current_offset
            )));
        }

        let mut key = vec![0u8; key_len];
        self.file.read_exact(&mut key)?;
        let mut value = vec![0u8; val_len];
        self.file.read_exact(&mut value)?;

        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&header);
            hasher.update(&key);
            hasher.update(&value);
        }
        self.current_offset += 8 + (key_len + val_len) as u64;
        Ok((key, value))
    }
}

impl<'a> Iterator for SSTableIterator<'a> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_offset >= self.end_offset {
            // Check the checksum once, after the last entry
            let hasher = self.hasher.take()?;
            let actual = hasher.finalize();
            if actual != self.expected_crc {
                return Some(Err(AtlasError::Storage(format!(
                    "checkpoint checksum mismatch: stored {:08x}, computed {:08x}",
                    self.expected_crc, actual
                ))));
            }
            return None;
        }
        match self.read_entry() {
            Ok(entry) => Some(Ok(entry)),
            Err(e) => {
                self.current_offset = self.end_offset;
                self.hasher = None;
                Some(Err(e))
            }
        }
    }
}

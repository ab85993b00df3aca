//! File-backed durable store
//!
//! Keeps the whole keyspace in an in-memory `BTreeMap` and makes it durable
//! with a commit log plus periodic checkpoints.
//!
//! ## Lifecycle
//! - `open`: load the newest checkpoint, replay newer commit records
//! - `set`/`clear_range`: update the map, stage a log operation
//! - `commit`: append one record with every staged operation
//! - after a commit, once the log exceeds `checkpoint_bytes`, write a new
//!   checkpoint (tmp file + rename), truncate the log, drop old checkpoints

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::sstable::{SSTableBuilder, SSTableReader};
use super::{map_clear_range, map_read_range, DurableStore};
use crate::config::Config;
use crate::error::{AtlasError, Result};
use crate::types::{Key, KeyRange, RangeResult, Value};
use crate::wal::{Operation, WalRecovery, WalWriter};

const COMMIT_LOG_FILE: &str = "commit.log";

struct LogState {
    wal: WalWriter,
    staged: Vec<Operation>,
    checkpoint_lsn: u64,
}

/// Durable store persisted under a data directory
///
/// ## Concurrency:
/// - `log`: staged operations and the log writer; taken before `image`
/// - `image`: RwLock, readers run concurrently with each other
pub struct FileStore {
    data_dir: PathBuf,
    image: RwLock<BTreeMap<Key, Value>>,
    log: Mutex<LogState>,
    checkpoint_bytes: u64,
    error_tx: Sender<AtlasError>,
    error_rx: Receiver<AtlasError>,
}

impl FileStore {
    /// Open the store configured by `config`
    pub fn open_with_config(config: &Config) -> Result<Self> {
        Self::open(&config.data_dir, config.durable_sync, config.checkpoint_bytes)
    }

    /// Open or create a store in `path`
    pub fn open(path: &Path, sync: bool, checkpoint_bytes: u64) -> Result<Self> {
        fs::create_dir_all(path)?;

        let mut checkpoints: Vec<u64> = Vec::new();
        for entry in fs::read_dir(path)? {
            let file_path = entry?.path();
            if !file_path.is_file() {
                continue;
            }
            if file_path.extension().map_or(false, |ext| ext == "tmp") {
                // Checkpoint that never finished
                fs::remove_file(&file_path)?;
                continue;
            }
            if let Some(lsn) = Self::parse_checkpoint_lsn(&file_path) {
                checkpoints.push(lsn);
            }
        }
        checkpoints.sort_unstable();

        let mut image = BTreeMap::new();
        let checkpoint_lsn = match checkpoints.last() {
            Some(&lsn) => {
                let mut reader = SSTableReader::open(&Self::checkpoint_path(path, lsn))?;
                for entry in reader.iter()? {
                    let (key, value) = entry?;
                    image.insert(Bytes::from(key), Bytes::from(value));
                }
                lsn
            }
            None => 0,
        };

        let log_path = path.join(COMMIT_LOG_FILE);
        let (entries, recovery) = WalRecovery::recover(&log_path)?;
        let mut replayed = 0;
        for entry in entries {
            if entry.lsn <= checkpoint_lsn {
                continue;
            }
            for op in entry.ops {
                apply(&mut image, op);
            }
            replayed += 1;
        }
        info!(
            dir = %path.display(),
            checkpoint_lsn,
            replayed,
            truncated = recovery.was_truncated,
            keys = image.len(),
            "opened file store"
        );

        let wal = WalWriter::open(&log_path, recovery.last_lsn.max(checkpoint_lsn), sync)?;
        let (error_tx, error_rx) = unbounded();
        Ok(Self {
            data_dir: path.to_path_buf(),
            image: RwLock::new(image),
            log: Mutex::new(LogState {
                wal,
                staged: Vec::new(),
                checkpoint_lsn,
            }),
            checkpoint_bytes,
            error_tx,
            error_rx,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// LSN of the newest checkpoint (0 if none)
    pub fn checkpoint_lsn(&self) -> u64 {
        self.log.lock().checkpoint_lsn
    }

    /// Write a checkpoint now and truncate the commit log
    pub fn checkpoint(&self) -> Result<()> {
        let mut log = self.log.lock();
        self.write_checkpoint(&mut log)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Caller holds the log lock with nothing staged
    fn write_checkpoint(&self, log: &mut LogState) -> Result<()> {
        let lsn = log.wal.current_lsn();
        let final_path = Self::checkpoint_path(&self.data_dir, lsn);
        let tmp_path = final_path.with_extension("tmp");

        let mut builder = SSTableBuilder::new(&tmp_path, lsn)?;
        {
            let image = self.image.read();
            for (key, value) in image.iter() {
                builder.add(key, value)?;
            }
        }
        let table = builder.finish()?;
        fs::rename(&tmp_path, &final_path)?;
        log.wal.truncate()?;

        let previous = log.checkpoint_lsn;
        log.checkpoint_lsn = lsn;
        if previous != 0 && previous != lsn {
            let old = Self::checkpoint_path(&self.data_dir, previous);
            if old.exists() {
                fs::remove_file(old)?;
            }
        }
        debug!(
            lsn,
            entries = table.entry_count,
            bytes = table.file_size,
            "wrote checkpoint"
        );
        Ok(())
    }

    /// "checkpoint_000042.sst" → Some(42)
    fn parse_checkpoint_lsn(path: &Path) -> Option<u64> {
        if path.extension()? != "sst" {
            return None;
        }
        let name = path.file_stem()?.to_string_lossy();
        name.strip_prefix("checkpoint_")?.parse().ok()
    }

    fn checkpoint_path(dir: &Path, lsn: u64) -> PathBuf {
        dir.join(format!("checkpoint_{:06}.sst", lsn))
    }
}

impl DurableStore for FileStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        Ok(self.image.read().get(key).cloned())
    }

    fn read_range(&self, range: &KeyRange, limit: i64, byte_limit: usize) -> Result<RangeResult> {
        Ok(map_read_range(&self.image.read(), range, limit, byte_limit))
    }

    fn set(&self, key: Key, value: Value) -> Result<()> {
        let mut log = self.log.lock();
        log.staged.push(Operation::Set {
            key: key.to_vec(),
            value: value.to_vec(),
        });
        self.image.write().insert(key, value);
        Ok(())
    }

    fn clear_range(&self, range: &KeyRange) -> Result<()> {
        let mut log = self.log.lock();
        log.staged.push(Operation::ClearRange {
            begin: range.begin.to_vec(),
            end: range.end.to_vec(),
        });
        map_clear_range(&mut self.image.write(), range);
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut log = self.log.lock();
        if log.staged.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut log.staged);
        let mut result = log.wal.append(ops).map(|_| ());
        if result.is_ok() && log.wal.size() >= self.checkpoint_bytes {
            result = self.write_checkpoint(&mut log);
        }
        if let Err(e) = &result {
            let _ = self
                .error_tx
                .send(AtlasError::Storage(format!("commit failed: {}", e)));
        }
        result
    }

    fn error_stream(&self) -> Receiver<AtlasError> {
        self.error_rx.clone()
    }
}

fn apply(image: &mut BTreeMap<Key, Value>, op: Operation) {
    match op {
        Operation::Set { key, value } => {
            image.insert(Bytes::from(key), Bytes::from(value));
        }
        Operation::ClearRange { begin, end } => {
            map_clear_range(image, &KeyRange::new(Bytes::from(begin), Bytes::from(end)));
        }
    }
}

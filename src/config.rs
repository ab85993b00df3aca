//! Configuration for AtlasNode
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AtlasError, Result};

/// Main configuration for an AtlasNode storage engine
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Identity / Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for the file-backed durable store
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── commit.log            (CRC-checked commit log)
    ///     └── checkpoint_NNNNNN.sst (sorted checkpoint files)
    pub data_dir: PathBuf,

    /// Identity persisted under `\xff\xff/ID`; a mismatch on restore is fatal
    pub node_id: u64,

    /// fsync the commit log on every durable commit
    pub durable_sync: bool,

    /// Commit log size (bytes) after which the file store writes a checkpoint
    pub checkpoint_bytes: u64,

    // -------------------------------------------------------------------------
    // Version Window Configuration
    // -------------------------------------------------------------------------
    /// Versions kept readable behind the latest applied version
    pub retention_versions: u64,

    /// Hard limit on `version - durable_version`; the applier blocks beyond it
    pub max_version_lag: u64,

    /// Reads further than this ahead of `version` fail immediately
    pub max_versions_in_flight: u64,

    // -------------------------------------------------------------------------
    // Durability Loop Configuration
    // -------------------------------------------------------------------------
    /// Mutation bytes drained per durability iteration (bounds commit latency)
    pub durability_bytes_per_iteration: usize,

    /// Idle wait between durability iterations (milliseconds)
    pub durability_interval_ms: u64,

    /// Durable commits slower than this are fatal (milliseconds)
    pub commit_timeout_ms: u64,

    // -------------------------------------------------------------------------
    // Read Path Configuration
    // -------------------------------------------------------------------------
    /// Durable-store read timeout (milliseconds)
    pub read_timeout_ms: u64,

    /// How long a read waits for its version to be applied (milliseconds)
    pub future_version_timeout_ms: u64,

    /// Outstanding reads before new reads are rejected as overloaded
    pub max_concurrent_reads: usize,

    /// Worker threads serving asynchronous durable-store reads
    pub read_pool_threads: usize,

    // -------------------------------------------------------------------------
    // Fetch (Shard Migration) Configuration
    // -------------------------------------------------------------------------
    /// Fetches allowed to stream blocks at the same time
    pub fetch_parallelism: usize,

    /// Bytes requested from the peer per block
    pub fetch_block_bytes: usize,

    /// Global budget of fetched bytes not yet made durable
    pub fetch_budget_bytes: usize,

    /// Bytes one fetch copies before splitting off the remainder
    pub fetch_iteration_bytes: usize,

    /// Base backoff after a failed peer request (milliseconds)
    pub fetch_retry_backoff_ms: u64,

    // -------------------------------------------------------------------------
    // Update Pipeline Configuration
    // -------------------------------------------------------------------------
    /// How long the applier waits on the log cursor per poll (milliseconds)
    pub log_poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./atlasnode_data"),
            node_id: 1,
            durable_sync: true,
            checkpoint_bytes: 64 * 1024 * 1024, // 64 MB
            retention_versions: 5_000_000,
            max_version_lag: 20_000_000,
            max_versions_in_flight: 100_000_000,
            durability_bytes_per_iteration: 4 * 1024 * 1024, // 4 MB
            durability_interval_ms: 10,
            commit_timeout_ms: 60_000,
            read_timeout_ms: 5000,
            future_version_timeout_ms: 1000,
            max_concurrent_reads: 1024,
            read_pool_threads: 4,
            fetch_parallelism: 2,
            fetch_block_bytes: 256 * 1024,
            fetch_budget_bytes: 64 * 1024 * 1024,
            fetch_iteration_bytes: 16 * 1024 * 1024,
            fetch_retry_backoff_ms: 50,
            log_poll_interval_ms: 20,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject settings the loops cannot honor together
    pub fn validate(&self) -> Result<()> {
        if self.max_version_lag <= self.retention_versions {
            return Err(AtlasError::Config(format!(
                "max_version_lag ({}) must exceed retention_versions ({})",
                self.max_version_lag, self.retention_versions
            )));
        }
        if self.read_pool_threads == 0 {
            return Err(AtlasError::Config("read_pool_threads must be > 0".to_string()));
        }
        if self.fetch_parallelism == 0 {
            return Err(AtlasError::Config("fetch_parallelism must be > 0".to_string()));
        }
        if self.fetch_block_bytes == 0 || self.fetch_budget_bytes < self.fetch_block_bytes {
            return Err(AtlasError::Config(
                "fetch_budget_bytes must hold at least one fetch block".to_string(),
            ));
        }
        if self.durability_bytes_per_iteration == 0 {
            return Err(AtlasError::Config(
                "durability_bytes_per_iteration must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn future_version_timeout(&self) -> Duration {
        Duration::from_millis(self.future_version_timeout_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    pub fn durability_interval(&self) -> Duration {
        Duration::from_millis(self.durability_interval_ms)
    }

    pub fn log_poll_interval(&self) -> Duration {
        Duration::from_millis(self.log_poll_interval_ms)
    }

    pub fn fetch_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_backoff_ms)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for the file store)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the node identity
    pub fn node_id(mut self, id: u64) -> Self {
        self.config.node_id = id;
        self
    }

    /// Enable or disable fsync on durable commit
    pub fn durable_sync(mut self, sync: bool) -> Self {
        self.config.durable_sync = sync;
        self
    }

    /// Set the commit log size that triggers a checkpoint
    pub fn checkpoint_bytes(mut self, bytes: u64) -> Self {
        self.config.checkpoint_bytes = bytes;
        self
    }

    /// Set how many versions stay readable behind the latest version
    pub fn retention_versions(mut self, versions: u64) -> Self {
        self.config.retention_versions = versions;
        self
    }

    /// Set the hard limit on non-durable versions
    pub fn max_version_lag(mut self, versions: u64) -> Self {
        self.config.max_version_lag = versions;
        self
    }

    /// Set how far ahead of `version` a read may ask
    pub fn max_versions_in_flight(mut self, versions: u64) -> Self {
        self.config.max_versions_in_flight = versions;
        self
    }

    /// Set the mutation bytes drained per durability iteration
    pub fn durability_bytes_per_iteration(mut self, bytes: usize) -> Self {
        self.config.durability_bytes_per_iteration = bytes;
        self
    }

    /// Set the idle wait between durability iterations (in milliseconds)
    pub fn durability_interval_ms(mut self, ms: u64) -> Self {
        self.config.durability_interval_ms = ms;
        self
    }

    /// Set the fatal commit timeout (in milliseconds)
    pub fn commit_timeout_ms(mut self, ms: u64) -> Self {
        self.config.commit_timeout_ms = ms;
        self
    }

    /// Set the read timeout (in milliseconds)
    pub fn read_timeout_ms(mut self, ms: u64) -> Self {
        self.config.read_timeout_ms = ms;
        self
    }

    /// Set how long reads wait for a future version (in milliseconds)
    pub fn future_version_timeout_ms(mut self, ms: u64) -> Self {
        self.config.future_version_timeout_ms = ms;
        self
    }

    /// Set the maximum number of outstanding reads
    pub fn max_concurrent_reads(mut self, count: usize) -> Self {
        self.config.max_concurrent_reads = count;
        self
    }

    /// Set the number of read pool threads
    pub fn read_pool_threads(mut self, count: usize) -> Self {
        self.config.read_pool_threads = count;
        self
    }

    /// Set the number of fetches streaming at once
    pub fn fetch_parallelism(mut self, count: usize) -> Self {
        self.config.fetch_parallelism = count;
        self
    }

    /// Set the fetch block size (in bytes)
    pub fn fetch_block_bytes(mut self, bytes: usize) -> Self {
        self.config.fetch_block_bytes = bytes;
        self
    }

    /// Set the global fetch byte budget
    pub fn fetch_budget_bytes(mut self, bytes: usize) -> Self {
        self.config.fetch_budget_bytes = bytes;
        self
    }

    /// Set the per-fetch bytes copied before splitting
    pub fn fetch_iteration_bytes(mut self, bytes: usize) -> Self {
        self.config.fetch_iteration_bytes = bytes;
        self
    }

    /// Set the base fetch retry backoff (in milliseconds)
    pub fn fetch_retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.fetch_retry_backoff_ms = ms;
        self
    }

    /// Set the log cursor poll interval (in milliseconds)
    pub fn log_poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.log_poll_interval_ms = ms;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

//! Shared setup for the engine-level tests
#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use atlasnode::config::ConfigBuilder;
use atlasnode::peer::MemoryPeer;
use atlasnode::storage::MemoryStore;
use atlasnode::tlog::MemoryLog;
use atlasnode::{Config, Engine, KeyRange, Mutation, RangeResult, Version};
use bytes::Bytes;

/// Upper bound on any wait in these tests
pub const WAIT: Duration = Duration::from_secs(10);

/// Config with every loop polling fast
pub fn fast_config() -> ConfigBuilder {
    Config::builder()
        .durability_interval_ms(2)
        .log_poll_interval_ms(2)
        .fetch_retry_backoff_ms(2)
        .future_version_timeout_ms(50)
}

pub fn r(b: &'static str, e: &'static str) -> KeyRange {
    KeyRange::new(Bytes::from_static(b.as_bytes()), Bytes::from_static(e.as_bytes()))
}

/// `(key, value)` pairs of a range result as strings
pub fn rows(result: &RangeResult) -> Vec<(String, String)> {
    result
        .rows
        .iter()
        .map(|kv| {
            (
                String::from_utf8_lossy(&kv.key).into_owned(),
                String::from_utf8_lossy(&kv.value).into_owned(),
            )
        })
        .collect()
}

/// An engine over in-memory collaborators, fed one version at a time
pub struct Harness {
    pub engine: Engine,
    pub log: MemoryLog,
    pub store: Arc<MemoryStore>,
    pub peer: Arc<MemoryPeer>,
    next: Version,
}

impl Harness {
    pub fn open(config: Config) -> Self {
        Self::open_with(
            config,
            Arc::new(MemoryStore::new()),
            MemoryLog::new(),
            Arc::new(MemoryPeer::new()),
        )
    }

    /// Open over existing collaborators, e.g. after a simulated crash
    pub fn open_with(
        config: Config,
        store: Arc<MemoryStore>,
        log: MemoryLog,
        peer: Arc<MemoryPeer>,
    ) -> Self {
        let engine = Engine::open(config, store.clone(), Box::new(log.cursor()), peer.clone()).unwrap();
        let next = log.last_version().max(engine.version()) + 1;
        Self {
            engine,
            log,
            store,
            peer,
            next,
        }
    }

    /// Engine with the whole keyspace assigned empty at version 1
    pub fn assigned(config: Config) -> Self {
        let mut harness = Self::open(config);
        harness.commit(vec![Mutation::assign_range(&KeyRange::all(), true)]);
        harness
    }

    /// Push a batch at the next version without waiting for it
    pub fn push(&mut self, mutations: Vec<Mutation>) -> Version {
        let version = self.next;
        self.next += 1;
        self.log.push(version, mutations).unwrap();
        version
    }

    /// Push a batch and wait until it is applied
    pub fn commit(&mut self, mutations: Vec<Mutation>) -> Version {
        let version = self.push(mutations);
        assert!(
            self.engine.wait_for_version(version, WAIT),
            "version {} never applied (fatal: {:?})",
            version,
            self.engine.fatal_error()
        );
        version
    }

    /// Push a message the engine skips
    pub fn skip(&mut self) -> Version {
        let version = self.next;
        self.next += 1;
        self.log.push_skip(version).unwrap();
        version
    }

    /// Push empty batches until `done` holds; false on timeout
    ///
    /// Fetches move to their transfer only when a later version arrives.
    pub fn pump_until(&mut self, done: impl Fn(&Engine) -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        loop {
            if done(&self.engine) {
                return true;
            }
            if Instant::now() >= deadline || !self.engine.is_running() {
                return false;
            }
            self.commit(Vec::new());
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Pump until every shard overlapping `range` serves reads
    pub fn pump_until_readable(&mut self, range: &KeyRange) -> bool {
        let range = range.clone();
        self.pump_until(move |engine| engine.wait_readable(&range, Duration::ZERO))
    }

    pub fn get(&self, key: &str, version: Version) -> Option<String> {
        self.engine
            .get(key.as_bytes(), version)
            .unwrap()
            .map(|v| String::from_utf8_lossy(&v).into_owned())
    }

    pub fn scan(&self, range: &KeyRange, version: Version) -> Vec<(String, String)> {
        rows(&self.engine.get_range(range, version, 1000, usize::MAX).unwrap())
    }

    /// Decode the durable store's committed user rows
    pub fn committed_user_rows(&self) -> Vec<(String, String)> {
        self.store
            .committed_rows()
            .into_iter()
            .filter(|kv| kv.key.as_ref() < b"\xff".as_slice())
            .map(|kv| {
                (
                    String::from_utf8_lossy(&kv.key).into_owned(),
                    String::from_utf8_lossy(&kv.value).into_owned(),
                )
            })
            .collect()
    }
}

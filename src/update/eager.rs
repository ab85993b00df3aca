//! Eager reads
//!
//! Before a batch is expanded, every durable value an atomic operation needs
//! and every next-key a clear-range extension needs is read in parallel on
//! the read pool. The results live for one batch only.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::EngineContext;
use crate::error::{AtlasError, Result};
use crate::mutation::Mutation;
use crate::storage::{next_user_key, DurableStore};
use crate::types::{Key, Value};

enum Answer {
    Value(Key, Option<Value>),
    NextKey(Key, Option<Key>),
}

type Job = Box<dyn FnOnce() -> Result<Answer> + Send>;

/// Keys a batch must read from the durable store before expansion
#[derive(Debug, Default)]
pub struct EagerReads {
    values: BTreeSet<Key>,
    clear_ends: BTreeSet<Key>,
}

impl EagerReads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note what `mutation` will need
    pub fn add(&mut self, mutation: &Mutation) {
        match mutation {
            Mutation::Atomic { key, .. } => {
                self.values.insert(key.clone());
            }
            Mutation::ClearRange { end, .. } => {
                self.clear_ends.insert(end.clone());
            }
            Mutation::Set { .. } => {}
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.clear_ends.is_empty()
    }

    /// Issue every read, retrying reads that time out until the engine stops
    pub fn run(self, ctx: &EngineContext) -> Result<EagerResults> {
        let mut results = EagerResults::default();
        if self.is_empty() {
            return Ok(results);
        }
        let mut attempt = 0u32;
        loop {
            let jobs = self.jobs(&ctx.durable);
            match ctx.read_pool.run_all(ctx.config.read_timeout(), "eager reads", jobs) {
                Ok(answers) => {
                    for answer in answers {
                        match answer {
                            Answer::Value(key, value) => {
                                results.values.insert(key, value);
                            }
                            Answer::NextKey(key, next) => {
                                results.next_keys.insert(key, next);
                            }
                        }
                    }
                    debug!(
                        values = results.values.len(),
                        next_keys = results.next_keys.len(),
                        "eager reads done"
                    );
                    return Ok(results);
                }
                Err(AtlasError::Timeout(what)) => {
                    attempt += 1;
                    warn!(attempt, what = %what, "eager reads timed out, retrying");
                    if ctx.is_stopping() {
                        return Err(ctx.stopped_error());
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn jobs(&self, durable: &Arc<dyn DurableStore>) -> Vec<Job> {
        let mut jobs: Vec<Job> = Vec::with_capacity(self.values.len() + self.clear_ends.len());
        for key in &self.values {
            let store = durable.clone();
            let key = key.clone();
            jobs.push(Box::new(move || {
                let value = store.get(&key)?;
                Ok(Answer::Value(key, value))
            }));
        }
        for end in &self.clear_ends {
            let store = durable.clone();
            let end = end.clone();
            jobs.push(Box::new(move || {
                let next = next_user_key(store.as_ref(), &end)?;
                Ok(Answer::NextKey(end, next))
            }));
        }
        jobs
    }
}

/// Durable values and next keys read for one batch
#[derive(Debug, Default)]
pub struct EagerResults {
    values: HashMap<Key, Option<Value>>,
    next_keys: HashMap<Key, Option<Key>>,
}

impl EagerResults {
    /// Durable value of `key`; `None` in the outer option if it was not read
    pub fn value(&self, key: &[u8]) -> Option<Option<&Value>> {
        self.values.get(key).map(|v| v.as_ref())
    }

    /// First durable user key at or after `key`, if it was read
    pub fn next_key(&self, key: &[u8]) -> Option<Option<&Key>> {
        self.next_keys.get(key).map(|k| k.as_ref())
    }
}

//! Read pool
//!
//! Worker threads that run durable-store reads so callers can wait with a
//! timeout. Workers exit once the pool is dropped and the job queue drains.

use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, RecvTimeoutError, Sender};
use tracing::warn;

use crate::error::{AtlasError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool of durable-read workers
pub struct ReadPool {
    jobs: Sender<Job>,
    threads: usize,
}

impl ReadPool {
    pub fn new(threads: usize) -> Result<Self> {
        let (jobs, queue) = unbounded::<Job>();
        for i in 0..threads {
            let queue = queue.clone();
            thread::Builder::new()
                .name(format!("read-pool-{}", i))
                .spawn(move || {
                    for job in queue.iter() {
                        job();
                    }
                })?;
        }
        Ok(Self { jobs, threads })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run `job` on a worker, waiting at most `timeout` for its result
    ///
    /// On timeout the job keeps running; its result is discarded.
    pub fn run<T, F>(&self, timeout: Duration, what: &str, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.jobs
            .send(Box::new(move || {
                let _ = tx.send(job());
            }))
            .map_err(|_| AtlasError::ShuttingDown)?;
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(what, timeout_ms = timeout.as_millis() as u64, "durable read timed out");
                Err(AtlasError::Timeout(format!("durable read: {}", what)))
            }
            Err(RecvTimeoutError::Disconnected) => Err(AtlasError::Storage(format!(
                "read worker exited during {}",
                what
            ))),
        }
    }

    /// Run every job in parallel and wait for all of them within `timeout`
    ///
    /// Results come back in input order.
    pub fn run_all<T, F>(&self, timeout: Duration, what: &str, jobs: Vec<F>) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let mut pending = Vec::with_capacity(jobs.len());
        for job in jobs {
            let (tx, rx) = bounded(1);
            self.jobs
                .send(Box::new(move || {
                    let _ = tx.send(job());
                }))
                .map_err(|_| AtlasError::ShuttingDown)?;
            pending.push(rx);
        }

        let deadline = std::time::Instant::now() + timeout;
        let mut results = Vec::with_capacity(pending.len());
        for rx in pending {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(result) => results.push(result?),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(AtlasError::Timeout(format!("durable reads: {}", what)))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(AtlasError::Storage(format!(
                        "read worker exited during {}",
                        what
                    )))
                }
            }
        }
        Ok(results)
    }
}

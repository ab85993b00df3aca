//! Update Module
//!
//! The apply pipeline: the mutation log, per-batch eager reads and the
//! update applier that consumes the replicated mutation stream.

mod applier;
mod eager;
mod log;

pub use applier::{BatchOutcome, UpdateApplier};
pub use eager::{EagerReads, EagerResults};
pub use log::{LogEntry, MutationLog};

//! MVCC Module
//!
//! In-memory multi-version index for recently applied mutations.
//!
//! ## Responsibilities
//! - Answer point and range reads "as of version V"
//! - Single writer (the update applier) concurrent with many pinned readers
//! - O(1) version snapshots via structural sharing
//! - Forget versions below the oldest readable version
//! - Reclaim entries once the durable store holds their data
//!
//! ## Data Structure Choice
//! A persistent treap (copy-on-write, path copying). Each version keeps its own
//! root; roots share every subtree the writer did not touch. A reader holding
//! a [`VersionedView`] keeps its root alive no matter how far the oldest
//! version advances.
//!
//! ```text
//!  roots:  v10 ──┐    v11 ──┐    v12 (latest, writable)
//!                ▼          ▼          ▼
//!              [m]        [m']       [m'']
//!             /   \      /   \      /    \
//!           [c]   [t]  [c]  [t']  [c'']  [t']     shared subtrees
//! ```

mod store;
pub(crate) mod tree;

pub use store::{MemEntry, StoreStats, VersionedStore, VersionedView};
pub use tree::Entry;

use crate::types::Value;

/// Result of a point lookup in memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The key holds this value at the view's version
    Value(Value),
    /// The key was cleared at or before the view's version
    Cleared,
    /// Memory knows nothing newer than the durable store
    Missing,
}

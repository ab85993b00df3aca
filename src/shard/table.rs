//! ShardTable implementation
//!
//! Descriptors live in a `BTreeMap` keyed by range begin and always tile
//! `["", "\xff")` exactly. Migrations live in a second map keyed by
//! [`FetchId`]; descriptors refer to them by id only.

use std::collections::BTreeMap;
use std::ops::Bound;

use super::adding::{AddingShard, FetchHandle, FetchPhase, Transfer};
use super::{FetchId, ShardDescriptor, ShardState};
use crate::error::{AtlasError, Result};
use crate::mutation::Mutation;
use crate::types::{printable, Key, KeyRange, Version, KEYSPACE_END};

/// What an unassignment asks the applier to do
#[derive(Debug, Default)]
pub struct UnassignOutcome {
    /// Applied pieces; cleared with a `ClearRange` at the batch version
    pub cleared: Vec<KeyRange>,
    /// Copies cancelled mid-flight, with the piece they no longer own
    pub cancelled: Vec<(KeyRange, FetchHandle)>,
    /// New fetches for the parts of cancelled copies that stay assigned
    pub restarted: Vec<FetchId>,
}

pub struct ShardTable {
    shards: BTreeMap<Key, ShardDescriptor>,
    adding: BTreeMap<FetchId, AddingShard>,
    /// High-water versions of unassigned ranges; no fetch starts on an
    /// overlapping range until that version is durable
    dirty: Vec<(KeyRange, Version)>,
    epoch: u64,
    next_fetch: FetchId,
}

impl ShardTable {
    /// Whole keyspace unassigned
    pub fn new() -> Self {
        Self::with_epoch(0)
    }

    fn with_epoch(epoch: u64) -> Self {
        let all = KeyRange::all();
        let mut shards = BTreeMap::new();
        shards.insert(
            all.begin.clone(),
            ShardDescriptor {
                range: all,
                state: ShardState::Unassigned,
                changed_at: epoch,
            },
        );
        Self {
            shards,
            adding: BTreeMap::new(),
            dirty: Vec::new(),
            epoch,
            next_fetch: 1,
        }
    }

    /// Rebuild from persisted `(range, assigned, available)` runs
    ///
    /// Epochs continue after `epoch` so readers that started against the
    /// old table fail validation. Returns the fetches to start.
    pub fn from_persisted(
        runs: &[(KeyRange, bool, bool)],
        version: Version,
        epoch: u64,
        next_fetch: FetchId,
    ) -> (Self, Vec<FetchId>) {
        let mut table = Self::with_epoch(epoch + 1);
        table.next_fetch = next_fetch.max(1);
        let mut fetches = Vec::new();
        for (range, assigned, available) in runs {
            match (assigned, available) {
                (true, true) => table.set_range(
                    range,
                    ShardState::ReadWrite {
                        readable_since: version,
                    },
                ),
                (true, false) => fetches.push(table.add_fetch(range)),
                _ => {}
            }
        }
        (table, fetches)
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Current epoch; bumped by every descriptor change
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Next id this table would hand out
    pub fn next_fetch_id(&self) -> FetchId {
        self.next_fetch
    }

    /// Descriptor containing `key`
    pub fn descriptor_at(&self, key: &[u8]) -> Option<&ShardDescriptor> {
        self.shards
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(_, d)| d)
    }

    /// Descriptor containing the last key below `key`
    pub fn descriptor_before(&self, key: &[u8]) -> Option<&ShardDescriptor> {
        self.shards
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
            .map(|(_, d)| d)
    }

    /// Widest run of adjacent descriptors readable at `version` around the
    /// one holding `key` (the one ending at `key` when `before`)
    ///
    /// Neighbors that became readable at different versions stay separate
    /// descriptors; a read spans them as long as each is readable.
    pub fn readable_run(&self, key: &[u8], before: bool, version: Version) -> Option<KeyRange> {
        let start = if before {
            self.descriptor_before(key)
        } else {
            self.descriptor_at(key)
        }?;
        if !start.readable_at(version, self.epoch) {
            return None;
        }
        let mut begin = start.range.begin.clone();
        let mut end = start.range.end.clone();
        for desc in self.shards.range(end.clone()..).map(|(_, d)| d) {
            if !desc.readable_at(version, self.epoch) {
                break;
            }
            end = desc.range.end.clone();
        }
        for desc in self.shards.range(..begin.clone()).rev().map(|(_, d)| d) {
            if !desc.readable_at(version, self.epoch) {
                break;
            }
            begin = desc.range.begin.clone();
        }
        Some(KeyRange::new(begin, end))
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ShardDescriptor> {
        self.shards.values()
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Descriptors overlapping `range`, clipped to it
    pub fn pieces(&self, range: &KeyRange) -> Vec<(KeyRange, ShardState)> {
        if range.is_empty() {
            return Vec::new();
        }
        let start = match self.descriptor_at(&range.begin) {
            Some(d) => d.range.begin.clone(),
            None => return Vec::new(),
        };
        self.shards
            .range(start..range.end.clone())
            .filter_map(|(_, d)| d.range.clip(range).map(|piece| (piece, d.state)))
            .collect()
    }

    /// Fail with `WrongShard` unless every descriptor overlapping `range` is
    /// readable at `version` and unchanged since `epoch`
    pub fn validate_read(&self, range: &KeyRange, version: Version, epoch: u64) -> Result<()> {
        let start = match self.descriptor_at(&range.begin) {
            Some(d) => d.range.begin.clone(),
            None => return Err(AtlasError::WrongShard),
        };
        let end = range.end.clone().max(start.clone());
        let mut covered = false;
        for (_, desc) in self.shards.range(start..end) {
            covered = true;
            if !desc.readable_at(version, epoch) {
                return Err(AtlasError::WrongShard);
            }
        }
        if !covered {
            // Empty range: only its begin key's descriptor matters
            let desc = self.descriptor_at(&range.begin).ok_or(AtlasError::WrongShard)?;
            if !desc.readable_at(version, epoch) {
                return Err(AtlasError::WrongShard);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Assignment
    // =========================================================================

    /// Assign `range` at `version`; returns fetches to start
    ///
    /// Pieces already assigned are left alone.
    pub fn assign(&mut self, range: &KeyRange, known_empty: bool, version: Version) -> Vec<FetchId> {
        let mut fetches = Vec::new();
        for (piece, state) in self.pieces(range) {
            if state != ShardState::Unassigned {
                continue;
            }
            if known_empty {
                self.set_range(
                    &piece,
                    ShardState::ReadWrite {
                        readable_since: version,
                    },
                );
            } else {
                fetches.push(self.add_fetch(&piece));
            }
        }
        fetches
    }

    /// Unassign `range` at `version`
    pub fn unassign(&mut self, range: &KeyRange, version: Version) -> UnassignOutcome {
        let mut out = UnassignOutcome::default();
        for (piece, state) in self.pieces(range) {
            match state {
                ShardState::Unassigned => {}
                ShardState::ReadWrite { .. } | ShardState::Waiting { .. } => {
                    self.mark_dirty(piece.clone(), version);
                    out.cleared.push(piece);
                }
                ShardState::Fetching { fetch } => {
                    let Some(adding) = self.adding.remove(&fetch) else {
                        continue;
                    };
                    adding.handle.cancel();
                    self.mark_dirty(piece.clone(), version);
                    for remainder in subtract(&adding.range, range) {
                        let id = self.allocate_fetch();
                        let mut child = AddingShard::new(id, remainder.clone());
                        child.backlog = adding.backlog_within(&remainder);
                        self.adding.insert(id, child);
                        self.set_range(&remainder, ShardState::Fetching { fetch: id });
                        out.restarted.push(id);
                    }
                    out.cancelled.push((piece, adding.handle.clone()));
                }
            }
        }
        self.set_range(range, ShardState::Unassigned);
        out
    }

    // =========================================================================
    // Migration Arena
    // =========================================================================

    pub fn fetch(&self, id: FetchId) -> Option<&AddingShard> {
        self.adding.get(&id)
    }

    pub fn fetch_ids(&self) -> Vec<FetchId> {
        self.adding.keys().copied().collect()
    }

    pub fn fetch_handle(&self, id: FetchId) -> Option<FetchHandle> {
        self.adding.get(&id).map(|a| a.handle.clone())
    }

    /// Buffer a mutation for a fetching range
    pub fn buffer(&mut self, id: FetchId, version: Version, mutation: Mutation) {
        if let Some(adding) = self.adding.get_mut(&id) {
            adding.buffer(version, mutation);
        }
    }

    /// Record the snapshot version; drops backlog the snapshot already holds
    pub fn start_fetch(&mut self, id: FetchId, fetch_version: Version) -> bool {
        match self.adding.get_mut(&id) {
            Some(adding) => {
                adding.fetch_version = Some(fetch_version);
                adding.backlog.retain(|(v, _)| *v > fetch_version);
                true
            }
            None => false,
        }
    }

    /// Split `[at, end)` off a fetch into a new fetch with its own backlog
    pub fn split_fetch(&mut self, id: FetchId, at: &Key) -> Option<FetchId> {
        let (left, right, backlog_left, backlog_right) = {
            let adding = self.adding.get(&id)?;
            if *at <= adding.range.begin || *at >= adding.range.end {
                return None;
            }
            let left = KeyRange::new(adding.range.begin.clone(), at.clone());
            let right = KeyRange::new(at.clone(), adding.range.end.clone());
            let backlog_left = adding.backlog_within(&left);
            let backlog_right = adding.backlog_within(&right);
            (left, right, backlog_left, backlog_right)
        };

        let new_id = self.allocate_fetch();
        let mut child = AddingShard::new(new_id, right.clone());
        child.backlog = backlog_right;
        self.adding.insert(new_id, child);
        if let Some(parent) = self.adding.get_mut(&id) {
            parent.range = left;
            parent.backlog = backlog_left;
        }
        self.set_range(&right, ShardState::Fetching { fetch: new_id });
        Some(new_id)
    }

    /// Copy finished; the applier transfers at its next batch
    pub fn complete_fetch(&mut self, id: FetchId) -> bool {
        match self.adding.get_mut(&id) {
            Some(adding) if adding.phase == FetchPhase::Fetching => {
                adding.phase = FetchPhase::Complete;
                true
            }
            _ => false,
        }
    }

    pub fn completed_fetches(&self) -> Vec<FetchId> {
        self.adding
            .iter()
            .filter(|(_, a)| a.phase == FetchPhase::Complete)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn fetch_phase(&self, id: FetchId) -> Option<FetchPhase> {
        self.adding.get(&id).map(|a| a.phase)
    }

    /// Move a completed fetch to `Waiting` at `version`, handing back its backlog
    pub fn begin_transfer(&mut self, id: FetchId, version: Version) -> Option<Transfer> {
        let (range, backlog) = {
            let adding = self.adding.get_mut(&id)?;
            if adding.phase != FetchPhase::Complete {
                return None;
            }
            adding.phase = FetchPhase::Waiting {
                transferred: version,
            };
            (adding.range.clone(), std::mem::take(&mut adding.backlog))
        };
        for piece in self.ranges_of(|s| s == ShardState::Fetching { fetch: id }) {
            self.set_range(
                &piece,
                ShardState::Waiting {
                    fetch: id,
                    transferred: version,
                },
            );
        }
        Some(Transfer {
            fetch: id,
            range,
            backlog,
        })
    }

    /// Flip whatever is still `Waiting` for this fetch to `ReadWrite`
    pub fn finish_fetch(&mut self, id: FetchId) -> Vec<KeyRange> {
        self.adding.remove(&id);
        let waiting: Vec<(KeyRange, Version)> = self
            .shards
            .values()
            .filter_map(|d| match d.state {
                ShardState::Waiting { fetch, transferred } if fetch == id => {
                    Some((d.range.clone(), transferred))
                }
                _ => None,
            })
            .collect();
        for (range, transferred) in &waiting {
            self.set_range(
                range,
                ShardState::ReadWrite {
                    readable_since: *transferred,
                },
            );
        }
        waiting.into_iter().map(|(r, _)| r).collect()
    }

    /// Cancel every migration (rollback)
    pub fn cancel_all(&mut self) -> Vec<FetchHandle> {
        let handles: Vec<FetchHandle> = self.adding.values().map(|a| a.handle.clone()).collect();
        for handle in &handles {
            handle.cancel();
        }
        handles
    }

    // =========================================================================
    // Dirty Ranges
    // =========================================================================

    pub fn mark_dirty(&mut self, range: KeyRange, version: Version) {
        self.dirty.push((range, version));
    }

    /// Highest dirty version overlapping `range` that is not yet durable
    pub fn dirty_version(&mut self, range: &KeyRange, durable: Version) -> Option<Version> {
        self.dirty.retain(|(_, v)| *v > durable);
        self.dirty
            .iter()
            .filter(|(r, _)| r.intersects(range))
            .map(|(_, v)| *v)
            .max()
    }

    // =========================================================================
    // Invariants
    // =========================================================================

    /// Full coverage, no overlap, coalesced neighbors, live fetch references
    pub fn check_invariants(&self) -> Result<()> {
        let mut expected_begin = Key::new();
        let mut prev: Option<&ShardDescriptor> = None;
        for (begin, desc) in &self.shards {
            if *begin != desc.range.begin || desc.range.begin != expected_begin {
                return Err(AtlasError::InvariantViolation(format!(
                    "shard map gap or overlap at {}",
                    printable(begin)
                )));
            }
            if desc.range.is_empty() {
                return Err(AtlasError::InvariantViolation(format!(
                    "empty shard descriptor at {}",
                    printable(begin)
                )));
            }
            if let Some(p) = prev {
                if coalesces(p, desc) {
                    return Err(AtlasError::InvariantViolation(format!(
                        "uncoalesced shards {:?} and {:?}",
                        p.range, desc.range
                    )));
                }
            }
            if let Some(id) = desc.state.fetch_id() {
                if !self.adding.contains_key(&id) {
                    return Err(AtlasError::InvariantViolation(format!(
                        "shard {:?} refers to unknown fetch {}",
                        desc.range, id
                    )));
                }
            }
            expected_begin = desc.range.end.clone();
            prev = Some(desc);
        }
        if expected_begin.as_ref() != KEYSPACE_END {
            return Err(AtlasError::InvariantViolation(format!(
                "shard map ends at {}",
                printable(&expected_begin)
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn allocate_fetch(&mut self) -> FetchId {
        let id = self.next_fetch;
        self.next_fetch += 1;
        id
    }

    fn add_fetch(&mut self, range: &KeyRange) -> FetchId {
        let id = self.allocate_fetch();
        self.adding.insert(id, AddingShard::new(id, range.clone()));
        self.set_range(range, ShardState::Fetching { fetch: id });
        id
    }

    fn ranges_of(&self, pred: impl Fn(ShardState) -> bool) -> Vec<KeyRange> {
        self.shards
            .values()
            .filter(|d| pred(d.state))
            .map(|d| d.range.clone())
            .collect()
    }

    fn split_at(&mut self, key: &Key) {
        if key.is_empty() || key.as_ref() >= KEYSPACE_END {
            return;
        }
        let Some(desc) = self.descriptor_at(key).cloned() else {
            return;
        };
        if desc.range.begin == *key {
            return;
        }
        let mut left = desc.clone();
        left.range.end = key.clone();
        let mut right = desc;
        right.range.begin = key.clone();
        self.shards.insert(left.range.begin.clone(), left);
        self.shards.insert(right.range.begin.clone(), right);
    }

    /// Replace everything in `range` with one descriptor in `state`
    fn set_range(&mut self, range: &KeyRange, state: ShardState) {
        if range.is_empty() {
            return;
        }
        self.split_at(&range.begin);
        self.split_at(&range.end);
        let inside: Vec<Key> = self
            .shards
            .range(range.begin.clone()..range.end.clone())
            .map(|(k, _)| k.clone())
            .collect();
        for key in inside {
            self.shards.remove(&key);
        }
        self.epoch += 1;
        self.shards.insert(
            range.begin.clone(),
            ShardDescriptor {
                range: range.clone(),
                state,
                changed_at: self.epoch,
            },
        );
        self.coalesce();
    }

    fn coalesce(&mut self) {
        let mut merged = BTreeMap::new();
        let mut current: Option<ShardDescriptor> = None;
        for (_, desc) in std::mem::take(&mut self.shards) {
            current = match current {
                Some(mut prev) if coalesces(&prev, &desc) => {
                    prev.range.end = desc.range.end;
                    prev.changed_at = prev.changed_at.max(desc.changed_at);
                    Some(prev)
                }
                Some(prev) => {
                    merged.insert(prev.range.begin.clone(), prev);
                    Some(desc)
                }
                None => Some(desc),
            };
        }
        if let Some(last) = current {
            merged.insert(last.range.begin.clone(), last);
        }
        self.shards = merged;
    }
}

impl Default for ShardTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Adjacent descriptors that merge into one
///
/// Read-write neighbors merge only when they became readable at the same
/// version in the same epoch, so a merge never changes what a reader sees.
fn coalesces(a: &ShardDescriptor, b: &ShardDescriptor) -> bool {
    match (a.state, b.state) {
        (ShardState::Unassigned, ShardState::Unassigned) => true,
        (ShardState::ReadWrite { .. }, ShardState::ReadWrite { .. }) => {
            a.state == b.state && a.changed_at == b.changed_at
        }
        _ => false,
    }
}

/// Parts of `range` outside `removed`
fn subtract(range: &KeyRange, removed: &KeyRange) -> Vec<KeyRange> {
    let mut parts = Vec::with_capacity(2);
    if range.begin < removed.begin {
        parts.push(KeyRange::new(
            range.begin.clone(),
            removed.begin.clone().min(range.end.clone()),
        ));
    }
    if removed.end < range.end {
        parts.push(KeyRange::new(
            removed.end.clone().max(range.begin.clone()),
            range.end.clone(),
        ));
    }
    parts.retain(|p| !p.is_empty());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn r(b: &'static str, e: &'static str) -> KeyRange {
        KeyRange::new(Bytes::from_static(b.as_bytes()), Bytes::from_static(e.as_bytes()))
    }

    #[test]
    fn test_subtract_keeps_both_sides() {
        assert_eq!(subtract(&r("a", "z"), &r("c", "f")), vec![r("a", "c"), r("f", "z")]);
        assert_eq!(subtract(&r("c", "f"), &r("a", "z")), Vec::<KeyRange>::new());
    }

    #[test]
    fn test_split_fetch_partitions_backlog() {
        let mut table = ShardTable::new();
        let fetches = table.assign(&r("a", "m"), false, 5);
        let id = fetches[0];
        table.buffer(id, 6, Mutation::clear_range(&b"b"[..], &b"k"[..]));
        let right = table.split_fetch(id, &Bytes::from_static(b"f")).unwrap();

        let left_backlog = &table.fetch(id).unwrap().backlog;
        let right_backlog = &table.fetch(right).unwrap().backlog;
        assert_eq!(left_backlog, &vec![(6, Mutation::clear_range(&b"b"[..], &b"f"[..]))]);
        assert_eq!(right_backlog, &vec![(6, Mutation::clear_range(&b"f"[..], &b"k"[..]))]);
        table.check_invariants().unwrap();
    }
}

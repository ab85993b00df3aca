//! VersionedStore implementation
//!
//! Keeps one treap root per retained version. The newest root is the only
//! mutable one and belongs to the version the applier is building; every
//! older root is immutable once the applier moves on.

use std::collections::VecDeque;

use parking_lot::RwLock;

use super::tree::{self, Entry, Link};
use super::Lookup;
use crate::error::{AtlasError, Result};
use crate::types::{key_after, printable, Key, KeyRange, KeyValue, RangeResult, Value, Version};

/// Snapshot counters for tests and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub roots: usize,
    pub oldest_version: Version,
    pub latest_version: Version,
    pub entries: usize,
}

/// Multi-version in-memory index
pub struct VersionedStore {
    /// Ascending by version; never empty
    roots: RwLock<VecDeque<(Version, Link)>>,
}

impl VersionedStore {
    /// Create an empty store whose only version is `version`
    pub fn new(version: Version) -> Self {
        let mut roots = VecDeque::new();
        roots.push_back((version, None));
        Self {
            roots: RwLock::new(roots),
        }
    }

    pub fn latest_version(&self) -> Version {
        self.roots.read().back().map_or(0, |(v, _)| *v)
    }

    pub fn oldest_version(&self) -> Version {
        self.roots.read().front().map_or(0, |(v, _)| *v)
    }

    /// Start version `version`; O(1), shares the whole previous tree
    pub fn create_new_version(&self, version: Version) -> Result<()> {
        let mut roots = self.roots.write();
        let (latest, root) = match roots.back() {
            Some((v, root)) => (*v, root.clone()),
            None => (0, None),
        };
        if version <= latest {
            return Err(AtlasError::InvariantViolation(format!(
                "new version {} does not follow latest version {}",
                version, latest
            )));
        }
        roots.push_back((version, root));
        Ok(())
    }

    /// Immutable view of the newest root at or below `version`
    pub fn view(&self, version: Version) -> Option<VersionedView> {
        let roots = self.roots.read();
        let idx = roots.partition_point(|(v, _)| *v <= version);
        if idx == 0 {
            return None;
        }
        let (_, root) = &roots[idx - 1];
        Some(VersionedView {
            root: root.clone(),
            version,
        })
    }

    /// View of the root currently being written
    pub fn latest(&self) -> VersionedView {
        let roots = self.roots.read();
        let (version, root) = roots.back().cloned().unwrap_or((0, None));
        VersionedView { root, version }
    }

    /// Point read at `version`; `None` if that version is no longer retained
    pub fn read(&self, key: &[u8], version: Version) -> Option<Lookup> {
        self.view(version).map(|view| view.get(key))
    }

    /// Memory-only range read at `version`
    pub fn read_range(&self, range: &KeyRange, version: Version, limit: i64) -> Option<RangeResult> {
        self.view(version)
            .map(|view| view.read_range(range, limit, usize::MAX))
    }

    // =========================================================================
    // Writer API (update applier only)
    // =========================================================================

    /// Insert an entry at the latest version, keeping entries non-overlapping
    pub fn insert(&self, key: Key, entry: Entry, version: Version) -> Result<()> {
        match entry {
            Entry::Value(value) => self.set(key, value, version),
            Entry::Clear { end } => self.clear(&KeyRange::new(key, end), version),
        }
    }

    /// Set `key` to `value` at the latest version
    pub fn set(&self, key: Key, value: Value, version: Version) -> Result<()> {
        self.update_latest(version, |root| set_entry(root, key, value, version))
    }

    /// Clear `range` at the latest version, merging with neighboring clears
    pub fn clear(&self, range: &KeyRange, version: Version) -> Result<()> {
        if range.is_empty() {
            return Ok(());
        }
        self.update_latest(version, |root| clear_entries(root, range, version))
    }

    /// Drop entries of `range` from the latest root without recording a clear
    ///
    /// Older roots keep their entries.
    pub fn erase_range(&self, range: &KeyRange) {
        let version = self.latest_version();
        // The latest version always matches, so this cannot fail
        let _ = self.update_latest(version, |root| {
            let mut root = root.clone();
            // A clear starting before the range keeps only its head
            if let Some(prev) = tree::lower(&root, &range.begin) {
                if let Entry::Clear { end } = &prev.entry {
                    if end > &range.begin {
                        let tail_end = end.clone();
                        root = tree::insert(
                            &root,
                            prev.key.clone(),
                            Entry::Clear {
                                end: range.begin.clone(),
                            },
                            prev.version,
                        );
                        if tail_end > range.end {
                            root = tree::insert(
                                &root,
                                range.end.clone(),
                                Entry::Clear { end: tail_end },
                                prev.version,
                            );
                        }
                    }
                }
            }
            // A clear starting inside the range keeps only its tail
            if let Some(last) = tree::lower(&root, &range.end) {
                if last.key >= range.begin {
                    if let Entry::Clear { end } = &last.entry {
                        if end > &range.end {
                            root = tree::insert(
                                &root,
                                range.end.clone(),
                                Entry::Clear { end: end.clone() },
                                last.version,
                            );
                        }
                    }
                }
            }
            tree::erase_range(&root, &range.begin, &range.end)
        });
    }

    /// Remove latest-root entries touched by `keys` whose version <= `floor`
    ///
    /// `keys` are the begin keys of mutations the durability loop has made
    /// durable; the durable store now answers for them.
    pub fn reclaim(&self, keys: &[Key], floor: Version) -> usize {
        if keys.is_empty() {
            return 0;
        }
        let version = self.latest_version();
        let mut removed = 0;
        let _ = self.update_latest(version, |root| {
            let mut root = root.clone();
            for key in keys {
                let mut candidates = Vec::with_capacity(3);
                if let Some(node) = tree::floor(&root, key) {
                    if node.key == *key || node.span_end().as_ref() > key.as_ref() {
                        candidates.push(node);
                    }
                }
                if let Some(node) = tree::lower(&root, key) {
                    if matches!(&node.entry, Entry::Clear { end } if end.as_ref() >= key.as_ref()) {
                        candidates.push(node);
                    }
                }
                if let Some(node) = tree::get(&root, &key_after(key)) {
                    if matches!(node.entry, Entry::Clear { .. }) {
                        candidates.push(node);
                    }
                }
                for node in candidates {
                    if node.version <= floor && tree::get(&root, &node.key).is_some() {
                        root = tree::remove(&root, &node.key);
                        removed += 1;
                    }
                }
            }
            root
        });
        removed
    }

    /// Forget every version below `floor` except the newest one at or below it
    ///
    /// Views already handed out keep their roots; the store only releases
    /// its own references. Returns the number of roots released.
    pub fn forget_versions_before(&self, floor: Version) -> usize {
        let mut roots = self.roots.write();
        let mut released = 0;
        while roots.len() > 1 && roots[1].0 <= floor {
            roots.pop_front();
            released += 1;
        }
        released
    }

    /// Discard everything and restart empty at `version`
    pub fn reset(&self, version: Version) {
        let mut roots = self.roots.write();
        roots.clear();
        roots.push_back((version, None));
    }

    pub fn stats(&self) -> StoreStats {
        let roots = self.roots.read();
        StoreStats {
            roots: roots.len(),
            oldest_version: roots.front().map_or(0, |(v, _)| *v),
            latest_version: roots.back().map_or(0, |(v, _)| *v),
            entries: roots.back().map_or(0, |(_, r)| tree::len(r)),
        }
    }

    /// Verify the latest root holds ordered, non-overlapping, merged entries
    pub fn check_invariants(&self) -> Result<()> {
        let view = self.latest();
        let mut prev: Option<(Key, Key, bool)> = None;
        for node in tree::Forward::new(&view.root, b"") {
            let is_clear = matches!(node.entry, Entry::Clear { .. });
            let span_end = node.span_end();
            if span_end <= node.key {
                return Err(AtlasError::InvariantViolation(format!(
                    "empty clear at {}",
                    printable(&node.key)
                )));
            }
            if let Some((prev_key, prev_end, prev_clear)) = &prev {
                if prev_end > &node.key {
                    return Err(AtlasError::InvariantViolation(format!(
                        "entry at {} overlaps entry at {}",
                        printable(&node.key),
                        printable(prev_key)
                    )));
                }
                if *prev_clear && is_clear && prev_end == &node.key {
                    return Err(AtlasError::InvariantViolation(format!(
                        "adjacent clears at {} and {} were not merged",
                        printable(prev_key),
                        printable(&node.key)
                    )));
                }
            }
            prev = Some((node.key.clone(), span_end, is_clear));
        }
        Ok(())
    }

    fn update_latest(&self, version: Version, f: impl FnOnce(&Link) -> Link) -> Result<()> {
        let root = {
            let roots = self.roots.read();
            match roots.back() {
                Some((latest, root)) if *latest == version => root.clone(),
                Some((latest, _)) => {
                    return Err(AtlasError::InvariantViolation(format!(
                        "write at version {} but latest version is {}",
                        version, latest
                    )))
                }
                None => None,
            }
        };
        let updated = f(&root);
        let mut roots = self.roots.write();
        if let Some(back) = roots.back_mut() {
            back.1 = updated;
        }
        Ok(())
    }
}

// =============================================================================
// Entry Maintenance
// =============================================================================

fn set_entry(root: &Link, key: Key, value: Value, version: Version) -> Link {
    let mut root = root.clone();
    if let Some(prev) = tree::floor(&root, &key) {
        if let Entry::Clear { end } = &prev.entry {
            if end.as_ref() > key.as_ref() {
                // Split the covering clear around the key
                let clear_end = end.clone();
                if prev.key < key {
                    root = tree::insert(
                        &root,
                        prev.key.clone(),
                        Entry::Clear { end: key.clone() },
                        prev.version,
                    );
                }
                let tail = key_after(&key);
                if tail < clear_end {
                    root = tree::insert(&root, tail, Entry::Clear { end: clear_end }, version);
                }
            }
        }
    }
    tree::insert(&root, key, Entry::Value(value), version)
}

fn clear_entries(root: &Link, range: &KeyRange, version: Version) -> Link {
    let mut begin = range.begin.clone();
    let mut end = range.end.clone();

    // Merge with a clear that covers or adjoins the begin key
    if let Some(prev) = tree::floor(root, &begin) {
        if let Entry::Clear { end: prev_end } = &prev.entry {
            if prev_end >= &begin {
                begin = prev.key.clone();
                end = end.max(prev_end.clone());
            }
        }
    }
    // A clear starting inside the range may extend past its end
    if let Some(last) = tree::lower(root, &end) {
        if last.key >= begin {
            if let Entry::Clear { end: last_end } = &last.entry {
                end = end.max(last_end.clone());
            }
        }
    }
    // Merge with a clear starting exactly at the end
    if let Some(next) = tree::get(root, &end) {
        if let Entry::Clear { end: next_end } = &next.entry {
            end = next_end.clone();
        }
    }

    let root = tree::erase_range(root, &begin, &end);
    tree::insert(&root, begin, Entry::Clear { end }, version)
}

// =============================================================================
// Versioned View
// =============================================================================

/// An in-memory entry clipped to a queried range
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemEntry {
    Set(KeyValue),
    Clear(KeyRange),
}

/// Immutable snapshot of the store at one version
#[derive(Clone)]
pub struct VersionedView {
    root: Link,
    version: Version,
}

impl VersionedView {
    /// Version this view answers for
    pub fn version(&self) -> Version {
        self.version
    }

    /// Number of entries visible in this view
    pub fn len(&self) -> usize {
        tree::len(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn get(&self, key: &[u8]) -> Lookup {
        match tree::floor(&self.root, key) {
            Some(node) if node.key.as_ref() == key => match &node.entry {
                Entry::Value(value) => Lookup::Value(value.clone()),
                Entry::Clear { .. } => Lookup::Cleared,
            },
            Some(node) => match &node.entry {
                Entry::Clear { end } if end.as_ref() > key => Lookup::Cleared,
                _ => Lookup::Missing,
            },
            None => Lookup::Missing,
        }
    }

    /// First entry starting at or after `key`
    pub fn next_entry_key(&self, key: &[u8]) -> Option<Key> {
        tree::ceiling(&self.root, key).map(|node| node.key.clone())
    }

    /// Entries overlapping `range` in key order (descending when `reverse`)
    pub fn range(&self, range: &KeyRange, reverse: bool) -> ViewRange<'_> {
        if reverse {
            ViewRange {
                dir: Direction::Backward(tree::Backward::new(&self.root, &range.end)),
                range: range.clone(),
                pending: None,
                done: range.is_empty(),
            }
        } else {
            let pending = tree::lower(&self.root, &range.begin).and_then(|prev| match &prev.entry {
                Entry::Clear { end } if end > &range.begin => Some(MemEntry::Clear(KeyRange::new(
                    range.begin.clone(),
                    end.clone().min(range.end.clone()),
                ))),
                _ => None,
            });
            ViewRange {
                dir: Direction::Forward(tree::Forward::new(&self.root, &range.begin)),
                range: range.clone(),
                pending,
                done: range.is_empty(),
            }
        }
    }

    /// Values visible in memory only; a negative `limit` reads backward
    pub fn read_range(&self, range: &KeyRange, limit: i64, byte_limit: usize) -> RangeResult {
        let reverse = limit < 0;
        let max_rows = limit.unsigned_abs() as usize;
        let mut result = RangeResult::default();
        let mut bytes = 0;
        for entry in self.range(range, reverse) {
            if let MemEntry::Set(kv) = entry {
                if result.rows.len() >= max_rows || bytes >= byte_limit {
                    result.more = true;
                    break;
                }
                bytes += kv.size();
                result.rows.push(kv);
            }
        }
        result
    }
}

enum Direction<'a> {
    Forward(tree::Forward<'a>),
    Backward(tree::Backward<'a>),
}

/// Iterator over a view's entries clipped to a range
pub struct ViewRange<'a> {
    dir: Direction<'a>,
    range: KeyRange,
    pending: Option<MemEntry>,
    done: bool,
}

impl<'a> ViewRange<'a> {
    fn clip(&self, key: &Key, entry: &Entry) -> MemEntry {
        match entry {
            Entry::Value(value) => MemEntry::Set(KeyValue {
                key: key.clone(),
                value: value.clone(),
            }),
            Entry::Clear { end } => MemEntry::Clear(KeyRange::new(
                key.clone().max(self.range.begin.clone()),
                end.clone().min(self.range.end.clone()),
            )),
        }
    }
}

impl<'a> Iterator for ViewRange<'a> {
    type Item = MemEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(entry) = self.pending.take() {
            return Some(entry);
        }
        if self.done {
            return None;
        }
        let (node, reverse) = match &mut self.dir {
            Direction::Forward(iter) => (iter.next(), false),
            Direction::Backward(iter) => (iter.next(), true),
        };
        let node = match node {
            Some(node) => node,
            None => {
                self.done = true;
                return None;
            }
        };
        if !reverse {
            if node.key < self.range.end {
                return Some(self.clip(&node.key, &node.entry));
            }
            self.done = true;
            return None;
        }
        if node.key >= self.range.begin {
            return Some(self.clip(&node.key, &node.entry));
        }
        // First entry below the range; only a straddling clear is visible
        self.done = true;
        match &node.entry {
            Entry::Clear { end } if end > &self.range.begin => Some(self.clip(&node.key, &node.entry)),
            _ => None,
        }
    }
}

//! Persistent treap
//!
//! Copy-on-write binary search tree ordered by key and heap-ordered by a
//! priority derived from the key's CRC32. Every update copies only the path
//! it touches and shares the rest, so a root captured earlier keeps seeing
//! exactly the tree it was captured with.

use std::sync::Arc;

use crate::types::{key_after, Key, Value, Version};

/// Root or child pointer
pub(crate) type Link = Option<Arc<Node>>;

/// What an in-memory entry says about its key(s)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// The key holds this value
    Value(Value),
    /// Every key in `[node key, end)` is cleared
    Clear { end: Key },
}

pub(crate) struct Node {
    pub(crate) key: Key,
    pub(crate) entry: Entry,
    /// Version at which this entry was inserted
    pub(crate) version: Version,
    priority: u32,
    size: usize,
    left: Link,
    right: Link,
}

impl Node {
    fn new(key: Key, entry: Entry, version: Version, left: Link, right: Link) -> Arc<Node> {
        let priority = crc32fast::hash(&key);
        Self::build(key, entry, version, priority, left, right)
    }

    fn build(key: Key, entry: Entry, version: Version, priority: u32, left: Link, right: Link) -> Arc<Node> {
        let size = 1 + len(&left) + len(&right);
        Arc::new(Node {
            key,
            entry,
            version,
            priority,
            size,
            left,
            right,
        })
    }

    /// Copy of this node with new children
    fn with_children(&self, left: Link, right: Link) -> Arc<Node> {
        Self::build(
            self.key.clone(),
            self.entry.clone(),
            self.version,
            self.priority,
            left,
            right,
        )
    }

    /// End (exclusive) of the key span this entry covers
    pub(crate) fn span_end(&self) -> Key {
        match &self.entry {
            Entry::Value(_) => key_after(&self.key),
            Entry::Clear { end } => end.clone(),
        }
    }
}

/// Number of entries under `link`
pub(crate) fn len(link: &Link) -> usize {
    link.as_ref().map_or(0, |n| n.size)
}

// =============================================================================
// Structural Operations (path copying)
// =============================================================================

/// Split into (keys < `key`, keys >= `key`)
pub(crate) fn split(link: &Link, key: &[u8]) -> (Link, Link) {
    match link {
        None => (None, None),
        Some(node) => {
            if node.key.as_ref() < key {
                let (l, r) = split(&node.right, key);
                (Some(node.with_children(node.left.clone(), l)), r)
            } else {
                let (l, r) = split(&node.left, key);
                (l, Some(node.with_children(r, node.right.clone())))
            }
        }
    }
}

/// Join two trees where every key of `left` is below every key of `right`
pub(crate) fn merge(left: Link, right: Link) -> Link {
    match (left, right) {
        (None, r) => r,
        (l, None) => l,
        (Some(l), Some(r)) => {
            if l.priority >= r.priority {
                let right_child = merge(l.right.clone(), Some(r));
                Some(l.with_children(l.left.clone(), right_child))
            } else {
                let left_child = merge(Some(l), r.left.clone());
                Some(r.with_children(left_child, r.right.clone()))
            }
        }
    }
}

/// Insert or replace the entry at `key`
pub(crate) fn insert(link: &Link, key: Key, entry: Entry, version: Version) -> Link {
    let (less, rest) = split(link, &key);
    let (_, greater) = split(&rest, &key_after(&key));
    let leaf = Node::new(key, entry, version, None, None);
    merge(merge(less, Some(leaf)), greater)
}

/// Remove the entry at exactly `key`, if any
pub(crate) fn remove(link: &Link, key: &[u8]) -> Link {
    let (less, rest) = split(link, key);
    let (_, greater) = split(&rest, &key_after(key));
    merge(less, greater)
}

/// Remove every entry whose key lies in `[begin, end)`
pub(crate) fn erase_range(link: &Link, begin: &[u8], end: &[u8]) -> Link {
    if begin >= end {
        return link.clone();
    }
    let (less, rest) = split(link, begin);
    let (_, greater) = split(&rest, end);
    merge(less, greater)
}

// =============================================================================
// Lookups
// =============================================================================

/// Entry at exactly `key`
pub(crate) fn get(link: &Link, key: &[u8]) -> Option<Arc<Node>> {
    let mut cur = link;
    while let Some(node) = cur {
        match key.cmp(node.key.as_ref()) {
            std::cmp::Ordering::Less => cur = &node.left,
            std::cmp::Ordering::Greater => cur = &node.right,
            std::cmp::Ordering::Equal => return Some(node.clone()),
        }
    }
    None
}

/// Greatest entry with key <= `key`
pub(crate) fn floor(link: &Link, key: &[u8]) -> Option<Arc<Node>> {
    let mut cur = link;
    let mut best = None;
    while let Some(node) = cur {
        if node.key.as_ref() <= key {
            best = Some(node.clone());
            cur = &node.right;
        } else {
            cur = &node.left;
        }
    }
    best
}

/// Greatest entry with key < `key`
pub(crate) fn lower(link: &Link, key: &[u8]) -> Option<Arc<Node>> {
    let mut cur = link;
    let mut best = None;
    while let Some(node) = cur {
        if node.key.as_ref() < key {
            best = Some(node.clone());
            cur = &node.right;
        } else {
            cur = &node.left;
        }
    }
    best
}

/// Least entry with key >= `key`
pub(crate) fn ceiling(link: &Link, key: &[u8]) -> Option<Arc<Node>> {
    let mut cur = link;
    let mut best = None;
    while let Some(node) = cur {
        if node.key.as_ref() >= key {
            best = Some(node.clone());
            cur = &node.left;
        } else {
            cur = &node.right;
        }
    }
    best
}

// =============================================================================
// Iteration
// =============================================================================

/// In-order iterator starting at the first key >= `start`
pub(crate) struct Forward<'a> {
    stack: Vec<&'a Arc<Node>>,
}

impl<'a> Forward<'a> {
    pub(crate) fn new(link: &'a Link, start: &[u8]) -> Self {
        let mut stack = Vec::new();
        let mut cur = link;
        while let Some(node) = cur {
            if node.key.as_ref() >= start {
                stack.push(node);
                cur = &node.left;
            } else {
                cur = &node.right;
            }
        }
        Self { stack }
    }
}

impl<'a> Iterator for Forward<'a> {
    type Item = &'a Arc<Node>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        let mut cur = &node.right;
        while let Some(child) = cur {
            self.stack.push(child);
            cur = &child.left;
        }
        Some(node)
    }
}

/// Reverse in-order iterator starting at the last key < `end`
pub(crate) struct Backward<'a> {
    stack: Vec<&'a Arc<Node>>,
}

impl<'a> Backward<'a> {
    pub(crate) fn new(link: &'a Link, end: &[u8]) -> Self {
        let mut stack = Vec::new();
        let mut cur = link;
        while let Some(node) = cur {
            if node.key.as_ref() < end {
                stack.push(node);
                cur = &node.right;
            } else {
                cur = &node.left;
            }
        }
        Self { stack }
    }
}

impl<'a> Iterator for Backward<'a> {
    type Item = &'a Arc<Node>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        let mut cur = &node.left;
        while let Some(child) = cur {
            self.stack.push(child);
            cur = &child.right;
        }
        Some(node)
    }
}

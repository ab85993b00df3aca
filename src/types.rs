//! Core value types shared by every component.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Logical commit clock assigned by the log system
pub type Version = u64;

/// Keys and values are cheaply cloneable byte strings
pub type Key = Bytes;
pub type Value = Bytes;

/// Exclusive end of the user keyspace
pub const KEYSPACE_END: &[u8] = b"\xff";

/// Largest value an `AppendIfFits` may produce
pub const VALUE_SIZE_LIMIT: usize = 100_000;

/// Smallest key strictly greater than `key`
pub fn key_after(key: &[u8]) -> Key {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    Bytes::from(next)
}

/// Smallest key greater than every key with the given prefix
pub fn prefix_end(prefix: &[u8]) -> Key {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last != 0xff {
            end.push(last + 1);
            return Bytes::from(end);
        }
    }
    Bytes::from_static(b"\xff\xff\xff")
}

/// Half-open key range `[begin, end)`
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub begin: Key,
    pub end: Key,
}

impl KeyRange {
    pub fn new(begin: impl Into<Key>, end: impl Into<Key>) -> Self {
        Self {
            begin: begin.into(),
            end: end.into(),
        }
    }

    /// The whole user keyspace `["", "\xff")`
    pub fn all() -> Self {
        Self::new(Bytes::new(), Bytes::from_static(KEYSPACE_END))
    }

    /// Range holding exactly one key
    pub fn single(key: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(key), key_after(key))
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.begin.as_ref() && key < self.end.as_ref()
    }

    pub fn contains_range(&self, other: &KeyRange) -> bool {
        other.begin >= self.begin && other.end <= self.end
    }

    pub fn intersects(&self, other: &KeyRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    /// Intersection, `None` when disjoint
    pub fn clip(&self, other: &KeyRange) -> Option<KeyRange> {
        let begin = self.begin.clone().max(other.begin.clone());
        let end = self.end.clone().min(other.end.clone());
        if begin < end {
            Some(KeyRange { begin, end })
        } else {
            None
        }
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", printable(&self.begin), printable(&self.end))
    }
}

/// Escape non-printable bytes the way log lines show keys
pub fn printable(key: &[u8]) -> String {
    let mut out = String::with_capacity(key.len());
    for &b in key {
        if b.is_ascii_graphic() || b == b' ' {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\x{:02x}", b));
        }
    }
    out
}

/// A key with its value as of some version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Key,
    pub value: Value,
}

impl KeyValue {
    pub fn new(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Bytes this row counts against a byte limit
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// Rows returned by a range read plus whether the range was exhausted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeResult {
    pub rows: Vec<KeyValue>,
    /// More rows may exist past the last returned row
    pub more: bool,
}

impl RangeResult {
    pub fn keys(&self) -> Vec<&[u8]> {
        self.rows.iter().map(|kv| kv.key.as_ref()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_end_skips_trailing_ff() {
        assert_eq!(prefix_end(b"ab"), Bytes::from_static(b"ac"));
        assert_eq!(prefix_end(b"a\xff"), Bytes::from_static(b"b"));
    }

    #[test]
    fn test_clip_disjoint_is_none() {
        let a = KeyRange::new(&b"a"[..], &b"c"[..]);
        let b = KeyRange::new(&b"c"[..], &b"e"[..]);
        assert!(a.clip(&b).is_none());
        assert_eq!(
            a.clip(&KeyRange::new(&b"b"[..], &b"z"[..])),
            Some(KeyRange::new(&b"b"[..], &b"c"[..]))
        );
    }
}

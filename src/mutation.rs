//! Mutations carried by the log system.
//!
//! Data mutations touch user keys (`< "\xff"`). Control mutations ride the
//! same stream under [`PRIVATE_PREFIX`] and are decoded into
//! [`ControlMutation`] by the update applier.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{AtlasError, Result};
use crate::types::{key_after, printable, Key, KeyRange, Value, Version, KEYSPACE_END, VALUE_SIZE_LIMIT};

/// Prefix of control mutations in the mutation stream
pub const PRIVATE_PREFIX: &[u8] = b"\xff/private/";

const ASSIGN_PREFIX: &[u8] = b"\xff/private/assign/";
const EPOCH_END_KEY: &[u8] = b"\xff/private/epochEnd";
const CONF_PREFIX: &[u8] = b"\xff/private/conf/";

/// Read-modify-write operations expanded into sets/clears before storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtomicOp {
    Add,
    And,
    Or,
    Xor,
    Max,
    Min,
    ByteMax,
    ByteMin,
    AppendIfFits,
    CompareAndClear,
}

/// A single mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    Set { key: Key, value: Value },
    ClearRange { begin: Key, end: Key },
    Atomic { op: AtomicOp, key: Key, param: Value },
}

impl Mutation {
    pub fn set(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        Mutation::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn clear_range(begin: impl Into<Key>, end: impl Into<Key>) -> Self {
        Mutation::ClearRange {
            begin: begin.into(),
            end: end.into(),
        }
    }

    /// Clear exactly one key
    pub fn clear(key: impl Into<Key>) -> Self {
        let key = key.into();
        let end = key_after(&key);
        Mutation::ClearRange { begin: key, end }
    }

    pub fn atomic(op: AtomicOp, key: impl Into<Key>, param: impl Into<Value>) -> Self {
        Mutation::Atomic {
            op,
            key: key.into(),
            param: param.into(),
        }
    }

    // -------------------------------------------------------------------------
    // Control plane constructors
    // -------------------------------------------------------------------------

    /// Assign `range` to this node; `known_empty` skips the fetch
    pub fn assign_range(range: &KeyRange, known_empty: bool) -> Self {
        Self::assignment(range, true, known_empty)
    }

    /// Remove `range` from this node
    pub fn unassign_range(range: &KeyRange) -> Self {
        Self::assignment(range, false, false)
    }

    fn assignment(range: &KeyRange, assigned: bool, known_empty: bool) -> Self {
        let payload = AssignPayload {
            end: range.end.to_vec(),
            assigned,
            known_empty,
        };
        // Encoding a plain struct into a Vec cannot fail
        let value = bincode::serialize(&payload).unwrap_or_default();
        let mut key = ASSIGN_PREFIX.to_vec();
        key.extend_from_slice(&range.begin);
        Mutation::set(Bytes::from(key), Bytes::from(value))
    }

    /// Roll in-memory state back to `target`
    pub fn epoch_end(target: Version) -> Self {
        Mutation::set(
            Bytes::from_static(EPOCH_END_KEY),
            Bytes::copy_from_slice(&target.to_be_bytes()),
        )
    }

    /// Set a cluster configuration value
    pub fn set_config(name: &str, value: impl Into<Value>) -> Self {
        let mut key = CONF_PREFIX.to_vec();
        key.extend_from_slice(name.as_bytes());
        Mutation::set(Bytes::from(key), value.into())
    }

    /// Whether this mutation belongs to the private control namespace
    pub fn is_private(&self) -> bool {
        match self {
            Mutation::Set { key, .. } | Mutation::Atomic { key, .. } => key.starts_with(PRIVATE_PREFIX),
            Mutation::ClearRange { begin, .. } => begin.starts_with(PRIVATE_PREFIX),
        }
    }

    /// Approximate memory/disk footprint
    pub fn size(&self) -> usize {
        match self {
            Mutation::Set { key, value } => key.len() + value.len(),
            Mutation::ClearRange { begin, end } => begin.len() + end.len(),
            Mutation::Atomic { key, param, .. } => key.len() + param.len(),
        }
    }

    /// First key the mutation touches
    pub fn begin_key(&self) -> &Key {
        match self {
            Mutation::Set { key, .. } | Mutation::Atomic { key, .. } => key,
            Mutation::ClearRange { begin, .. } => begin,
        }
    }

    /// Restrict the mutation to `range`; `None` if it falls outside
    pub fn clipped_to(&self, range: &KeyRange) -> Option<Mutation> {
        match self {
            Mutation::Set { key, .. } | Mutation::Atomic { key, .. } => {
                range.contains(key).then(|| self.clone())
            }
            Mutation::ClearRange { begin, end } => KeyRange::new(begin.clone(), end.clone())
                .clip(range)
                .map(|r| Mutation::ClearRange {
                    begin: r.begin,
                    end: r.end,
                }),
        }
    }

    /// Reject data mutations outside the user keyspace
    pub fn validate_data(&self) -> Result<()> {
        let out_of_range = match self {
            Mutation::Set { key, .. } | Mutation::Atomic { key, .. } => key.as_ref() >= KEYSPACE_END,
            Mutation::ClearRange { begin, end } => begin.as_ref() >= KEYSPACE_END || begin > end,
        };
        if out_of_range {
            return Err(AtlasError::UnexpectedMutation(format!(
                "data mutation outside user keyspace at {}",
                printable(self.begin_key())
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Control Mutations
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct AssignPayload {
    end: Vec<u8>,
    assigned: bool,
    known_empty: bool,
}

/// Decoded private mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMutation {
    Assign {
        range: KeyRange,
        assigned: bool,
        known_empty: bool,
    },
    EpochEnd {
        target: Version,
    },
    SetConfig {
        name: String,
        value: Option<Value>,
    },
}

impl ControlMutation {
    /// Decode a private mutation; anything unrecognized is fatal
    pub fn decode(mutation: &Mutation) -> Result<ControlMutation> {
        match mutation {
            Mutation::Set { key, value } => {
                if let Some(begin) = key.strip_prefix(ASSIGN_PREFIX) {
                    let payload: AssignPayload = bincode::deserialize(value).map_err(|e| {
                        AtlasError::UnexpectedMutation(format!("malformed assignment: {}", e))
                    })?;
                    let range = KeyRange::new(Bytes::copy_from_slice(begin), Bytes::from(payload.end));
                    if range.is_empty() || range.end.as_ref() > KEYSPACE_END {
                        return Err(AtlasError::UnexpectedMutation(format!(
                            "assignment of invalid range {:?}",
                            range
                        )));
                    }
                    return Ok(ControlMutation::Assign {
                        range,
                        assigned: payload.assigned,
                        known_empty: payload.known_empty,
                    });
                }
                if key.as_ref() == EPOCH_END_KEY {
                    let bytes: [u8; 8] = value.as_ref().try_into().map_err(|_| {
                        AtlasError::UnexpectedMutation("epoch end without 8-byte version".to_string())
                    })?;
                    return Ok(ControlMutation::EpochEnd {
                        target: Version::from_be_bytes(bytes),
                    });
                }
                if let Some(name) = key.strip_prefix(CONF_PREFIX) {
                    return Ok(ControlMutation::SetConfig {
                        name: String::from_utf8_lossy(name).into_owned(),
                        value: Some(value.clone()),
                    });
                }
            }
            Mutation::ClearRange { begin, .. } => {
                if let Some(name) = begin.strip_prefix(CONF_PREFIX) {
                    return Ok(ControlMutation::SetConfig {
                        name: String::from_utf8_lossy(name).into_owned(),
                        value: None,
                    });
                }
            }
            Mutation::Atomic { .. } => {}
        }
        Err(AtlasError::UnexpectedMutation(format!(
            "unknown private mutation at {}",
            printable(mutation.begin_key())
        )))
    }
}

// =============================================================================
// Atomic Operation Expansion
// =============================================================================

/// Outcome of applying an atomic op to the prior value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expanded {
    Set(Value),
    Clear,
    Unchanged,
}

/// Compute the result of `op(prior, param)`
pub fn apply_atomic(op: AtomicOp, prior: Option<&[u8]>, param: &[u8]) -> Expanded {
    let prior = match (op, prior) {
        (AtomicOp::CompareAndClear, None) => return Expanded::Unchanged,
        (_, None) => return Expanded::Set(Bytes::copy_from_slice(param)),
        (_, Some(prior)) => prior,
    };

    let result: Vec<u8> = match op {
        AtomicOp::Add => {
            let mut out = Vec::with_capacity(param.len());
            let mut carry = 0u16;
            for (i, &p) in param.iter().enumerate() {
                let sum = p as u16 + prior.get(i).copied().unwrap_or(0) as u16 + carry;
                out.push(sum as u8);
                carry = sum >> 8;
            }
            out
        }
        AtomicOp::And => bytewise(prior, param, |a, b| a & b),
        AtomicOp::Or => bytewise(prior, param, |a, b| a | b),
        AtomicOp::Xor => bytewise(prior, param, |a, b| a ^ b),
        AtomicOp::Max | AtomicOp::Min => {
            let prior_fixed = resize(prior, param.len());
            let prior_greater = compare_le(&prior_fixed, param) == std::cmp::Ordering::Greater;
            let take_prior = (op == AtomicOp::Max) == prior_greater;
            if take_prior {
                prior_fixed
            } else {
                param.to_vec()
            }
        }
        AtomicOp::ByteMax => prior.max(param).to_vec(),
        AtomicOp::ByteMin => prior.min(param).to_vec(),
        AtomicOp::AppendIfFits => {
            if prior.len() + param.len() > VALUE_SIZE_LIMIT {
                return Expanded::Unchanged;
            }
            let mut out = prior.to_vec();
            out.extend_from_slice(param);
            out
        }
        AtomicOp::CompareAndClear => {
            return if prior == param {
                Expanded::Clear
            } else {
                Expanded::Unchanged
            };
        }
    };
    Expanded::Set(Bytes::from(result))
}

fn resize(bytes: &[u8], len: usize) -> Vec<u8> {
    let mut out = bytes[..bytes.len().min(len)].to_vec();
    out.resize(len, 0);
    out
}

fn bytewise(prior: &[u8], param: &[u8], f: impl Fn(u8, u8) -> u8) -> Vec<u8> {
    param
        .iter()
        .enumerate()
        .map(|(i, &p)| f(prior.get(i).copied().unwrap_or(0), p))
        .collect()
}

/// Compare equal-length little-endian unsigned integers
fn compare_le(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    a.iter().rev().cmp(b.iter().rev())
}

//! Persisted metadata layout and restore
//!
//! Everything the engine keeps about itself lives under `"\xff\xff/"` in the
//! durable store, outside the user keyspace:
//!
//! ```text
//! \xff\xff/Format                   storage format identifier
//! \xff\xff/ID                       node id (8 bytes, big-endian)
//! \xff\xff/Version                  durable version (8 bytes, big-endian)
//! \xff\xff/LogProtocol              log protocol identifier
//! \xff\xff/ShardAssigned/<key>      boolean range map boundaries ("0"/"1")
//! \xff\xff/ShardAvailable/<key>     boolean range map boundaries ("0"/"1")
//! ```
//! A range map boundary at `k` gives the value for `[k, next boundary)`;
//! keys before the first boundary read as false.

use bytes::Bytes;
use tracing::info;

use crate::error::{AtlasError, Result};
use crate::mutation::Mutation;
use crate::shard::{ShardState, ShardTable};
use crate::storage::DurableStore;
use crate::types::{key_after, prefix_end, Key, KeyRange, Version, KEYSPACE_END};

pub const METADATA_PREFIX: &[u8] = b"\xff\xff/";
pub const FORMAT_KEY: &[u8] = b"\xff\xff/Format";
pub const ID_KEY: &[u8] = b"\xff\xff/ID";
pub const VERSION_KEY: &[u8] = b"\xff\xff/Version";
pub const LOG_PROTOCOL_KEY: &[u8] = b"\xff\xff/LogProtocol";
pub const ASSIGNED_PREFIX: &[u8] = b"\xff\xff/ShardAssigned/";
pub const AVAILABLE_PREFIX: &[u8] = b"\xff\xff/ShardAvailable/";

pub const FORMAT_VALUE: &[u8] = b"AtlasNode/StorageFormat/1";
pub const LOG_PROTOCOL_VALUE: &[u8] = b"AtlasNode/LogProtocol/1";

/// State rebuilt from the durable store at startup or rollback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredState {
    pub version: Version,
    /// `(range, assigned, available)` runs tiling the user keyspace
    pub shards: Vec<(KeyRange, bool, bool)>,
}

pub fn encode_version(version: Version) -> Bytes {
    Bytes::copy_from_slice(&version.to_be_bytes())
}

pub fn decode_version(bytes: &[u8]) -> Result<Version> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| AtlasError::FormatMismatch(format!("version field of {} bytes", bytes.len())))?;
    Ok(Version::from_be_bytes(raw))
}

/// Read persisted state, initializing a fresh store
pub fn restore(store: &dyn DurableStore, node_id: u64) -> Result<RestoredState> {
    let format = store.get(FORMAT_KEY)?;
    let Some(format) = format else {
        store.set(Bytes::from_static(FORMAT_KEY), Bytes::from_static(FORMAT_VALUE))?;
        store.set(Bytes::from_static(ID_KEY), encode_version(node_id))?;
        store.set(Bytes::from_static(VERSION_KEY), encode_version(0))?;
        store.set(
            Bytes::from_static(LOG_PROTOCOL_KEY),
            Bytes::from_static(LOG_PROTOCOL_VALUE),
        )?;
        store.commit()?;
        info!(node_id, "initialized fresh durable store");
        return Ok(RestoredState {
            version: 0,
            shards: vec![(KeyRange::all(), false, false)],
        });
    };

    if format.as_ref() != FORMAT_VALUE {
        return Err(AtlasError::FormatMismatch(format!(
            "unknown storage format {:?}",
            String::from_utf8_lossy(&format)
        )));
    }
    match store.get(LOG_PROTOCOL_KEY)? {
        Some(protocol) if protocol.as_ref() == LOG_PROTOCOL_VALUE => {}
        other => {
            return Err(AtlasError::FormatMismatch(format!(
                "unsupported log protocol {:?}",
                other.map(|p| String::from_utf8_lossy(&p).into_owned())
            )))
        }
    }
    let stored_id = match store.get(ID_KEY)? {
        Some(id) => decode_version(&id)?,
        None => return Err(AtlasError::FormatMismatch("missing node id".to_string())),
    };
    if stored_id != node_id {
        return Err(AtlasError::FormatMismatch(format!(
            "store belongs to node {} but this is node {}",
            stored_id, node_id
        )));
    }
    let version = match store.get(VERSION_KEY)? {
        Some(v) => decode_version(&v)?,
        None => return Err(AtlasError::FormatMismatch("missing durable version".to_string())),
    };

    let shards = read_shard_runs(store)?;
    info!(node_id, version, runs = shards.len(), "restored persisted state");
    Ok(RestoredState { version, shards })
}

/// Merge both range maps into runs over the user keyspace
pub fn read_shard_runs(store: &dyn DurableStore) -> Result<Vec<(KeyRange, bool, bool)>> {
    let assigned = read_range_map(store, ASSIGNED_PREFIX)?;
    let available = read_range_map(store, AVAILABLE_PREFIX)?;

    let mut cuts: Vec<Key> = assigned
        .iter()
        .chain(available.iter())
        .map(|(k, _)| k.clone())
        .filter(|k| !k.is_empty() && k.as_ref() < KEYSPACE_END)
        .collect();
    cuts.push(Key::new());
    cuts.sort();
    cuts.dedup();

    let mut runs: Vec<(KeyRange, bool, bool)> = Vec::new();
    for (i, begin) in cuts.iter().enumerate() {
        let end = cuts
            .get(i + 1)
            .cloned()
            .unwrap_or_else(|| Key::from_static(KEYSPACE_END));
        let a = map_value_at(&assigned, begin);
        let v = map_value_at(&available, begin);
        match runs.last_mut() {
            Some(last) if last.1 == a && last.2 == v => last.0.end = end,
            _ => runs.push((KeyRange::new(begin.clone(), end), a, v)),
        }
    }
    Ok(runs)
}

fn read_range_map(store: &dyn DurableStore, prefix: &[u8]) -> Result<Vec<(Key, bool)>> {
    let range = KeyRange::new(Bytes::copy_from_slice(prefix), prefix_end(prefix));
    let mut boundaries = Vec::new();
    let mut cursor = range.clone();
    loop {
        let page = store.read_range(&cursor, 1000, usize::MAX)?;
        for row in &page.rows {
            let key = Bytes::copy_from_slice(&row.key[prefix.len()..]);
            boundaries.push((key, row.value.as_ref() == b"1"));
        }
        match (page.more, page.rows.last()) {
            (true, Some(last)) => cursor.begin = key_after(&last.key),
            _ => break,
        }
    }
    Ok(boundaries)
}

fn map_value_at(map: &[(Key, bool)], key: &Key) -> bool {
    map.iter()
        .take_while(|(k, _)| k <= key)
        .last()
        .map_or(false, |(_, v)| *v)
}

// =============================================================================
// Writing Shard Markers
// =============================================================================

/// Mutations rewriting both shard range maps over `range` from `table`
///
/// The table must already hold the new states. Boundaries equal to their
/// left neighbor are omitted so the maps stay coalesced.
pub fn shard_marker_mutations(table: &ShardTable, range: &KeyRange) -> Vec<Mutation> {
    let mut out = Vec::new();
    range_map_mutations(table, range, ASSIGNED_PREFIX, ShardState::is_assigned, &mut out);
    range_map_mutations(table, range, AVAILABLE_PREFIX, ShardState::is_available, &mut out);
    out
}

fn range_map_mutations(
    table: &ShardTable,
    range: &KeyRange,
    prefix: &[u8],
    value_of: fn(&ShardState) -> bool,
    out: &mut Vec<Mutation>,
) {
    let value_at = |key: &[u8]| -> bool {
        table
            .descriptor_at(key)
            .map_or(false, |d| value_of(&d.state))
    };
    let prefixed = |key: &[u8]| -> Key {
        let mut k = prefix.to_vec();
        k.extend_from_slice(key);
        Bytes::from(k)
    };

    let clear_end = if range.end.as_ref() >= KEYSPACE_END {
        prefix_end(prefix)
    } else {
        key_after(&prefixed(&range.end))
    };
    out.push(Mutation::clear_range(prefixed(&range.begin), clear_end));

    let mut previous = if range.begin.is_empty() {
        false
    } else {
        table
            .descriptor_before(&range.begin)
            .map_or(false, |d| value_of(&d.state))
    };
    for (piece, state) in table.pieces(range) {
        let value = value_of(&state);
        if value != previous {
            out.push(Mutation::set(prefixed(&piece.begin), encode_bool(value)));
            previous = value;
        }
    }
    if range.end.as_ref() < KEYSPACE_END {
        let after = value_at(&range.end);
        if after != previous {
            out.push(Mutation::set(prefixed(&range.end), encode_bool(after)));
        }
    }
}

fn encode_bool(value: bool) -> Bytes {
    Bytes::from_static(if value { b"1" } else { b"0" })
}

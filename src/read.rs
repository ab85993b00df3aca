//! ReadPath
//!
//! Point and range reads at a version: memory first, the durable store for
//! everything memory does not know, validated against the shard table
//! before and after the durable read.
//!
//! ## Steps
//! ```text
//! admission ─▶ version gate ─▶ pin version ─▶ shard readable? (capture epoch)
//!   ─▶ merge memory@V with durable reads (read pool, timeout)
//!   ─▶ shard unchanged since epoch? ─▶ result
//! ```
//! The durable store never runs ahead of a pinned version, so its rows are
//! valid wherever memory has no entry.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::context::EngineContext;
use crate::error::{AtlasError, Result};
use crate::mvcc::{Lookup, MemEntry, VersionedView};
use crate::types::{key_after, Key, KeyRange, KeyValue, RangeResult, Value, Version, KEYSPACE_END};

/// Outstanding-read counter slot
struct Admission<'a>(&'a AtomicUsize);

impl<'a> Admission<'a> {
    fn enter(ctx: &'a EngineContext) -> Result<Self> {
        let in_flight = ctx.reads_in_flight.fetch_add(1, Ordering::SeqCst);
        if in_flight >= ctx.config.max_concurrent_reads {
            ctx.reads_in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(AtlasError::Overloaded(format!("{} reads in flight", in_flight)));
        }
        Ok(Self(&ctx.reads_in_flight))
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Wait until `version` is applied, within the read's limits
pub fn wait_for_version(ctx: &EngineContext, version: Version) -> Result<()> {
    let oldest = ctx.oldest_version();
    if version < oldest {
        return Err(AtlasError::TransactionTooOld {
            requested: version,
            oldest,
        });
    }
    let current = ctx.version.get();
    if version <= current {
        return Ok(());
    }
    if version > current.saturating_add(ctx.config.max_versions_in_flight) {
        return Err(AtlasError::FutureVersion {
            requested: version,
            current,
        });
    }
    if ctx.version.wait_at_least(version, ctx.config.future_version_timeout()) {
        return Ok(());
    }
    if ctx.is_stopping() {
        return Err(ctx.stopped_error());
    }
    Err(AtlasError::FutureVersion {
        requested: version,
        current: ctx.version.get(),
    })
}

/// Value of `key` at `version`
pub fn get(ctx: &EngineContext, key: &[u8], version: Version) -> Result<Option<Value>> {
    let _admission = Admission::enter(ctx)?;
    if ctx.is_stopping() {
        return Err(ctx.stopped_error());
    }
    if key >= KEYSPACE_END {
        return Err(AtlasError::WrongShard);
    }
    wait_for_version(ctx, version)?;
    let _pin = ctx.floors.pin(version)?;
    let view = pinned_view(ctx, version)?;

    let epoch = {
        let table = ctx.shards.read();
        let desc = table.descriptor_at(key).ok_or(AtlasError::WrongShard)?;
        if !desc.readable_at(version, table.epoch()) {
            return Err(AtlasError::WrongShard);
        }
        table.epoch()
    };

    let value = match view.get(key) {
        Lookup::Value(value) => Some(value),
        Lookup::Cleared => None,
        Lookup::Missing => {
            let store = ctx.durable.clone();
            let key = Key::copy_from_slice(key);
            ctx.read_pool
                .run(ctx.config.read_timeout(), "get", move || store.get(&key))?
        }
    };

    ctx.shards
        .read()
        .validate_read(&KeyRange::single(key), version, epoch)?;
    Ok(value)
}

/// Rows of `range` at `version`; a negative `limit` reads backward
///
/// The range is clamped to the readable shards around its first key (last
/// key when reading backward); a clamped read reports `more`.
pub fn get_range(
    ctx: &EngineContext,
    range: &KeyRange,
    version: Version,
    limit: i64,
    byte_limit: usize,
) -> Result<RangeResult> {
    let _admission = Admission::enter(ctx)?;
    if ctx.is_stopping() {
        return Err(ctx.stopped_error());
    }
    if range.begin.as_ref() >= KEYSPACE_END {
        return Err(AtlasError::WrongShard);
    }
    let range = KeyRange::new(
        range.begin.clone(),
        range.end.clone().min(Key::from_static(KEYSPACE_END)),
    );
    wait_for_version(ctx, version)?;
    if range.is_empty() || limit == 0 {
        return Ok(RangeResult::default());
    }
    let _pin = ctx.floors.pin(version)?;
    let view = pinned_view(ctx, version)?;

    let reverse = limit < 0;
    let (clamped, epoch) = {
        let table = ctx.shards.read();
        let run = if reverse {
            table.readable_run(&range.end, true, version)
        } else {
            table.readable_run(&range.begin, false, version)
        }
        .ok_or(AtlasError::WrongShard)?;
        let clamped = run.clip(&range).ok_or(AtlasError::WrongShard)?;
        (clamped, table.epoch())
    };

    let mut merge = Merge::new(ctx, limit, byte_limit);
    merge.run(&view, &clamped)?;
    let mut result = merge.result;

    ctx.shards.read().validate_read(&clamped, version, epoch)?;
    if clamped != range {
        result.more = true;
    }
    Ok(result)
}

fn pinned_view(ctx: &EngineContext, version: Version) -> Result<VersionedView> {
    ctx.store.view(version).ok_or(AtlasError::TransactionTooOld {
        requested: version,
        oldest: ctx.oldest_version(),
    })
}

// =============================================================================
// Memory / Durable Merge
// =============================================================================

/// Walks memory entries in order, filling the gaps between them from disk
struct Merge<'a> {
    ctx: &'a EngineContext,
    reverse: bool,
    max_rows: usize,
    byte_limit: usize,
    bytes: usize,
    result: RangeResult,
}

impl<'a> Merge<'a> {
    fn new(ctx: &'a EngineContext, limit: i64, byte_limit: usize) -> Self {
        Self {
            ctx,
            reverse: limit < 0,
            max_rows: limit.unsigned_abs() as usize,
            byte_limit,
            bytes: 0,
            result: RangeResult::default(),
        }
    }

    fn run(&mut self, view: &VersionedView, range: &KeyRange) -> Result<()> {
        let entries: Vec<MemEntry> = view.range(range, self.reverse).collect();
        if self.reverse {
            let mut pos = range.end.clone();
            for entry in entries {
                let (entry_end, entry_begin, row) = match entry {
                    MemEntry::Set(kv) => (key_after(&kv.key), kv.key.clone(), Some(kv)),
                    MemEntry::Clear(r) => (r.end, r.begin, None),
                };
                if !self.disk(KeyRange::new(entry_end, pos))? {
                    return Ok(());
                }
                if let Some(kv) = row {
                    if !self.push(kv) {
                        return Ok(());
                    }
                }
                pos = entry_begin;
            }
            self.disk(KeyRange::new(range.begin.clone(), pos))?;
        } else {
            let mut pos = range.begin.clone();
            for entry in entries {
                let (entry_begin, entry_end, row) = match entry {
                    MemEntry::Set(kv) => (kv.key.clone(), key_after(&kv.key), Some(kv)),
                    MemEntry::Clear(r) => (r.begin, r.end, None),
                };
                if !self.disk(KeyRange::new(pos, entry_begin))? {
                    return Ok(());
                }
                if let Some(kv) = row {
                    if !self.push(kv) {
                        return Ok(());
                    }
                }
                pos = entry_end;
            }
            self.disk(KeyRange::new(pos, range.end.clone()))?;
        }
        Ok(())
    }

    fn is_full(&self) -> bool {
        self.result.rows.len() >= self.max_rows || self.bytes >= self.byte_limit
    }

    /// Take one row; false once a limit is hit
    fn push(&mut self, kv: KeyValue) -> bool {
        if self.is_full() {
            self.result.more = true;
            return false;
        }
        self.bytes += kv.size();
        self.result.rows.push(kv);
        true
    }

    /// Read a gap memory knows nothing about; false once a limit is hit
    fn disk(&mut self, gap: KeyRange) -> Result<bool> {
        if gap.is_empty() {
            return Ok(true);
        }
        if self.is_full() {
            self.result.more = true;
            return Ok(false);
        }
        let rows_left = (self.max_rows - self.result.rows.len()) as i64;
        let limit = if self.reverse { -rows_left } else { rows_left };
        let bytes_left = self.byte_limit - self.bytes;
        let store = self.ctx.durable.clone();
        let page = self
            .ctx
            .read_pool
            .run(self.ctx.config.read_timeout(), "range read", move || {
                store.read_range(&gap, limit, bytes_left)
            })?;
        for kv in page.rows {
            self.bytes += kv.size();
            self.result.rows.push(kv);
        }
        if page.more {
            self.result.more = true;
            return Ok(false);
        }
        Ok(true)
    }
}

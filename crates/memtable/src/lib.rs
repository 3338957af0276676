//! # Memtable
//!
//! The in-memory, sorted home of the newest generation of writes.
//!
//! The table is backed by a lock-free skip list, so any number of readers can
//! look up keys or iterate while the single writer (the write-queue consumer)
//! keeps inserting. Exactly one table is *active* at a time; once it grows past
//! the flush threshold it is [frozen](Memtable::freeze) and handed to the flush
//! path, which keeps it readable until its segment is durable.

use crossbeam_skiplist::SkipMap;
use std::ops::{Bound, Deref};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Fixed per-entry cost added to `approx_size` (sequence number + tag).
const ENTRY_OVERHEAD: usize = 9;

/// The payload stored for a key: either a live value or a deletion marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Put(Vec<u8>),
    Tombstone,
}

impl Value {
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Value::Tombstone)
    }

    /// Returns the live bytes, or `None` for a tombstone.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Put(v) => Some(v),
            Value::Tombstone => None,
        }
    }

    #[must_use]
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Value::Put(v) => Some(v),
            Value::Tombstone => None,
        }
    }

    fn len(&self) -> usize {
        self.as_bytes().map_or(0, <[u8]>::len)
    }
}

/// ValueEntry stores the sequence number and the value (or tombstone) that
/// sequence number wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueEntry {
    pub seq: u64,
    pub value: Value,
}

impl ValueEntry {
    pub fn put(seq: u64, value: Vec<u8>) -> Self {
        Self {
            seq,
            value: Value::Put(value),
        }
    }

    pub fn tombstone(seq: u64) -> Self {
        Self {
            seq,
            value: Value::Tombstone,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemtableError {
    #[error("memtable is frozen")]
    Frozen,
}

pub struct Memtable {
    map: SkipMap<Vec<u8>, ValueEntry>,
    approx_size: AtomicUsize,
    frozen: AtomicBool,
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("entries", &self.len())
            .field("approx_size", &self.approx_size())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

impl Memtable {
    pub fn new() -> Self {
        Self {
            map: SkipMap::new(),
            approx_size: AtomicUsize::new(0),
            frozen: AtomicBool::new(false),
        }
    }

    /// Put a key with a seq number. Ignored unless `seq` is newer than the
    /// stored entry, which keeps WAL replay idempotent.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, seq: u64) -> Result<(), MemtableError> {
        self.apply(key, ValueEntry::put(seq, value))
    }

    /// Delete: install a tombstone with seq.
    pub fn delete(&self, key: Vec<u8>, seq: u64) -> Result<(), MemtableError> {
        self.apply(key, ValueEntry::tombstone(seq))
    }

    fn apply(&self, key: Vec<u8>, entry: ValueEntry) -> Result<(), MemtableError> {
        if self.is_frozen() {
            return Err(MemtableError::Frozen);
        }
        // Only one writer exists, so read-then-insert cannot race another insert.
        match self.map.get(&key) {
            Some(old) if old.value().seq >= entry.seq => return Ok(()),
            Some(old) => {
                let old_len = old.value().value.len();
                self.approx_size.fetch_sub(old_len, Ordering::Relaxed);
                self.approx_size.fetch_add(entry.value.len(), Ordering::Relaxed);
            }
            None => {
                self.approx_size.fetch_add(
                    key.len() + entry.value.len() + ENTRY_OVERHEAD,
                    Ordering::Relaxed,
                );
            }
        }
        self.map.insert(key, entry);
        Ok(())
    }

    /// Returns the newest entry for `key`, tombstones included, so callers can
    /// tell "deleted here" from "not here".
    pub fn get(&self, key: &[u8]) -> Option<ValueEntry> {
        self.map.get(key).map(|e| e.value().clone())
    }

    /// Ordered iterator over every entry, tombstones included.
    pub fn iter(&self) -> impl Iterator<Item = (Vec<u8>, ValueEntry)> + '_ {
        self.map
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
    }

    /// Ordered iterator over `start..=end`, tombstones included.
    pub fn range<'a>(
        &'a self,
        start: &[u8],
        end: &[u8],
    ) -> impl Iterator<Item = (Vec<u8>, ValueEntry)> + 'a {
        let bounds = (
            Bound::Included(start.to_vec()),
            Bound::Included(end.to_vec()),
        );
        self.map
            .range(bounds)
            .map(|e| (e.key().clone(), e.value().clone()))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Approximate memory footprint: keys, live values and a fixed overhead
    /// per entry. Tombstones count too, so delete-only workloads still flush.
    pub fn approx_size(&self) -> usize {
        self.approx_size.load(Ordering::Relaxed)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Marks the table read-only and returns the handle used by the flush
    /// path. Further writes fail with [`MemtableError::Frozen`].
    pub fn freeze(self: Arc<Self>) -> FrozenMemtable {
        self.frozen.store(true, Ordering::Release);
        FrozenMemtable(self)
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

/// A read-only memtable waiting to be written out as a segment.
#[derive(Debug, Clone)]
pub struct FrozenMemtable(Arc<Memtable>);

impl FrozenMemtable {
    /// Highest sequence number held by the table (0 when empty).
    pub fn max_seq(&self) -> u64 {
        self.0.iter().map(|(_, e)| e.seq).max().unwrap_or(0)
    }
}

impl Deref for FrozenMemtable {
    type Target = Memtable;

    fn deref(&self) -> &Memtable {
        &self.0
    }
}

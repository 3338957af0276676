//! Read path: `get()`, `get_batch()`, `get_range()`.
//!
//! Point lookups check the active memtable, then frozen memtables newest
//! first, then segments in recency order. The first entry found wins and a
//! tombstone hides everything older. Only a key found nowhere is looked up
//! in the replication sink.
//!
//! Range reads merge every source at once, keep the newest entry per key and
//! drop tombstones. They never consult replication.
//!
//! Memtables are captured before the segment set so that a concurrent flush
//! can only make a table visible twice, never zero times.

use anyhow::Result;
use memtable::ValueEntry;
use sstable::{EntrySource, MergeIterator};
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::display_key;
use crate::write::validate_key;
use crate::{EngineError, Inner, StorageEngine};

impl Inner {
    /// Newest entry for `key` across memtables and segments, tombstones included.
    pub(crate) fn lookup(&self, key: &[u8]) -> Result<Option<ValueEntry>> {
        let (active, frozen) = self.memtables.read().snapshot();
        if let Some(entry) = active.get(key) {
            return Ok(Some(entry));
        }
        for table in &frozen {
            if let Some(entry) = table.get(key) {
                return Ok(Some(entry));
            }
        }

        let segments = self.segments.load();
        for live in segments.iter() {
            if let Some(entry) = live.segment.get(key)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        match self.lookup(key).map_err(|e| EngineError::io("get", Some(key), e))? {
            Some(entry) => Ok(entry.value.into_bytes()),
            None => Ok(self.replica_get(key)),
        }
    }

    fn replica_get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.replication.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    key = %display_key(key),
                    error = %format!("{e:#}"),
                    "replication read failed"
                );
                None
            }
        }
    }

    pub(crate) fn range(&self, start: &[u8], end: &[u8]) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        let (active, frozen) = self.memtables.read().snapshot();
        let segments = self.segments.load_full();

        let mut sources: Vec<EntrySource<'_>> =
            Vec::with_capacity(1 + frozen.len() + segments.len());
        sources.push(Box::new(active.range(start, end).map(Ok::<_, anyhow::Error>)));
        for table in &frozen {
            sources.push(Box::new(table.range(start, end).map(Ok::<_, anyhow::Error>)));
        }
        for live in segments.iter() {
            sources.push(Box::new(live.segment.range_scan(start, end)));
        }

        let mut out = BTreeMap::new();
        for item in MergeIterator::new(sources)? {
            let (key, entry) = item?;
            if let Some(value) = entry.value.into_bytes() {
                out.insert(key, value);
            }
        }
        Ok(out)
    }
}

impl StorageEngine {
    /// Returns the live value for `key`, or `None` if it was never written or
    /// has been deleted.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>, EngineError> {
        let key = validate_key(key.as_ref())?;
        self.ensure_started()?;
        self.inner.get(&key)
    }

    /// Looks up every key. Keys are validated up front; the result maps each
    /// trimmed key to its value or `None`.
    pub fn get_batch<I, K>(
        &self,
        keys: I,
    ) -> Result<BTreeMap<Vec<u8>, Option<Vec<u8>>>, EngineError>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let keys = keys
            .into_iter()
            .map(|k| validate_key(k.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        self.ensure_started()?;

        let mut out = BTreeMap::new();
        for key in keys {
            let value = self.inner.get(&key)?;
            out.insert(key, value);
        }
        Ok(out)
    }

    /// Every live key in `start..=end` with its newest value, ascending.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidRange`] if `start` sorts after `end`.
    pub fn get_range(
        &self,
        start: impl AsRef<[u8]>,
        end: impl AsRef<[u8]>,
    ) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, EngineError> {
        let start = validate_key(start.as_ref())?;
        let end = validate_key(end.as_ref())?;
        if start > end {
            return Err(EngineError::InvalidRange);
        }
        self.ensure_started()?;
        self.inner
            .range(&start, &end)
            .map_err(|e| EngineError::io("get_range", Some(&start), e))
    }
}

//! K-way merge over sorted `(key, ValueEntry)` sources.
//!
//! Produces entries in ascending key order. When the same key appears in
//! several sources, only the entry with the **highest sequence number** is
//! emitted (newest wins). Tombstones are passed through; dropping them is
//! the caller's decision.
//!
//! This is the core primitive for compaction (walk N input segments in
//! sorted order and write one deduplicated stream) and for range reads that
//! combine memtables with segments.

use anyhow::Result;
use memtable::ValueEntry;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::Segment;

/// A sorted, fallible source of entries.
pub type EntrySource<'a> = Box<dyn Iterator<Item = Result<(Vec<u8>, ValueEntry)>> + 'a>;

/// The head entry of one source, ordered for the heap.
struct HeapEntry {
    key: Vec<u8>,
    entry: ValueEntry,
    /// Index into `sources`.
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: smallest key first, then highest seq,
        // then the lower source index.
        other
            .key
            .cmp(&self.key)
            .then_with(|| self.entry.seq.cmp(&other.entry.seq))
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Merges several sorted sources into one sorted, deduplicated stream.
///
/// Each source must yield strictly ascending keys. The first error from any
/// source is returned once, after which the iterator is finished.
pub struct MergeIterator<'a> {
    sources: Vec<EntrySource<'a>>,
    heap: BinaryHeap<HeapEntry>,
    done: bool,
}

impl<'a> MergeIterator<'a> {
    /// Primes the heap with the first entry of every source.
    ///
    /// # Errors
    ///
    /// Returns the error of a source that fails on its first entry.
    pub fn new(sources: Vec<EntrySource<'a>>) -> Result<Self> {
        let mut merge = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            done: false,
        };
        for source in 0..merge.sources.len() {
            merge.advance(source)?;
        }
        Ok(merge)
    }

    /// Merges the full contents of `segments`.
    pub fn over_segments<I>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a Segment>,
    {
        Self::new(
            segments
                .into_iter()
                .map(|s| Box::new(s.iter()) as EntrySource<'a>)
                .collect(),
        )
    }

    /// Pulls the next entry of `source` onto the heap.
    fn advance(&mut self, source: usize) -> Result<()> {
        if let Some(next) = self.sources[source].next() {
            let (key, entry) = next?;
            self.heap.push(HeapEntry { key, entry, source });
        }
        Ok(())
    }

    fn next_entry(&mut self) -> Result<Option<(Vec<u8>, ValueEntry)>> {
        let Some(top) = self.heap.pop() else {
            return Ok(None);
        };
        self.advance(top.source)?;

        // Older versions of the same key sit right below the winner.
        while self.heap.peek().is_some_and(|e| e.key == top.key) {
            if let Some(dup) = self.heap.pop() {
                self.advance(dup.source)?;
            }
        }
        Ok(Some((top.key, top.entry)))
    }

    /// Collects all remaining entries into a `Vec`.
    pub fn collect_all(self) -> Result<Vec<(Vec<u8>, ValueEntry)>> {
        self.collect()
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = Result<(Vec<u8>, ValueEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_entry() {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

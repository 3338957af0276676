//! The live segment set: an immutable snapshot, replaced wholesale.
//!
//! Readers load the current `Arc<SegmentSet>` and consult it without any
//! lock; flush and compaction build a new set and swap it in. Entries are
//! kept in read-recency order:
//!
//! ```text
//! tier 0  gen 14, gen 13        ← newest, checked first
//! tier 1  gen 12, gen 9
//! tier 2  gen 5                 ← oldest
//! ```
//!
//! Every segment at tier `t` is newer than every segment at tier `t + 1`,
//! because compaction always merges a whole tier into the next one.
//!
//! A flush produces a run of one segment; a compaction produces one run
//! that may be split across several files with disjoint key ranges.
//! Compaction triggers count runs, not files.

use sstable::Segment;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// One live segment, its tier and its run.
#[derive(Debug, Clone)]
pub(crate) struct LiveSegment {
    pub tier: u32,
    pub run: u64,
    pub segment: Arc<Segment>,
}

impl LiveSegment {
    pub fn generation(&self) -> u64 {
        self.segment.generation()
    }
}

#[derive(Debug, Default)]
pub(crate) struct SegmentSet {
    /// Tier ascending, generation descending.
    entries: Vec<LiveSegment>,
}

impl SegmentSet {
    pub fn new(mut entries: Vec<LiveSegment>) -> Self {
        entries.sort_by(|a, b| {
            a.tier
                .cmp(&b.tier)
                .then_with(|| b.generation().cmp(&a.generation()))
        });
        Self { entries }
    }

    /// Segments in read order, newest first.
    pub fn iter(&self) -> impl Iterator<Item = &LiveSegment> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All segments of `tier`, newest first.
    pub fn tier(&self, tier: u32) -> Vec<Arc<Segment>> {
        self.entries
            .iter()
            .filter(|e| e.tier == tier)
            .map(|e| Arc::clone(&e.segment))
            .collect()
    }

    /// Segment files per tier.
    pub fn tier_counts(&self) -> BTreeMap<u32, usize> {
        let mut counts = BTreeMap::new();
        for e in &self.entries {
            *counts.entry(e.tier).or_insert(0) += 1;
        }
        counts
    }

    /// Sorted runs per tier.
    pub fn tier_runs(&self) -> BTreeMap<u32, usize> {
        let mut runs: BTreeMap<u32, BTreeSet<u64>> = BTreeMap::new();
        for e in &self.entries {
            runs.entry(e.tier).or_default().insert(e.run);
        }
        runs.into_iter().map(|(tier, r)| (tier, r.len())).collect()
    }

    pub fn max_tier(&self) -> Option<u32> {
        self.entries.iter().map(|e| e.tier).max()
    }

    pub fn max_seq(&self) -> u64 {
        self.entries.iter().map(|e| e.segment.max_seq()).max().unwrap_or(0)
    }

    /// A new set with `added` on top of the current segments.
    pub fn with_added(&self, added: LiveSegment) -> Self {
        let mut entries = self.entries.clone();
        entries.push(added);
        Self::new(entries)
    }

    /// A new set with the `removed` generations swapped for `added`.
    pub fn replace(&self, removed: &[u64], added: Vec<LiveSegment>) -> Self {
        let mut entries: Vec<LiveSegment> = self
            .entries
            .iter()
            .filter(|e| !removed.contains(&e.generation()))
            .cloned()
            .collect();
        entries.extend(added);
        Self::new(entries)
    }
}

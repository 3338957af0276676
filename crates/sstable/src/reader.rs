use anyhow::{bail, ensure, Context, Result};
use memmap2::Mmap;
use memtable::ValueEntry;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

use crate::format::{decode_index, decode_record, parse_segment_file_name, Footer, FOOTER_BYTES};

/// An immutable, memory-mapped segment file.
///
/// [`open`](Segment::open) validates the footer, maps the whole file
/// read-only and decodes the sparse index into memory. Lookups and scans
/// only touch the mapping, so any number of threads can read through a
/// shared `&Segment` (usually an `Arc<Segment>`) without taking a lock.
///
/// A segment that has been replaced by compaction is
/// [marked obsolete](Segment::mark_obsolete); its file is removed when the
/// last reference goes away, so a reader holding an older view of the
/// segment set keeps a valid mapping until it is done.
pub struct Segment {
    path: PathBuf,
    generation: u64,
    mmap: Mmap,
    footer: Footer,
    /// Sparse index: every `sparse_every`-th key and its data offset.
    index: Vec<(Vec<u8>, u64)>,
    last_key: Vec<u8>,
    obsolete: AtomicBool,
}

impl Segment {
    /// Opens and validates a segment file named `seg-<generation>.sst`.
    ///
    /// # Errors
    ///
    /// Fails if the name carries no generation, the file is too small, the
    /// footer or index is malformed, or the file holds no entries.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let generation = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_segment_file_name)
            .with_context(|| format!("not a segment file name: {}", path.display()))?;

        let file = File::open(&path)
            .with_context(|| format!("failed to open segment {generation}"))?;
        let file_size = file.metadata()?.len();
        ensure!(
            file_size >= FOOTER_BYTES,
            "segment {} too small ({} bytes)",
            generation,
            file_size
        );

        // SAFETY: segment files are never modified after the rename that
        // publishes them, and are only deleted once no `Segment` maps them.
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to map segment {generation}"))?;

        let footer = Footer::read_from(&mmap)
            .with_context(|| format!("invalid footer in segment {generation}"))?;
        let index_end = mmap.len() - FOOTER_BYTES as usize;
        let index = decode_index(&mmap[footer.index_offset as usize..index_end])
            .with_context(|| format!("invalid sparse index in segment {generation}"))?;

        if footer.entry_count == 0 || index.is_empty() {
            bail!("segment {generation} holds no entries");
        }
        ensure!(
            index[0].1 == 0,
            "segment {} sparse index does not start at the first record",
            generation
        );
        ensure!(
            index.windows(2).all(|w| w[0].0 < w[1].0 && w[0].1 < w[1].1)
                && index.iter().all(|(_, off)| *off < footer.index_offset),
            "segment {} sparse index is out of order",
            generation
        );

        let mut segment = Self {
            path,
            generation,
            mmap,
            footer,
            index,
            last_key: Vec::new(),
            obsolete: AtomicBool::new(false),
        };
        segment.last_key = segment.scan_last_key()?;
        Ok(segment)
    }

    /// Walks the final sparse block to find the largest key.
    fn scan_last_key(&self) -> Result<Vec<u8>> {
        let data = self.data();
        let mut offset = self.index[self.index.len() - 1].1 as usize;
        let mut last = None;
        while offset < data.len() {
            let rec = decode_record(data, offset)?;
            last = Some(rec.key);
            offset = rec.next;
        }
        match last {
            Some(k) => Ok(k.to_vec()),
            None => bail!("segment {} has an empty final block", self.generation),
        }
    }

    fn data(&self) -> &[u8] {
        &self.mmap[..self.footer.index_offset as usize]
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Highest sequence number stored in this segment.
    #[must_use]
    pub fn max_seq(&self) -> u64 {
        self.footer.max_seq
    }

    /// Number of entries (tombstones included).
    #[must_use]
    pub fn len(&self) -> u64 {
        self.footer.entry_count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.footer.entry_count == 0
    }

    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn first_key(&self) -> &[u8] {
        &self.index[0].0
    }

    #[must_use]
    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    /// Number of sparse index entries.
    #[must_use]
    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    /// Data offset of the block that may contain `key`, or `None` if `key`
    /// sorts before the first key.
    fn block_start(&self, key: &[u8]) -> Option<usize> {
        let pos = self.index.partition_point(|(k, _)| k.as_slice() <= key);
        pos.checked_sub(1).map(|i| self.index[i].1 as usize)
    }

    /// Point lookup. Tombstones are returned as such, so the caller can tell
    /// "deleted here" from "not in this segment".
    ///
    /// # Errors
    ///
    /// Returns an error if a record in the scanned block fails its CRC check
    /// or is malformed.
    pub fn get(&self, key: &[u8]) -> Result<Option<ValueEntry>> {
        if key > self.last_key.as_slice() {
            return Ok(None);
        }
        let pos = self.index.partition_point(|(k, _)| k.as_slice() <= key);
        let Some(start) = pos.checked_sub(1).map(|i| self.index[i].1 as usize) else {
            return Ok(None);
        };
        let end = self
            .index
            .get(pos)
            .map_or(self.footer.index_offset as usize, |(_, off)| *off as usize);

        let data = self.data();
        let mut offset = start;
        while offset < end {
            let rec = decode_record(data, offset)
                .with_context(|| format!("corrupt record in segment {}", self.generation))?;
            match rec.key.cmp(key) {
                std::cmp::Ordering::Less => offset = rec.next,
                std::cmp::Ordering::Equal => return Ok(Some(rec.to_entry())),
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(None)
    }

    /// Ordered scan of every key in `start..=end`, tombstones included.
    ///
    /// The iterator seeks through the sparse index to the block holding
    /// `start` and decodes lazily from there; each call starts afresh.
    pub fn range_scan(&self, start: &[u8], end: &[u8]) -> SegmentIter<'_> {
        if start > end || end < self.first_key() || start > self.last_key() {
            return SegmentIter::exhausted(self);
        }
        SegmentIter {
            segment: self,
            offset: self.block_start(start).unwrap_or(0),
            start: Some(start.to_vec()),
            end: Some(end.to_vec()),
            done: false,
        }
    }

    /// Ordered scan of the whole segment, tombstones included.
    pub fn iter(&self) -> SegmentIter<'_> {
        SegmentIter {
            segment: self,
            offset: 0,
            start: None,
            end: None,
            done: false,
        }
    }

    /// Schedules the file for deletion once the last reference is dropped.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("generation", &self.generation)
            .field("entries", &self.footer.entry_count)
            .field("max_seq", &self.footer.max_seq)
            .field("file_size", &self.file_size())
            .field("obsolete", &self.is_obsolete())
            .finish()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if !self.is_obsolete() {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(generation = self.generation, "deleted obsolete segment"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                generation = self.generation,
                error = %e,
                "failed to delete obsolete segment"
            ),
        }
    }
}

/// Lazy, ordered iterator over a segment's records.
///
/// Yields `Err` once and then stops if a record is corrupt.
pub struct SegmentIter<'a> {
    segment: &'a Segment,
    offset: usize,
    start: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    done: bool,
}

impl<'a> SegmentIter<'a> {
    fn exhausted(segment: &'a Segment) -> Self {
        Self {
            segment,
            offset: 0,
            start: None,
            end: None,
            done: true,
        }
    }
}

impl Iterator for SegmentIter<'_> {
    type Item = Result<(Vec<u8>, ValueEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        let data = self.segment.data();
        while !self.done && self.offset < data.len() {
            let rec = match decode_record(data, self.offset) {
                Ok(rec) => rec,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.context(format!(
                        "corrupt record in segment {}",
                        self.segment.generation
                    ))));
                }
            };
            self.offset = rec.next;

            if let Some(start) = &self.start {
                if rec.key < start.as_slice() {
                    continue;
                }
            }
            if let Some(end) = &self.end {
                if rec.key > end.as_slice() {
                    self.done = true;
                    return None;
                }
            }
            return Some(Ok((rec.key.to_vec(), rec.to_entry())));
        }
        self.done = true;
        None
    }
}

//! Flush path: frozen memtable → tier-0 segment.
//!
//! The oldest frozen memtable is written first so that segment generations
//! follow sequence order. A flush is durable once the segment file and the
//! manifest listing it (with the raised `flushed_seq`) are both on disk; only
//! then is the memtable dropped from the read path and its rotated WALs
//! deleted. A WAL that cannot be deleted is retried after the next flush and
//! skipped by recovery meanwhile.

use anyhow::{Context, Result};
use sstable::SegmentWriter;
use std::fs;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::manifest::SegmentMeta;
use crate::segments::LiveSegment;
use crate::Inner;

impl Inner {
    /// Flushes every frozen memtable, oldest first. Returns how many.
    pub(crate) fn flush_all(&self) -> Result<usize> {
        let _job = self.job_lock.lock();
        let mut flushed = 0;
        while self.flush_oldest()? {
            flushed += 1;
        }
        Ok(flushed)
    }

    /// Flushes the oldest frozen memtable. The caller holds `job_lock`.
    ///
    /// Returns `false` when there was nothing to flush.
    pub(crate) fn flush_oldest(&self) -> Result<bool> {
        let Some(oldest) = self.memtables.read().immutables.last().cloned() else {
            return Ok(false);
        };
        #[cfg(test)]
        self.faults.before_flush()?;

        let segment = if oldest.table.is_empty() {
            None
        } else {
            let generation = self.manifest.lock().allocate_generation();
            let segment = SegmentWriter::build(
                self.dir(),
                generation,
                self.config.sparse_index_every,
                oldest.table.iter(),
            )
            .with_context(|| format!("failed to write segment {generation}"))?;
            Some(segment)
        };

        {
            let mut manifest = self.manifest.lock();
            let before = manifest.clone();
            if let Some(segment) = &segment {
                manifest.add(SegmentMeta::single(segment.generation(), 0));
            }
            manifest.record_seqs(oldest.covered_seq, self.last_seq.load(Ordering::Acquire));
            if let Err(e) = manifest.save() {
                *manifest = before;
                if let Some(segment) = &segment {
                    segment.mark_obsolete();
                }
                return Err(e.context("failed to record flushed segment in manifest"));
            }
        }

        let (generation, entries, bytes) = match &segment {
            Some(s) => (s.generation(), s.len(), s.file_size()),
            None => (0, 0, 0),
        };
        if let Some(segment) = segment {
            let current = self.segments.load_full();
            self.segments.store(Arc::new(current.with_added(LiveSegment {
                tier: 0,
                run: generation,
                segment: Arc::new(segment),
            })));
        }

        // The segment is now visible, so the memtable can leave the read path.
        {
            let mut tables = self.memtables.write();
            if tables
                .immutables
                .last()
                .is_some_and(|imm| imm.same_table(&oldest))
            {
                tables.immutables.pop();
            }
        }

        let mut wals = mem::take(&mut *self.stale_wals.lock());
        wals.extend(oldest.wals.iter().cloned());
        let kept: Vec<PathBuf> = wals.into_iter().filter(|wal| !remove_wal(wal)).collect();
        if !kept.is_empty() {
            self.stale_wals.lock().extend(kept);
        }

        info!(
            generation,
            entries,
            bytes,
            flushed_seq = oldest.covered_seq,
            "flushed memtable"
        );
        Ok(true)
    }
}

/// Deletes a flushed WAL. Returns `false` if it is still on disk.
fn remove_wal(wal: &Path) -> bool {
    match fs::remove_file(wal) {
        Ok(()) => {
            debug!(file = %wal.display(), "removed flushed WAL");
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(
                file = %wal.display(),
                error = %e,
                "failed to remove flushed WAL, retrying after the next flush"
            );
            false
        }
    }
}

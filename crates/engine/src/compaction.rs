//! Background flushing and size-tiered compaction.
//!
//! One thread owns all background disk work. It sleeps until the write path
//! calls [`CompactionTrigger::maybe_schedule`], then:
//!
//! 1. flushes every frozen memtable into a tier-0 segment (oldest first);
//! 2. while some tier holds `compaction_fan_in` runs, merges the whole
//!    youngest such tier into one run at the next tier.
//!
//! ```text
//! tier 0: [g14] [g13] [g12] [g11]   fan-in reached
//!           \     |     |    /
//!            k-way merge, newest seq wins
//!                   |
//! tier 1:        [g15 g16]          one run, split at target size
//! ```
//!
//! Tombstones are dropped only when the merged tier is the oldest one: no
//! older segment can then hold a value they would have to shadow.
//!
//! A job writes its outputs completely, records them in the manifest, and
//! swaps the segment set before the inputs are marked obsolete. An error or
//! a shutdown request at any point before that leaves the inputs live and
//! deletes the partial outputs.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use sstable::{MergeIterator, Segment, SegmentWriter};
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

use crate::manifest::SegmentMeta;
use crate::segments::{LiveSegment, SegmentSet};
use crate::{EngineError, Inner, StorageEngine};

/// Coalescing wake-up signal for the compactor.
#[derive(Clone)]
pub(crate) struct CompactionTrigger {
    tx: Sender<()>,
}

impl CompactionTrigger {
    /// Never blocks: a pending signal already covers this one.
    pub(crate) fn maybe_schedule(&self) {
        let _ = self.tx.try_send(());
    }
}

/// An immutable description of one merge.
#[derive(Debug, Clone)]
pub(crate) struct CompactionJob {
    /// Every segment being merged, newest first.
    pub inputs: Vec<Arc<Segment>>,
    pub output_tier: u32,
    pub fan_in: usize,
    pub drop_tombstones: bool,
}

impl CompactionJob {
    /// The youngest tier holding at least `fan_in` runs, if any.
    pub(crate) fn pick(set: &SegmentSet, fan_in: usize) -> Option<Self> {
        let oldest_tier = set.max_tier()?;
        let (tier, runs) = set.tier_runs().into_iter().find(|(_, runs)| *runs >= fan_in)?;
        Some(Self {
            inputs: set.tier(tier),
            output_tier: tier + 1,
            fan_in: runs,
            drop_tombstones: tier == oldest_tier,
        })
    }

    /// Every live segment into one run past the oldest tier.
    ///
    /// A lone segment is still rewritten so its tombstones go away.
    pub(crate) fn major(set: &SegmentSet) -> Option<Self> {
        if set.is_empty() {
            return None;
        }
        let oldest_tier = set.max_tier()?;
        Some(Self {
            inputs: set.iter().map(|e| Arc::clone(&e.segment)).collect(),
            output_tier: oldest_tier + 1,
            fan_in: set.len(),
            drop_tombstones: true,
        })
    }

    fn input_generations(&self) -> Vec<u64> {
        self.inputs.iter().map(|s| s.generation()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    Completed { outputs: usize },
    Aborted,
}

/// Marks unfinished outputs obsolete so their files go away on drop.
fn discard(outputs: Vec<Segment>) {
    for segment in outputs {
        segment.mark_obsolete();
    }
}

impl Inner {
    /// One wake-up of the background thread.
    fn run_background(&self) {
        let _job = self.job_lock.lock();

        while !self.is_stopping() {
            match self.flush_oldest() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    // The frozen memtable stays in place; writers stall once
                    // the backlog is full and keep re-triggering this loop.
                    error!(
                        error = %format!("{e:#}"),
                        frozen = self.frozen_count(),
                        "background flush failed"
                    );
                    return;
                }
            }
        }

        while !self.is_stopping() {
            let fan_in = self.config.compaction_fan_in;
            let Some(job) = CompactionJob::pick(&self.segments.load(), fan_in) else {
                break;
            };
            match self.run_job(&job) {
                Ok(JobOutcome::Completed { .. }) => {}
                Ok(JobOutcome::Aborted) => break,
                Err(e) => {
                    // Inputs stay live; the next trigger retries.
                    warn!(error = %format!("{e:#}"), "compaction failed");
                    break;
                }
            }
        }
    }

    /// Major compaction of every live segment. Serialised with background work.
    pub(crate) fn compact_all(&self) -> Result<JobOutcome> {
        let _job = self.job_lock.lock();
        match CompactionJob::major(&self.segments.load()) {
            Some(job) => self.run_job(&job),
            None => Ok(JobOutcome::Completed { outputs: 0 }),
        }
    }

    pub(crate) fn run_job(&self, job: &CompactionJob) -> Result<JobOutcome> {
        let generations = job.input_generations();
        info!(
            inputs = ?generations,
            fan_in = job.fan_in,
            output_tier = job.output_tier,
            drop_tombstones = job.drop_tombstones,
            "compaction started"
        );

        let mut outputs = Vec::new();
        match self.write_outputs(job, &mut outputs) {
            Ok(true) => {}
            Ok(false) => {
                discard(outputs);
                info!(inputs = ?generations, "compaction aborted by shutdown");
                return Ok(JobOutcome::Aborted);
            }
            Err(e) => {
                discard(outputs);
                return Err(e);
            }
        }

        let produced = outputs.len();
        let bytes: u64 = outputs.iter().map(Segment::file_size).sum();
        self.install(job, &generations, outputs)?;
        info!(
            inputs = ?generations,
            outputs = produced,
            bytes,
            output_tier = job.output_tier,
            "compaction finished"
        );
        Ok(JobOutcome::Completed { outputs: produced })
    }

    /// Streams the merge into new segment files.
    ///
    /// Returns `false` if a shutdown request arrived before the next output
    /// file was started.
    fn write_outputs(&self, job: &CompactionJob, outputs: &mut Vec<Segment>) -> Result<bool> {
        let merged = MergeIterator::over_segments(job.inputs.iter().map(Arc::as_ref))?;
        let mut writer: Option<SegmentWriter> = None;

        for item in merged {
            let (key, entry) = item.context("failed to read compaction input")?;
            if job.drop_tombstones && entry.value.is_tombstone() {
                continue;
            }
            if writer.is_none() {
                if self.is_stopping() {
                    return Ok(false);
                }
                let generation = self.manifest.lock().allocate_generation();
                writer = Some(SegmentWriter::create(
                    self.dir(),
                    generation,
                    self.config.sparse_index_every,
                )?);
            }
            let Some(w) = writer.as_mut() else { continue };
            w.add(&key, &entry)?;
            if w.data_size() >= self.config.target_segment_bytes {
                if let Some(full) = writer.take() {
                    outputs.push(full.finish()?);
                }
            }
        }
        if let Some(last) = writer.take() {
            outputs.push(last.finish()?);
        }
        Ok(true)
    }

    /// Records the outputs in the manifest, swaps the live set, retires inputs.
    fn install(&self, job: &CompactionJob, removed: &[u64], outputs: Vec<Segment>) -> Result<()> {
        let run = outputs.first().map_or(0, Segment::generation);
        let added: Vec<SegmentMeta> = outputs
            .iter()
            .map(|s| SegmentMeta {
                generation: s.generation(),
                tier: job.output_tier,
                run,
            })
            .collect();

        // Dropped tombstones may have carried the highest sequence numbers
        // still on disk; the manifest keeps them from being reused.
        let merged_seq = job.inputs.iter().map(|s| s.max_seq()).max().unwrap_or(0);

        let mut manifest = self.manifest.lock();
        let before = manifest.clone();
        manifest.replace(removed, &added);
        manifest.record_seqs(merged_seq, self.last_seq.load(Ordering::Acquire));
        if let Err(e) = manifest.save() {
            *manifest = before;
            discard(outputs);
            return Err(e.context("failed to record compaction in manifest"));
        }

        let live = outputs
            .into_iter()
            .map(|segment| LiveSegment {
                tier: job.output_tier,
                run,
                segment: Arc::new(segment),
            })
            .collect();
        let current = self.segments.load_full();
        self.segments.store(Arc::new(current.replace(removed, live)));
        drop(manifest);

        // Readers still holding the old set keep the files open until done.
        for input in &job.inputs {
            input.mark_obsolete();
        }
        Ok(())
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

/// Owner of the background thread.
pub(crate) struct Compactor {
    inner: Arc<Inner>,
    trigger: CompactionTrigger,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Compactor {
    pub(crate) fn start(inner: Arc<Inner>) -> io::Result<Self> {
        let (tx, rx) = bounded(1);
        let worker = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("lsmkv-compactor".to_string())
                .spawn(move || background_loop(&inner, &rx))?
        };
        Ok(Self {
            inner,
            trigger: CompactionTrigger { tx },
            worker: Mutex::new(Some(worker)),
        })
    }

    pub(crate) fn trigger(&self) -> CompactionTrigger {
        self.trigger.clone()
    }

    /// Asks the thread to stop and waits for it. A job in progress finishes
    /// its current output file, then aborts.
    pub(crate) fn stop(&self) -> Result<()> {
        self.inner.stopping.store(true, Ordering::Release);
        self.trigger.maybe_schedule();
        match self.worker.lock().take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow::anyhow!("compactor thread panicked")),
            None => Ok(()),
        }
    }
}

impl Drop for Compactor {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %format!("{e:#}"), "compactor shutdown on drop failed");
        }
    }
}

fn background_loop(inner: &Inner, rx: &Receiver<()>) {
    for () in rx.iter() {
        if inner.is_stopping() {
            break;
        }
        inner.run_background();
    }
}

impl StorageEngine {
    /// Freezes the active memtable and writes every frozen memtable out as a
    /// segment before returning.
    ///
    /// # Errors
    ///
    /// [`EngineError::Io`] if a segment or the manifest cannot be written;
    /// the memtables stay readable and their WALs stay on disk.
    pub fn flush(&self) -> Result<(), EngineError> {
        self.freeze_active()?;
        self.inner
            .flush_all()
            .map_err(|e| EngineError::io("flush", None, e))?;
        if let Ok(running) = self.running() {
            running.compactor.trigger().maybe_schedule();
        }
        Ok(())
    }

    /// Merges every live segment into one run and drops all tombstones.
    ///
    /// Frozen memtables are not flushed first; call [`flush`](Self::flush)
    /// for a fully compacted store.
    pub fn compact(&self) -> Result<(), EngineError> {
        self.ensure_started()?;
        match self.inner.compact_all() {
            Ok(JobOutcome::Completed { .. }) => Ok(()),
            Ok(JobOutcome::Aborted) => Err(EngineError::Closed),
            Err(e) => Err(EngineError::io("compact", None, e)),
        }
    }
}

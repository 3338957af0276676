//! # Engine - lsmkv storage engine
//!
//! The orchestrator that ties the [`memtable`], [`wal`] and [`sstable`]
//! crates into an embedded LSM-tree key-value store.
//!
//! ## Architecture
//!
//! ```text
//!  put / delete / put_batch            get / get_batch / get_range
//!          |                                      |
//!          v                                      v
//! ┌──────────────────┐              active memtable
//! │   WriteQueue     │  bounded,      → frozen memtables (newest first)
//! │  (backpressure)  │  one consumer  → segments (tier asc, gen desc)
//! └────────┬─────────┘                → replication sink (get only)
//!          v
//!  WAL append → memtable insert
//!          |  (flush threshold?)
//!          v
//!  freeze + rotate WAL ──signal──▶ Compactor thread
//!                                   flush frozen → tier-0 segment
//!                                   merge over-full tier → next tier
//!                                   manifest save → atomic set swap
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module          | Purpose                                                  |
//! |-----------------|----------------------------------------------------------|
//! | `lib.rs`        | `StorageEngine`, lifecycle (`start`, `close`), `stats`   |
//! | [`queue`]       | Generic bounded `WriteQueue` with one consumer thread    |
//! | `write`         | `put`, `delete`, `put_batch`, WAL rotation and freeze    |
//! | `read`          | `get`, `get_batch`, `get_range`                          |
//! | `flush`         | Frozen memtable → tier-0 segment                         |
//! | `compaction`    | Background thread, size-tiered jobs, `flush`, `compact`  |
//! | `recovery`      | Manifest load, orphan cleanup, WAL replay                |
//! | `manifest`      | Persistent list of live segments and their tiers         |
//! | `segments`      | Immutable live-segment snapshot                          |
//! | [`replication`] | Optional `ReplicationSink` capability                    |
//!
//! ## Crash Safety
//!
//! Every mutation reaches the WAL before the memtable. A frozen memtable's
//! WAL is deleted only after its segment and the manifest listing it are
//! durable. Segments and the manifest are written to a temp file, fsynced
//! and renamed. The manifest also carries the highest flushed and the highest
//! assigned sequence number. Recovery deletes whatever an interrupted flush
//! or compaction left behind and replays only WAL records above the flushed
//! mark.
//!
//! At most `max_frozen_memtables` frozen memtables wait for a flush. Past
//! that the writer stops freezing and stalls writes until the compactor
//! catches up, failing them with [`EngineError::WriteStall`] on timeout.

mod compaction;
mod error;
#[cfg(test)]
mod faults;
mod flush;
mod manifest;
pub mod queue;
mod read;
mod recovery;
pub mod replication;
mod segments;
mod write;

pub use config::{BackpressurePolicy, EngineConfig, FsyncPolicy, ShutdownPolicy};
pub use error::EngineError;
pub use queue::{Consumer, QueueError, WriteQueue};
pub use replication::{Mutation, NoopReplication, ReplicationSink};

use arc_swap::ArcSwap;
use compaction::Compactor;
use manifest::Manifest;
use memtable::{FrozenMemtable, Memtable};
use parking_lot::{Mutex, RwLock};
use replication::ReplicationFeed;
use segments::SegmentSet;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use wal::WalWriter;
use write::{WriteApplier, WriteTask};

/// Maximum key size in bytes, after trimming.
pub const MAX_KEY_SIZE: usize = 1024;
/// Maximum value size in bytes (16 MiB).
pub const MAX_VALUE_SIZE: usize = 16 * 1024 * 1024;

/// Name of the active WAL within the data directory.
pub const WAL_FILENAME: &str = "wal.log";

/// A frozen memtable waiting for its segment, and the WALs that hold it.
#[derive(Clone)]
pub(crate) struct Immutable {
    table: FrozenMemtable,
    wals: Vec<PathBuf>,
    /// `last_seq` at freeze time; every record up to it is in `table` or
    /// in an older table.
    covered_seq: u64,
}

impl Immutable {
    fn same_table(&self, other: &Immutable) -> bool {
        std::ptr::eq::<Memtable>(&*self.table, &*other.table)
    }
}

pub(crate) struct MemTables {
    active: Arc<Memtable>,
    /// Newest first.
    immutables: Vec<Immutable>,
}

impl MemTables {
    fn new(active: Memtable) -> Self {
        Self {
            active: Arc::new(active),
            immutables: Vec::new(),
        }
    }

    /// The tables a reader must consult, newest first.
    fn snapshot(&self) -> (Arc<Memtable>, Vec<FrozenMemtable>) {
        let frozen = self.immutables.iter().map(|imm| imm.table.clone()).collect();
        (Arc::clone(&self.active), frozen)
    }
}

/// State shared by callers, the write consumer and the compactor.
pub(crate) struct Inner {
    config: EngineConfig,
    memtables: RwLock<MemTables>,
    segments: ArcSwap<SegmentSet>,
    manifest: Mutex<Manifest>,
    /// Serialises flushes and compaction jobs.
    job_lock: Mutex<()>,
    /// Flushed WALs whose deletion failed.
    stale_wals: Mutex<Vec<PathBuf>>,
    last_seq: AtomicU64,
    stopping: AtomicBool,
    replication: Arc<dyn ReplicationSink>,
    #[cfg(test)]
    faults: faults::Faults,
}

impl Inner {
    pub(crate) fn dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub(crate) fn wal_path(&self) -> PathBuf {
        self.config.data_dir.join(WAL_FILENAME)
    }

    pub(crate) fn frozen_count(&self) -> usize {
        self.memtables.read().immutables.len()
    }
}

/// Background machinery that exists only between `start` and `close`.
struct Running {
    queue: WriteQueue<WriteTask>,
    compactor: Compactor,
    feed: ReplicationFeed,
}

enum State {
    Created,
    Started(Arc<Running>),
    Closed,
}

/// A point-in-time view of engine internals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Highest sequence number handed out so far.
    pub last_seq: u64,
    pub active_memtable_bytes: usize,
    pub active_memtable_entries: usize,
    /// Frozen memtables not yet written to a segment.
    pub frozen_memtables: usize,
    /// Live segment files per tier.
    pub segments_per_tier: BTreeMap<u32, usize>,
    /// Write tasks waiting in the queue.
    pub queued_writes: usize,
}

impl EngineStats {
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments_per_tier.values().sum()
    }
}

/// An embedded LSM-tree key-value store.
///
/// # Lifecycle
///
/// `Created` → [`start`](Self::start) → `Started` → [`close`](Self::close)
/// → `Closed`. Operations before `start` fail with
/// [`EngineError::NotStarted`], after `close` with [`EngineError::Closed`].
/// Dropping a started engine closes it.
///
/// # Write Path
///
/// 1. Validate the key (trimmed, non-empty, at most [`MAX_KEY_SIZE`]).
/// 2. Enqueue the task; a saturated queue applies the
///    [`BackpressurePolicy`].
/// 3. The consumer assigns the next sequence number, appends to the WAL and
///    inserts into the active memtable.
/// 4. Past the flush threshold the memtable is frozen and the compactor
///    writes it out in the background.
///
/// # Read Path
///
/// Memtables, then segments newest first; the first hit wins and tombstones
/// hide older values. A complete miss falls back to the replication sink.
pub struct StorageEngine {
    inner: Arc<Inner>,
    state: RwLock<State>,
}

impl fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.read() {
            State::Created => "created",
            State::Started(_) => "started",
            State::Closed => "closed",
        };
        let stats = self.stats();
        f.debug_struct("StorageEngine")
            .field("data_dir", &self.inner.config.data_dir)
            .field("state", &state)
            .field("last_seq", &stats.last_seq)
            .field("memtable_size", &stats.active_memtable_bytes)
            .field("frozen_memtables", &stats.frozen_memtables)
            .field("segments_per_tier", &stats.segments_per_tier)
            .finish()
    }
}

impl StorageEngine {
    /// Creates an engine in the `Created` state. Nothing touches the disk
    /// until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// [`EngineError::Config`] if the configuration does not validate.
    pub fn new(
        config: EngineConfig,
        replication: Arc<dyn ReplicationSink>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let manifest = Manifest::empty(&config.data_dir);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                memtables: RwLock::new(MemTables::new(Memtable::new())),
                segments: ArcSwap::from_pointee(SegmentSet::default()),
                manifest: Mutex::new(manifest),
                job_lock: Mutex::new(()),
                stale_wals: Mutex::new(Vec::new()),
                last_seq: AtomicU64::new(0),
                stopping: AtomicBool::new(false),
                replication,
                #[cfg(test)]
                faults: faults::Faults::default(),
            }),
            state: RwLock::new(State::Created),
        })
    }

    /// Creates and starts an engine without replication.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let engine = Self::new(config, Arc::new(NoopReplication))?;
        engine.start()?;
        Ok(engine)
    }

    /// Recovers state from the data directory and starts the write consumer,
    /// the compactor and the replication feed. Starting twice is a no-op.
    ///
    /// # Errors
    ///
    /// [`EngineError::Recovery`] if the manifest is unreadable, a listed
    /// segment is missing or corrupt, or the WAL cannot be opened.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut state = self.state.write();
        match *state {
            State::Created => {}
            State::Started(_) => return Ok(()),
            State::Closed => return Err(EngineError::Closed),
        }

        let recovered = recovery::recover(&self.inner.config).map_err(EngineError::Recovery)?;
        let pending_wals = recovered.rotated_wals;
        self.inner.last_seq.store(recovered.last_seq, Ordering::Release);
        *self.inner.memtables.write() = MemTables::new(recovered.memtable);
        self.inner.segments.store(Arc::new(recovered.segments));
        *self.inner.manifest.lock() = recovered.manifest;

        let running = self.spawn(pending_wals).map_err(EngineError::Recovery)?;
        // Segments left over-full by an earlier run.
        running.compactor.trigger().maybe_schedule();
        *state = State::Started(Arc::new(running));

        info!(
            dir = %self.inner.config.data_dir.display(),
            last_seq = self.inner.last_seq.load(Ordering::Acquire),
            "storage engine started"
        );
        Ok(())
    }

    fn spawn(&self, pending_wals: Vec<PathBuf>) -> anyhow::Result<Running> {
        let config = &self.inner.config;
        let wal = WalWriter::open(self.inner.wal_path(), config.fsync_policy)
            .map_err(|e| anyhow::Error::new(e).context("failed to open WAL"))?;
        let feed =
            ReplicationFeed::start(Arc::clone(&self.inner.replication), config.replication_buffer)?;
        let compactor = Compactor::start(Arc::clone(&self.inner))?;
        let applier = WriteApplier::new(
            Arc::clone(&self.inner),
            wal,
            pending_wals,
            compactor.trigger(),
            feed.publisher(),
        );
        let queue = WriteQueue::start(
            "lsmkv-writer",
            config.write_queue_capacity,
            config.backpressure,
            config.shutdown_policy,
            applier,
        )?;
        Ok(Running {
            queue,
            compactor,
            feed,
        })
    }

    /// Stops the compactor, drains (or discards) the write queue, closes the
    /// WAL and flushes the replication feed.
    ///
    /// Idempotent. Every step runs even if an earlier one fails; the first
    /// failure is returned. Frozen memtables that were not flushed yet stay
    /// in their WALs and are replayed on the next start.
    pub fn close(&self) -> Result<(), EngineError> {
        let previous = std::mem::replace(&mut *self.state.write(), State::Closed);
        let State::Started(running) = previous else {
            return Ok(());
        };

        let mut first_error = None;
        if let Err(e) = running.compactor.stop() {
            warn!(error = %format!("{e:#}"), "compactor shutdown failed");
            first_error.get_or_insert(EngineError::io("close", None, e));
        }
        if let Err(e) = running.queue.shutdown() {
            warn!(error = %format!("{e:#}"), "write queue shutdown failed");
            first_error.get_or_insert(EngineError::io("close", None, e));
        }
        running.feed.stop();

        info!(
            last_seq = self.inner.last_seq.load(Ordering::Acquire),
            "storage engine closed"
        );
        first_error.map_or(Ok(()), Err)
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let queued_writes = match &*self.state.read() {
            State::Started(running) => running.queue.len(),
            State::Created | State::Closed => 0,
        };
        let tables = self.inner.memtables.read();
        EngineStats {
            last_seq: self.inner.last_seq.load(Ordering::Acquire),
            active_memtable_bytes: tables.active.approx_size(),
            active_memtable_entries: tables.active.len(),
            frozen_memtables: tables.immutables.len(),
            segments_per_tier: self.inner.segments.load().tier_counts(),
            queued_writes,
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        self.inner.dir()
    }

    fn running(&self) -> Result<Arc<Running>, EngineError> {
        match &*self.state.read() {
            State::Created => Err(EngineError::NotStarted),
            State::Started(running) => Ok(Arc::clone(running)),
            State::Closed => Err(EngineError::Closed),
        }
    }

    fn ensure_started(&self) -> Result<(), EngineError> {
        self.running().map(drop)
    }
}

/// Best-effort close on drop. Errors are logged; anything not yet in a
/// segment is still in the WAL and is recovered on the next start.
impl Drop for StorageEngine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "close on drop failed");
        }
    }
}

#[cfg(test)]
mod tests;

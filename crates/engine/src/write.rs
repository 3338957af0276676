//! Write path: `put()`, `delete()`, `put_batch()`.
//!
//! Callers validate and enqueue; the single [`WriteApplier`] consumer assigns
//! sequence numbers and appends each mutation to the WAL **before** applying
//! it to the active memtable. Once the memtable grows past the flush
//! threshold the applier freezes it, rotates the WAL, and signals the
//! compactor, which writes the frozen table out in the background.
//!
//! While `max_frozen_memtables` tables already wait for their flush, the
//! active memtable is left over-full instead. The next batch then stalls
//! until the backlog shrinks and fails with [`EngineError::WriteStall`] if
//! it does not within `write_stall_timeout`.

use anyhow::Context;
use config::FsyncPolicy;
use crossbeam_channel::{bounded, Sender};
use memtable::Memtable;
use std::fs::{self, File};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use wal::{WalRecord, WalWriter};

use crate::compaction::CompactionTrigger;
use crate::error::display_key;
use crate::queue::Consumer;
use crate::recovery::rotated_wal_name;
use crate::replication::{Mutation, Publisher};
use crate::{EngineError, Immutable, Inner, StorageEngine, MAX_KEY_SIZE, MAX_VALUE_SIZE};

/// Idle tick used when every append is synced anyway.
const STRICT_IDLE_TICK: Duration = Duration::from_millis(100);
/// How often a stalled writer rechecks the frozen memtable backlog.
const STALL_POLL: Duration = Duration::from_millis(5);
/// How often a stalled writer re-signals the compactor.
const STALL_KICK: Duration = Duration::from_millis(100);

pub(crate) enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl WriteOp {
    fn name(&self) -> &'static str {
        match self {
            WriteOp::Put { .. } => "put",
            WriteOp::Delete { .. } => "delete",
        }
    }

    fn into_mutation(self, seq: u64) -> Mutation {
        match self {
            WriteOp::Put { key, value } => Mutation::Put { seq, key, value },
            WriteOp::Delete { key } => Mutation::Delete { seq, key },
        }
    }
}

/// Where a submitted task stopped.
pub(crate) struct ApplyFailure {
    /// Operations committed before the failure.
    applied: usize,
    /// Key of the failing operation; `None` when nothing was attempted.
    key: Option<Vec<u8>>,
    error: EngineError,
}

impl ApplyFailure {
    fn before_apply(error: EngineError) -> Self {
        Self {
            applied: 0,
            key: None,
            error,
        }
    }
}

pub(crate) enum WriteTask {
    Apply {
        ops: Vec<WriteOp>,
        reply: Sender<Result<(), ApplyFailure>>,
    },
    /// Freeze the active memtable even if it is below the threshold.
    Freeze { reply: Sender<Result<(), EngineError>> },
}

/// The write queue's consumer: sole writer of the WAL and the active memtable.
pub(crate) struct WriteApplier {
    inner: Arc<Inner>,
    wal: WalWriter,
    wal_path: PathBuf,
    /// Rotated WALs whose records are in the active memtable.
    pending_wals: Vec<PathBuf>,
    trigger: CompactionTrigger,
    publisher: Publisher,
}

impl WriteApplier {
    pub(crate) fn new(
        inner: Arc<Inner>,
        wal: WalWriter,
        pending_wals: Vec<PathBuf>,
        trigger: CompactionTrigger,
        publisher: Publisher,
    ) -> Self {
        let wal_path = inner.wal_path();
        Self {
            inner,
            wal,
            wal_path,
            pending_wals,
            trigger,
            publisher,
        }
    }

    fn apply_ops(&mut self, ops: Vec<WriteOp>) -> Result<(), ApplyFailure> {
        self.wait_for_backlog().map_err(ApplyFailure::before_apply)?;
        let active = Arc::clone(&self.inner.memtables.read().active);
        let mut committed = Vec::with_capacity(ops.len());
        let mut outcome = Ok(());
        for (applied, op) in ops.into_iter().enumerate() {
            if let Err((key, error)) = self.apply_one(&active, op, &mut committed) {
                outcome = Err(ApplyFailure {
                    applied,
                    key: Some(key),
                    error,
                });
                break;
            }
        }
        self.publisher.publish(committed);

        if active.approx_size() >= self.inner.config.memtable_flush_bytes {
            self.freeze_logged();
        }
        outcome
    }

    /// Stalls while an over-full active memtable cannot be frozen because
    /// the frozen backlog is at its cap, then freezes it.
    fn wait_for_backlog(&mut self) -> Result<(), EngineError> {
        let config = &self.inner.config;
        if self.inner.memtables.read().active.approx_size() < config.memtable_flush_bytes {
            return Ok(());
        }
        let cap = config.max_frozen_memtables;
        let mut frozen = self.inner.frozen_count();
        if frozen >= cap {
            warn!(frozen, "frozen memtable backlog is full, stalling writes");
            let deadline = Instant::now() + config.write_stall_timeout;
            let mut next_kick = Instant::now();
            while frozen >= cap {
                let now = Instant::now();
                if self.inner.is_stopping() || now >= deadline {
                    return Err(EngineError::WriteStall { frozen });
                }
                if now >= next_kick {
                    self.trigger.maybe_schedule();
                    next_kick = now + STALL_KICK;
                }
                thread::sleep(STALL_POLL);
                frozen = self.inner.frozen_count();
            }
        }
        self.freeze_logged();
        Ok(())
    }

    fn freeze_logged(&mut self) {
        if let Err(e) = self.freeze(false) {
            error!(error = %format!("{e:#}"), "memtable freeze failed");
        }
    }

    fn apply_one(
        &mut self,
        active: &Memtable,
        op: WriteOp,
        committed: &mut Vec<Mutation>,
    ) -> Result<(), (Vec<u8>, EngineError)> {
        let op_name = op.name();
        let seq = self.inner.last_seq.load(Ordering::Acquire) + 1;
        let mutation = op.into_mutation(seq);
        let fail = |m: &Mutation, e: anyhow::Error| {
            (m.key().to_vec(), EngineError::io(op_name, Some(m.key()), e))
        };

        if self.wal.is_closed() {
            self.reopen_wal().map_err(|e| fail(&mutation, e))?;
        }
        #[cfg(test)]
        self.inner.faults.before_append().map_err(|e| fail(&mutation, e))?;
        let wal_len = self.wal.len();
        if let Err(e) = self.wal.append(&WalRecord::from(&mutation)) {
            if self.wal.len() != wal_len {
                // The record could not be cut back out of the log.
                self.inner.last_seq.store(seq, Ordering::Release);
            }
            return Err(fail(&mutation, e.into()));
        }
        // Appended: this seq is taken even if the memtable rejects the write.
        self.inner.last_seq.store(seq, Ordering::Release);

        let applied = match &mutation {
            Mutation::Put { key, value, .. } => active.put(key.clone(), value.clone(), seq),
            Mutation::Delete { key, .. } => active.delete(key.clone(), seq),
        };
        applied.map_err(|e| fail(&mutation, e.into()))?;
        committed.push(mutation);
        Ok(())
    }

    fn reopen_wal(&mut self) -> anyhow::Result<()> {
        self.wal = WalWriter::open(&self.wal_path, self.inner.config.fsync_policy)
            .context("failed to reopen WAL")?;
        Ok(())
    }

    /// Freezes the active memtable and rotates the WAL alongside it.
    ///
    /// An empty memtable is left in place, and so is any memtable while the
    /// frozen backlog is at its cap unless `force` is set.
    fn freeze(&mut self, force: bool) -> anyhow::Result<()> {
        let active = Arc::clone(&self.inner.memtables.read().active);
        if active.is_empty() {
            return Ok(());
        }
        let frozen = self.inner.frozen_count();
        if !force && frozen >= self.inner.config.max_frozen_memtables {
            debug!(frozen, "frozen memtable backlog is full, deferring freeze");
            return Ok(());
        }

        let last_seq = self.inner.last_seq.load(Ordering::Acquire);
        if !self.wal.is_empty() {
            self.wal.close().context("failed to close WAL for rotation")?;
            let rotated = self.inner.dir().join(rotated_wal_name(last_seq));
            fs::rename(&self.wal_path, &rotated).context("failed to rotate WAL")?;
            self.pending_wals.push(rotated);
            sync_dir(self.inner.dir());
            self.reopen_wal()?;
        }

        let entries = active.len();
        let bytes = active.approx_size();
        let wals = mem::take(&mut self.pending_wals);
        {
            let mut tables = self.inner.memtables.write();
            let frozen = Arc::clone(&tables.active).freeze();
            tables.immutables.insert(
                0,
                Immutable {
                    table: frozen,
                    wals,
                    covered_seq: last_seq,
                },
            );
            tables.active = Arc::new(Memtable::new());
        }
        info!(entries, bytes, last_seq, "froze memtable");
        self.trigger.maybe_schedule();
        Ok(())
    }
}

impl Consumer<WriteTask> for WriteApplier {
    fn apply(&mut self, task: WriteTask) {
        match task {
            WriteTask::Apply { ops, reply } => {
                let result = self.apply_ops(ops);
                // Every batch posts a signal; the compactor decides.
                self.trigger.maybe_schedule();
                let _ = reply.send(result);
            }
            WriteTask::Freeze { reply } => {
                let result = self
                    .freeze(true)
                    .map_err(|e| EngineError::io("flush", None, e));
                let _ = reply.send(result);
            }
        }
    }

    fn on_idle(&mut self) {
        if let Err(e) = self.wal.sync_if_due() {
            warn!(error = %e, "WAL group commit failed");
        }
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.wal.close().context("failed to close WAL")
    }

    fn idle_interval(&self) -> Duration {
        match self.inner.config.fsync_policy {
            FsyncPolicy::Interval(every) => every,
            FsyncPolicy::Always => STRICT_IDLE_TICK,
        }
    }
}

fn sync_dir(dir: &Path) {
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}

/// Trims ASCII whitespace and enforces the key bounds.
pub(crate) fn validate_key(raw: &[u8]) -> Result<Vec<u8>, EngineError> {
    let key = raw.trim_ascii();
    if key.is_empty() {
        return Err(EngineError::InvalidKey("key is empty".to_string()));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(EngineError::InvalidKey(format!(
            "key is {} bytes (max {MAX_KEY_SIZE})",
            key.len()
        )));
    }
    Ok(key.to_vec())
}

fn validate_value(raw: &[u8]) -> Result<Vec<u8>, EngineError> {
    if raw.len() > MAX_VALUE_SIZE {
        return Err(EngineError::InvalidValue(format!(
            "value is {} bytes (max {MAX_VALUE_SIZE})",
            raw.len()
        )));
    }
    Ok(raw.to_vec())
}

impl StorageEngine {
    /// Stores `value` under `key`.
    ///
    /// Returns once the mutation is in the WAL and the memtable. Whether it
    /// is also on stable storage depends on the [`FsyncPolicy`].
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidKey`] / [`EngineError::InvalidValue`] before
    /// anything is written, [`EngineError::Backpressure`] when the write
    /// queue is saturated, [`EngineError::Io`] when the WAL append fails.
    pub fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<(), EngineError> {
        let key = validate_key(key.as_ref())?;
        let value = validate_value(value.as_ref())?;
        self.submit(vec![WriteOp::Put { key, value }]).map_err(|f| f.error)
    }

    /// Deletes `key` by writing a tombstone.
    ///
    /// # Errors
    ///
    /// Same as [`put`](Self::put).
    pub fn delete(&self, key: impl AsRef<[u8]>) -> Result<(), EngineError> {
        let key = validate_key(key.as_ref())?;
        self.submit(vec![WriteOp::Delete { key }]).map_err(|f| f.error)
    }

    /// Stores every entry as one queued task, in iteration order.
    ///
    /// Every key and value is validated before anything is enqueued. The
    /// batch is not transactional: if an append fails midway, the entries
    /// before it stay committed and [`EngineError::BatchPartial`] names how
    /// many and which key failed. Nothing after the failure is written.
    pub fn put_batch<I, K, V>(&self, entries: I) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let ops = entries
            .into_iter()
            .map(|(k, v)| {
                Ok(WriteOp::Put {
                    key: validate_key(k.as_ref())?,
                    value: validate_value(v.as_ref())?,
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;
        if ops.is_empty() {
            return self.ensure_started();
        }

        let total = ops.len();
        self.submit(ops).map_err(|f| match f.key {
            Some(key) => EngineError::BatchPartial {
                applied: f.applied,
                total,
                key: display_key(&key),
                source: Box::new(f.error),
            },
            None => f.error,
        })
    }

    fn submit(&self, ops: Vec<WriteOp>) -> Result<(), ApplyFailure> {
        let running = self.running().map_err(ApplyFailure::before_apply)?;
        let (reply, done) = bounded(1);
        running
            .queue
            .enqueue(WriteTask::Apply { ops, reply })
            .map_err(|e| ApplyFailure::before_apply(e.into()))?;
        // A task discarded on shutdown drops its reply sender.
        done.recv()
            .map_err(|_| ApplyFailure::before_apply(EngineError::Closed))?
    }

    /// Freezes the active memtable through the write queue, so the freeze
    /// lands after every write enqueued before it.
    pub(crate) fn freeze_active(&self) -> Result<(), EngineError> {
        let running = self.running()?;
        let (reply, done) = bounded(1);
        running.queue.enqueue(WriteTask::Freeze { reply })?;
        done.recv().map_err(|_| EngineError::Closed)?
    }
}

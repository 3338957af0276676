//! Optional replication sink and the feed that drives it.
//!
//! The engine never waits on replication. Committed mutations are handed to
//! a bounded [`ReplicationFeed`] which forwards them to the sink on its own
//! thread; when the feed is full the batch is dropped and a warning logged.
//! Sink failures are logged and never reach the caller of a write.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::warn;
use wal::WalRecord;

/// One committed mutation, as seen by a replication sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Put { seq: u64, key: Vec<u8>, value: Vec<u8> },
    Delete { seq: u64, key: Vec<u8> },
}

impl Mutation {
    #[must_use]
    pub fn seq(&self) -> u64 {
        match self {
            Mutation::Put { seq, .. } | Mutation::Delete { seq, .. } => *seq,
        }
    }

    #[must_use]
    pub fn key(&self) -> &[u8] {
        match self {
            Mutation::Put { key, .. } | Mutation::Delete { key, .. } => key,
        }
    }
}

impl From<&Mutation> for WalRecord {
    fn from(m: &Mutation) -> Self {
        match m {
            Mutation::Put { seq, key, value } => WalRecord::Put {
                seq: *seq,
                key: key.clone(),
                value: value.clone(),
            },
            Mutation::Delete { seq, key } => WalRecord::Delete {
                seq: *seq,
                key: key.clone(),
            },
        }
    }
}

/// A best-effort secondary copy of the data.
///
/// `replicate` receives every committed batch in commit order (minus any
/// batch dropped on overflow). `get` is consulted only after the memtables
/// and all segments miss a key.
pub trait ReplicationSink: Send + Sync + 'static {
    fn replicate(&self, batch: &[Mutation]) -> anyhow::Result<()>;

    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;
}

/// The default sink: replicates nothing and knows nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReplication;

impl ReplicationSink for NoopReplication {
    fn replicate(&self, _batch: &[Mutation]) -> anyhow::Result<()> {
        Ok(())
    }

    fn get(&self, _key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Bounded, non-blocking hand-off from the write consumer to the sink.
pub(crate) struct ReplicationFeed {
    sender: Mutex<Option<Sender<Vec<Mutation>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationFeed {
    pub(crate) fn start(sink: Arc<dyn ReplicationSink>, buffer: usize) -> io::Result<Self> {
        let (tx, rx) = bounded(buffer);
        let worker = thread::Builder::new()
            .name("lsmkv-replication".to_string())
            .spawn(move || forward(&rx, sink.as_ref()))?;
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// A publishing handle for the write consumer.
    pub(crate) fn publisher(&self) -> Publisher {
        Publisher {
            sender: self.sender.lock().clone(),
        }
    }

    /// Closes the feed once every publisher is gone and waits for the
    /// forwarding thread to deliver what is buffered.
    pub(crate) fn stop(&self) {
        drop(self.sender.lock().take());
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("replication thread panicked");
            }
        }
    }
}

impl Drop for ReplicationFeed {
    fn drop(&mut self) {
        self.stop();
    }
}

fn forward(rx: &Receiver<Vec<Mutation>>, sink: &dyn ReplicationSink) {
    for batch in rx.iter() {
        if let Err(e) = sink.replicate(&batch) {
            warn!(
                mutations = batch.len(),
                first_seq = batch.first().map(Mutation::seq),
                error = %format!("{e:#}"),
                "replication failed"
            );
        }
    }
}

/// Sending half of a [`ReplicationFeed`].
pub(crate) struct Publisher {
    sender: Option<Sender<Vec<Mutation>>>,
}

impl Publisher {
    pub(crate) fn publish(&self, batch: Vec<Mutation>) {
        let Some(tx) = &self.sender else { return };
        if batch.is_empty() {
            return;
        }
        match tx.try_send(batch) {
            Ok(()) => {}
            Err(TrySendError::Full(batch)) => warn!(
                dropped = batch.len(),
                first_seq = batch.first().map(Mutation::seq),
                "replication feed full, dropping batch"
            ),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

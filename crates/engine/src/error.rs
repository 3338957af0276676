use config::ConfigError;
use thiserror::Error;

use crate::queue::QueueError;

/// Errors returned by the public [`StorageEngine`](crate::StorageEngine) API.
///
/// Messages name the operation and the key but never a file path; the full
/// diagnostic chain stays reachable through [`std::error::Error::source`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid key range: start key sorts after end key")]
    InvalidRange,

    #[error("write rejected: {0}")]
    Backpressure(QueueError),

    /// Flushes fell behind: the frozen memtable backlog stayed full for the
    /// whole stall timeout.
    #[error("write stalled: {frozen} frozen memtables are waiting for a flush")]
    WriteStall { frozen: usize },

    #[error("{op} failed{}", key_suffix(.key))]
    Io {
        op: &'static str,
        key: Option<String>,
        #[source]
        source: anyhow::Error,
    },

    #[error(
        "batch partially applied: {applied} of {total} entries committed before key {key:?} failed"
    )]
    BatchPartial {
        applied: usize,
        total: usize,
        key: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("engine not started")]
    NotStarted,

    #[error("engine is closed")]
    Closed,

    #[error("recovery failed")]
    Recovery(#[source] anyhow::Error),
}

fn key_suffix(key: &Option<String>) -> String {
    match key {
        Some(k) => format!(" for key {k:?}"),
        None => String::new(),
    }
}

impl EngineError {
    pub(crate) fn io(
        op: &'static str,
        key: Option<&[u8]>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        EngineError::Io {
            op,
            key: key.map(display_key),
            source: source.into(),
        }
    }

    /// Returns `true` for errors the caller can fix by retrying later.
    #[must_use]
    pub fn is_backpressure(&self) -> bool {
        matches!(self, EngineError::Backpressure(_) | EngineError::WriteStall { .. })
    }
}

impl From<QueueError> for EngineError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Full | QueueError::Timeout => EngineError::Backpressure(e),
            QueueError::Closed => EngineError::Closed,
        }
    }
}

pub(crate) fn display_key(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

//! # Config - engine tuning knobs
//!
//! Every tunable of the storage engine lives in [`EngineConfig`]. The
//! defaults mirror a small single-node deployment; tests usually shrink the
//! flush threshold so that segments appear after a handful of writes.
//!
//! ## Environment
//!
//! [`EngineConfig::from_env`] reads the following variables, falling back to
//! the default for anything unset:
//!
//! ```text
//! LSMKV_DATA_DIR        data directory                  (default: "data")
//! LSMKV_FLUSH_KB        memtable flush threshold in KiB (default: 8192)
//! LSMKV_FSYNC           "always" or interval in ms      (default: 50)
//! LSMKV_SPARSE_EVERY    sparse index interval           (default: 32)
//! LSMKV_FAN_IN          compaction fan-in               (default: 4)
//! LSMKV_QUEUE_CAPACITY  write queue capacity            (default: 1000)
//! LSMKV_BACKPRESSURE    "fail-fast", "block" or ms      (default: 100)
//! LSMKV_MAX_FROZEN      frozen memtables awaiting flush (default: 4)
//! ```

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Default memtable size (bytes) that triggers a freeze + flush.
pub const DEFAULT_MEMTABLE_FLUSH_BYTES: usize = 8 * 1024 * 1024;
/// Default group-commit interval for [`FsyncPolicy::Interval`].
pub const DEFAULT_FSYNC_INTERVAL: Duration = Duration::from_millis(50);
/// Default number of records between two sparse index entries.
pub const DEFAULT_SPARSE_INDEX_EVERY: usize = 32;
/// Default number of same-tier segments merged per compaction job.
pub const DEFAULT_COMPACTION_FAN_IN: usize = 4;
/// Default size at which a compaction output segment is cut.
pub const DEFAULT_TARGET_SEGMENT_BYTES: u64 = 64 * 1024 * 1024;
/// Default bound of the write queue.
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 1000;
/// Default bound of the replication feed.
pub const DEFAULT_REPLICATION_BUFFER: usize = 1024;
/// Default time an enqueue may wait for room in the write queue.
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(100);
/// Default number of frozen memtables allowed to wait for their flush.
pub const DEFAULT_MAX_FROZEN_MEMTABLES: usize = 4;
/// Default time a stalled write waits for the flush backlog to shrink.
pub const DEFAULT_WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// When WAL appends are forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// `fsync` after every append. Slowest, nothing acknowledged is ever lost.
    Always,
    /// Group commit: `fsync` at most once per interval. A crash may lose the
    /// writes of the last interval.
    Interval(Duration),
}

impl Default for FsyncPolicy {
    fn default() -> Self {
        FsyncPolicy::Interval(DEFAULT_FSYNC_INTERVAL)
    }
}

/// What `enqueue` does when the write queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Reject immediately with a backpressure error.
    FailFast,
    /// Wait until the consumer makes room.
    Block,
    /// Wait up to the given duration, then reject.
    BlockFor(Duration),
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        BackpressurePolicy::BlockFor(DEFAULT_ENQUEUE_TIMEOUT)
    }
}

/// What happens to queued writes when the engine shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownPolicy {
    /// Apply every queued write before returning.
    #[default]
    Drain,
    /// Drop queued writes; their callers get a "closed" error.
    Discard,
}

/// Errors produced while building or validating a configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("compaction fan-in must be at least 2 (got {0})")]
    FanInTooSmall(usize),
}

/// Complete configuration of a storage engine instance.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Directory holding `wal.log`, segments and the manifest.
    pub data_dir: PathBuf,
    /// Memtable size that triggers a freeze and background flush.
    pub memtable_flush_bytes: usize,
    /// WAL durability policy.
    pub fsync_policy: FsyncPolicy,
    /// Every N-th segment record gets a sparse index entry.
    pub sparse_index_every: usize,
    /// Segments per tier that trigger a compaction job.
    pub compaction_fan_in: usize,
    /// Compaction output is split once a segment grows past this size.
    pub target_segment_bytes: u64,
    /// Maximum number of pending write tasks.
    pub write_queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
    pub shutdown_policy: ShutdownPolicy,
    /// Maximum number of committed batches buffered for the replication sink.
    pub replication_buffer: usize,
    /// Frozen memtables allowed to wait for a flush. Once reached, the
    /// active memtable is not frozen again and writes stall.
    pub max_frozen_memtables: usize,
    /// How long a stalled write waits before failing.
    pub write_stall_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            memtable_flush_bytes: DEFAULT_MEMTABLE_FLUSH_BYTES,
            fsync_policy: FsyncPolicy::default(),
            sparse_index_every: DEFAULT_SPARSE_INDEX_EVERY,
            compaction_fan_in: DEFAULT_COMPACTION_FAN_IN,
            target_segment_bytes: DEFAULT_TARGET_SEGMENT_BYTES,
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
            backpressure: BackpressurePolicy::default(),
            shutdown_policy: ShutdownPolicy::default(),
            replication_buffer: DEFAULT_REPLICATION_BUFFER,
            max_frozen_memtables: DEFAULT_MAX_FROZEN_MEMTABLES,
            write_stall_timeout: DEFAULT_WRITE_STALL_TIMEOUT,
        }
    }
}

impl EngineConfig {
    /// Creates a default configuration rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn memtable_flush_bytes(mut self, bytes: usize) -> Self {
        self.memtable_flush_bytes = bytes;
        self
    }

    pub fn fsync_policy(mut self, policy: FsyncPolicy) -> Self {
        self.fsync_policy = policy;
        self
    }

    pub fn sparse_index_every(mut self, every: usize) -> Self {
        self.sparse_index_every = every;
        self
    }

    pub fn compaction_fan_in(mut self, fan_in: usize) -> Self {
        self.compaction_fan_in = fan_in;
        self
    }

    pub fn target_segment_bytes(mut self, bytes: u64) -> Self {
        self.target_segment_bytes = bytes;
        self
    }

    pub fn write_queue_capacity(mut self, capacity: usize) -> Self {
        self.write_queue_capacity = capacity;
        self
    }

    pub fn backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.backpressure = policy;
        self
    }

    pub fn shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown_policy = policy;
        self
    }

    pub fn replication_buffer(mut self, size: usize) -> Self {
        self.replication_buffer = size;
        self
    }

    pub fn max_frozen_memtables(mut self, max: usize) -> Self {
        self.max_frozen_memtables = max;
        self
    }

    pub fn write_stall_timeout(mut self, timeout: Duration) -> Self {
        self.write_stall_timeout = timeout;
        self
    }

    /// Checks that every knob is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for zero-sized limits or a fan-in below 2
    /// (merging a single segment never reduces read amplification).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memtable_flush_bytes == 0 {
            return Err(ConfigError::Zero("memtable_flush_bytes"));
        }
        if self.sparse_index_every == 0 {
            return Err(ConfigError::Zero("sparse_index_every"));
        }
        if self.write_queue_capacity == 0 {
            return Err(ConfigError::Zero("write_queue_capacity"));
        }
        if self.target_segment_bytes == 0 {
            return Err(ConfigError::Zero("target_segment_bytes"));
        }
        if self.replication_buffer == 0 {
            return Err(ConfigError::Zero("replication_buffer"));
        }
        if self.max_frozen_memtables == 0 {
            return Err(ConfigError::Zero("max_frozen_memtables"));
        }
        if let FsyncPolicy::Interval(d) = self.fsync_policy {
            if d.is_zero() {
                return Err(ConfigError::Zero("fsync interval"));
            }
        }
        if self.compaction_fan_in < 2 {
            return Err(ConfigError::FanInTooSmall(self.compaction_fan_in));
        }
        Ok(())
    }

    /// Builds a configuration from `LSMKV_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) but with an injectable lookup,
    /// so tests never touch the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(dir) = lookup("LSMKV_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Some(kb) = parse_var::<usize, _>(&lookup, "LSMKV_FLUSH_KB")? {
            cfg.memtable_flush_bytes = kb.saturating_mul(1024);
        }
        if let Some(raw) = lookup("LSMKV_FSYNC") {
            cfg.fsync_policy = match raw.trim() {
                "always" => FsyncPolicy::Always,
                ms => FsyncPolicy::Interval(Duration::from_millis(parse_raw("LSMKV_FSYNC", ms)?)),
            };
        }
        if let Some(every) = parse_var(&lookup, "LSMKV_SPARSE_EVERY")? {
            cfg.sparse_index_every = every;
        }
        if let Some(fan_in) = parse_var(&lookup, "LSMKV_FAN_IN")? {
            cfg.compaction_fan_in = fan_in;
        }
        if let Some(cap) = parse_var(&lookup, "LSMKV_QUEUE_CAPACITY")? {
            cfg.write_queue_capacity = cap;
        }
        if let Some(max) = parse_var(&lookup, "LSMKV_MAX_FROZEN")? {
            cfg.max_frozen_memtables = max;
        }
        if let Some(raw) = lookup("LSMKV_BACKPRESSURE") {
            cfg.backpressure = match raw.trim() {
                "fail-fast" => BackpressurePolicy::FailFast,
                "block" => BackpressurePolicy::Block,
                ms => BackpressurePolicy::BlockFor(Duration::from_millis(parse_raw(
                    "LSMKV_BACKPRESSURE",
                    ms,
                )?)),
            };
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&'static str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) => parse_raw(var, raw.trim()).map(Some),
        None => Ok(None),
    }
}

fn parse_raw<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: raw.to_string(),
    })
}

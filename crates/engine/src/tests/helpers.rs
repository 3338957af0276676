use crate::*;
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Small, strict configuration: every append is synced and background
/// compaction never fires unless a test lowers the fan-in.
pub fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig::new(dir)
        .fsync_policy(FsyncPolicy::Always)
        .sparse_index_every(4)
        .compaction_fan_in(64)
}

pub fn open(dir: &Path) -> Result<StorageEngine> {
    Ok(StorageEngine::open(test_config(dir))?)
}

pub fn count_sst_files(dir: &Path) -> usize {
    count_files(dir, |name| name.ends_with(".sst"))
}

pub fn count_rotated_wals(dir: &Path) -> usize {
    count_files(dir, |name| name.starts_with("wal-") && name.ends_with(".log"))
}

fn count_files(dir: &Path, pred: impl Fn(&str) -> bool) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_str().map(&pred).unwrap_or(false))
        .count()
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Every live on-disk entry for `key`, across all segments.
pub fn on_disk_copies(engine: &StorageEngine, key: &[u8]) -> usize {
    engine
        .inner
        .segments
        .load()
        .iter()
        .map(|live| {
            live.segment
                .iter()
                .filter_map(|r| r.ok())
                .filter(|(k, _)| k.as_slice() == key)
                .count()
        })
        .sum()
}

/// A sink that records what it receives and serves reads from a map.
#[derive(Default)]
pub struct RecordingSink {
    pub batches: Mutex<Vec<Vec<Mutation>>>,
    pub remote: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    pub fail: AtomicBool,
}

impl RecordingSink {
    pub fn mutations(&self) -> Vec<Mutation> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

impl ReplicationSink for RecordingSink {
    fn replicate(&self, batch: &[Mutation]) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("replica unreachable");
        }
        self.batches.lock().push(batch.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("replica unreachable");
        }
        Ok(self.remote.lock().get(key).cloned())
    }
}

//! Cold-start path: rebuilds the engine state from the data directory.
//!
//! 1. Create the data directory if needed and delete leftover `*.tmp` files.
//! 2. Load the manifest and open exactly the segments it lists.
//! 3. Delete `seg-*.sst` files the manifest does not list.
//! 4. Replay rotated WALs (oldest first), then `wal.log`, into a fresh
//!    memtable. Records at or below the manifest's `flushed_seq` are
//!    skipped, and a rotated WAL holding nothing newer is deleted.
//! 5. Resume numbering after the highest of the manifest's `last_seq`, the
//!    segments' max sequence and the replayed records.
//!
//! A torn or corrupt WAL tail ends replay of that file; the file is cut back
//! to its valid prefix so later appends stay readable.

use anyhow::{bail, Context, Result};
use config::EngineConfig;
use memtable::Memtable;
use sstable::{parse_segment_file_name, segment_file_name, Segment};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use wal::{WalError, WalReader, WalRecord};

use crate::manifest::Manifest;
use crate::segments::{LiveSegment, SegmentSet};
use crate::WAL_FILENAME;

/// Everything `start()` needs to bring an engine up.
pub(crate) struct Recovered {
    pub memtable: Memtable,
    pub last_seq: u64,
    pub manifest: Manifest,
    pub segments: SegmentSet,
    /// Rotated WALs whose records now live in `memtable`.
    pub rotated_wals: Vec<PathBuf>,
}

#[derive(Debug, Default)]
struct ReplayStats {
    applied: usize,
    skipped: usize,
    max_seq: u64,
}

pub(crate) fn recover(config: &EngineConfig) -> Result<Recovered> {
    let dir = config.data_dir.as_path();
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create data directory {}", dir.display()))?;
    remove_tmp_files(dir);

    let manifest = Manifest::load_or_create(dir)?;
    let segments = open_segments(dir, &manifest)?;
    remove_orphan_segments(dir, &manifest)?;

    let flushed_seq = manifest.flushed_seq().max(segments.max_seq());
    let memtable = Memtable::new();
    let mut stats = ReplayStats::default();

    let mut rotated_wals = Vec::new();
    for path in rotated_wal_paths(dir)? {
        let applied_before = stats.applied;
        replay_wal(&path, &memtable, flushed_seq, &mut stats)?;
        if stats.applied == applied_before {
            // Already flushed; removing the log after that flush failed or
            // was interrupted.
            remove_file_logged(&path, "stale WAL");
        } else {
            rotated_wals.push(path);
        }
    }
    replay_wal(&dir.join(WAL_FILENAME), &memtable, flushed_seq, &mut stats)?;

    let last_seq = manifest.last_seq().max(flushed_seq).max(stats.max_seq);
    info!(
        dir = %dir.display(),
        segments = segments.len(),
        replayed = stats.applied,
        skipped = stats.skipped,
        rotated_wals = rotated_wals.len(),
        flushed_seq,
        last_seq,
        next_gen = manifest.next_gen(),
        "recovery complete"
    );

    Ok(Recovered {
        memtable,
        last_seq,
        manifest,
        segments,
        rotated_wals,
    })
}

fn open_segments(dir: &Path, manifest: &Manifest) -> Result<SegmentSet> {
    let mut live = Vec::with_capacity(manifest.entries().len());
    for meta in manifest.entries() {
        let name = segment_file_name(meta.generation);
        let path = dir.join(&name);
        if !path.exists() {
            bail!("segment {name} is listed in the manifest but missing");
        }
        let segment =
            Segment::open(&path).with_context(|| format!("failed to open segment {name}"))?;
        debug!(
            generation = meta.generation,
            tier = meta.tier,
            entries = segment.len(),
            "opened segment"
        );
        live.push(LiveSegment {
            tier: meta.tier,
            run: meta.run,
            segment: Arc::new(segment),
        });
    }
    Ok(SegmentSet::new(live))
}

fn remove_tmp_files(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_tmp = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".tmp"));
        if is_tmp {
            remove_file_logged(&path, "leftover tmp file");
        }
    }
}

fn remove_orphan_segments(dir: &Path, manifest: &Manifest) -> Result<()> {
    let entries = fs::read_dir(dir).context("failed to list data directory")?;
    for entry in entries {
        let path = entry.context("failed to list data directory")?.path();
        let Some(generation) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_segment_file_name)
        else {
            continue;
        };
        if !manifest.contains(generation) {
            remove_file_logged(&path, "orphan segment");
        }
    }
    Ok(())
}

/// Name of a WAL rotated away once its memtable was frozen at `seq`.
pub(crate) fn rotated_wal_name(seq: u64) -> String {
    format!("wal-{seq:020}.log")
}

fn parse_rotated_wal_name(name: &str) -> Option<u64> {
    let digits = name.strip_prefix("wal-")?.strip_suffix(".log")?;
    if digits.len() != 20 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Rotated WALs, oldest first.
fn rotated_wal_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir).context("failed to list data directory")? {
        let path = entry.context("failed to list data directory")?.path();
        if let Some(seq) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_rotated_wal_name)
        {
            found.push((seq, path));
        }
    }
    found.sort_by_key(|(seq, _)| *seq);
    Ok(found.into_iter().map(|(_, p)| p).collect())
}

/// Replays one WAL into `mem`, skipping records at or below `flushed_seq`.
///
/// A missing file is an empty log.
fn replay_wal(
    path: &Path,
    mem: &Memtable,
    flushed_seq: u64,
    stats: &mut ReplayStats,
) -> Result<()> {
    let reader = match WalReader::open(path) {
        Ok(r) => r,
        Err(WalError::Io(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            let context = format!("failed to open {}", path.display());
            return Err(anyhow::Error::new(e).context(context));
        }
    };

    let mut records = reader.records();
    for record in records.by_ref() {
        let seq = record.seq();
        if seq <= flushed_seq {
            stats.skipped += 1;
            continue;
        }
        let applied = match record {
            WalRecord::Put { seq, key, value } => mem.put(key, value, seq),
            WalRecord::Delete { seq, key } => mem.delete(key, seq),
        };
        applied.context("failed to apply replayed record")?;
        stats.applied += 1;
        stats.max_seq = stats.max_seq.max(seq);
    }

    if let Some(reason) = records.stopped_early() {
        let valid_len = records.valid_len();
        warn!(
            file = %path.display(),
            ?reason,
            valid_len,
            "incomplete write on last shutdown, truncating WAL"
        );
        OpenOptions::new()
            .write(true)
            .open(path)
            .and_then(|f| f.set_len(valid_len).and_then(|()| f.sync_all()))
            .with_context(|| format!("failed to truncate {}", path.display()))?;
    }
    Ok(())
}

fn remove_file_logged(path: &Path, what: &str) {
    match fs::remove_file(path) {
        Ok(()) => info!(file = %path.display(), "removed {what}"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(file = %path.display(), error = %e, "failed to remove {what}"),
    }
}

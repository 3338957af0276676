//! # Manifest - live segment set metadata
//!
//! Records which segment files are live, the tier each one belongs to, the
//! next generation number and two sequence watermarks, so that recovery can
//! rebuild the exact segment set from the data directory alone.
//!
//! ## File Format
//!
//! A small text file, one directive per line:
//!
//! ```text
//! # lsmkv segment manifest
//! next_gen 12
//! last_seq 5210
//! flushed_seq 5187
//! T0:seg-00000000000000000011.sst
//! T0:seg-00000000000000000010.sst
//! T1:seg-00000000000000000009.sst
//! T2:seg-00000000000000000006.sst@5
//! T2:seg-00000000000000000005.sst
//! ```
//!
//! A compaction whose output was split across several files writes one
//! sorted run; every file after the first records the run's first
//! generation after an `@`. Lines starting with `#` are comments. Empty
//! lines are ignored.
//!
//! `flushed_seq` is the highest sequence number whose record is in a segment
//! or was merged away; WAL records at or below it are never replayed.
//! `last_seq` is the highest sequence number handed out when the manifest was
//! last saved, so numbering never restarts below it even once compaction has
//! dropped every record that carried it. Both default to 0.
//!
//! ## Crash Safety
//!
//! The manifest is rewritten atomically: write to `MANIFEST.tmp`, fsync,
//! rename over `MANIFEST`, fsync the directory. A segment file that exists
//! on disk but is not listed is an orphan of an interrupted flush or
//! compaction and is removed during recovery.

use anyhow::{bail, Context, Result};
use sstable::{parse_segment_file_name, segment_file_name};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Name of the manifest file within the data directory.
pub const MANIFEST_FILENAME: &str = "MANIFEST";

/// Temporary file used during atomic manifest writes.
pub(crate) const MANIFEST_TMP_FILENAME: &str = "MANIFEST.tmp";

/// Tier assignment of one live segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentMeta {
    pub generation: u64,
    pub tier: u32,
    /// First generation of the sorted run this segment belongs to.
    pub run: u64,
}

impl SegmentMeta {
    /// A segment forming a run on its own.
    pub fn single(generation: u64, tier: u32) -> Self {
        Self {
            generation,
            tier,
            run: generation,
        }
    }
}

/// In-memory copy of the manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
    next_gen: u64,
    last_seq: u64,
    flushed_seq: u64,
    entries: Vec<SegmentMeta>,
}

impl Manifest {
    /// An empty manifest for `dir`, not yet written.
    pub fn empty(dir: &Path) -> Self {
        Self {
            path: dir.join(MANIFEST_FILENAME),
            next_gen: 1,
            last_seq: 0,
            flushed_seq: 0,
            entries: Vec::new(),
        }
    }

    /// Loads `dir/MANIFEST`, or returns an empty manifest if there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest exists but cannot be parsed.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let mut manifest = Self::empty(dir);
        if !manifest.path.exists() {
            return Ok(manifest);
        }

        let file = File::open(&manifest.path).context("failed to open manifest")?;
        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line =
                line.with_context(|| format!("failed to read manifest line {}", line_num + 1))?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            if let Some(n) = trimmed.strip_prefix("next_gen ") {
                manifest.next_gen = n
                    .trim()
                    .parse()
                    .with_context(|| format!("manifest line {}: bad next_gen", line_num + 1))?;
                continue;
            }
            if let Some(n) = trimmed.strip_prefix("last_seq ") {
                manifest.last_seq = n
                    .trim()
                    .parse()
                    .with_context(|| format!("manifest line {}: bad last_seq", line_num + 1))?;
                continue;
            }
            if let Some(n) = trimmed.strip_prefix("flushed_seq ") {
                manifest.flushed_seq = n
                    .trim()
                    .parse()
                    .with_context(|| format!("manifest line {}: bad flushed_seq", line_num + 1))?;
                continue;
            }

            // Expected format: "T<tier>:<filename>[@<run>]"
            let Some((tier_str, rest)) = trimmed.split_once(':') else {
                bail!(
                    "manifest line {}: invalid format (expected 'T<n>:<filename>'): {}",
                    line_num + 1,
                    trimmed
                );
            };
            let (filename, run) = match rest.split_once('@') {
                Some((f, run)) => (f, Some(run)),
                None => (rest, None),
            };
            let tier = tier_str
                .strip_prefix('T')
                .and_then(|t| t.parse().ok())
                .with_context(|| {
                    format!("manifest line {}: unknown tier '{}'", line_num + 1, tier_str)
                })?;
            let generation = parse_segment_file_name(filename).with_context(|| {
                format!("manifest line {}: not a segment file '{}'", line_num + 1, filename)
            })?;
            let run = match run {
                Some(r) => r
                    .parse()
                    .with_context(|| format!("manifest line {}: bad run '{}'", line_num + 1, r))?,
                None => generation,
            };
            if manifest.contains(generation) {
                bail!("manifest line {}: duplicate segment {}", line_num + 1, generation);
            }
            manifest.entries.push(SegmentMeta { generation, tier, run });
        }

        let max_gen = manifest.entries.iter().map(|e| e.generation).max().unwrap_or(0);
        manifest.ensure_next_gen(max_gen + 1);
        manifest.last_seq = manifest.last_seq.max(manifest.flushed_seq);
        Ok(manifest)
    }

    /// Persists the manifest atomically.
    pub fn save(&self) -> Result<()> {
        let tmp_path = self.path.with_file_name(MANIFEST_TMP_FILENAME);
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .context("failed to create manifest tmp")?;
            self.write_contents(&mut f)?;
            f.flush()?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path).context("failed to install manifest")?;
        if let Some(dir) = self.path.parent() {
            File::open(dir)?.sync_all()?;
        }
        Ok(())
    }

    fn write_contents(&self, f: &mut File) -> Result<()> {
        writeln!(f, "# lsmkv segment manifest")?;
        writeln!(f, "next_gen {}", self.next_gen)?;
        writeln!(f, "last_seq {}", self.last_seq)?;
        writeln!(f, "flushed_seq {}", self.flushed_seq)?;
        for entry in &self.entries {
            write!(f, "T{}:{}", entry.tier, segment_file_name(entry.generation))?;
            if entry.run != entry.generation {
                write!(f, "@{}", entry.run)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }

    pub fn entries(&self) -> &[SegmentMeta] {
        &self.entries
    }

    pub fn contains(&self, generation: u64) -> bool {
        self.entries.iter().any(|e| e.generation == generation)
    }

    pub fn next_gen(&self) -> u64 {
        self.next_gen
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn flushed_seq(&self) -> u64 {
        self.flushed_seq
    }

    /// Raises both sequence watermarks (persisted with the next save).
    /// Neither ever moves backwards.
    pub fn record_seqs(&mut self, flushed_seq: u64, last_seq: u64) {
        self.flushed_seq = self.flushed_seq.max(flushed_seq);
        self.last_seq = self.last_seq.max(last_seq).max(self.flushed_seq);
    }

    /// Raises the generation counter to at least `min`.
    pub fn ensure_next_gen(&mut self, min: u64) {
        self.next_gen = self.next_gen.max(min);
    }

    /// Hands out a fresh generation number (persisted with the next save).
    pub fn allocate_generation(&mut self) -> u64 {
        let generation = self.next_gen;
        self.next_gen += 1;
        generation
    }

    /// Adds a live segment (does **not** save to disk).
    pub fn add(&mut self, meta: SegmentMeta) {
        self.entries.push(meta);
    }

    /// Swaps compaction inputs for outputs (does **not** save to disk).
    pub fn replace(&mut self, removed: &[u64], added: &[SegmentMeta]) {
        self.entries.retain(|e| !removed.contains(&e.generation));
        self.entries.extend_from_slice(added);
    }
}

use anyhow::{bail, Context, Result};
use memtable::ValueEntry;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::format::{encode_index_entry, encode_record, segment_file_name, Footer};
use crate::Segment;

/// Streams sorted entries into a new, immutable segment file.
///
/// Writing is append-only and single-pass. Every `sparse_every`-th record
/// (the first one included) gets a sparse index entry pointing at its byte
/// offset. The file is written as `seg-<gen>.sst.tmp` and only renamed to its
/// final name by [`finish`](SegmentWriter::finish), after an fsync, so a
/// crash mid-build never leaves a half-written segment under a live name.
/// An unfinished writer removes its temp file when dropped.
pub struct SegmentWriter {
    generation: u64,
    final_path: PathBuf,
    tmp_path: PathBuf,
    file: Option<BufWriter<File>>,
    sparse_every: usize,
    index: Vec<(Vec<u8>, u64)>,
    last_key: Option<Vec<u8>>,
    entry_count: u64,
    max_seq: u64,
    offset: u64,
    /// Reusable buffer for encoding one record.
    record_buf: Vec<u8>,
}

impl SegmentWriter {
    /// Starts a new segment of generation `generation` inside `dir`.
    pub fn create(dir: &Path, generation: u64, sparse_every: usize) -> Result<Self> {
        if sparse_every == 0 {
            bail!("sparse index interval must be positive");
        }
        let final_path = dir.join(segment_file_name(generation));
        let tmp_path = final_path.with_extension("sst.tmp");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("failed to create segment {generation}"))?;

        Ok(Self {
            generation,
            final_path,
            tmp_path,
            file: Some(BufWriter::new(file)),
            sparse_every,
            index: Vec::new(),
            last_key: None,
            entry_count: 0,
            max_seq: 0,
            offset: 0,
            record_buf: Vec::with_capacity(256),
        })
    }

    /// Appends one entry. Keys must arrive in strictly ascending order.
    pub fn add(&mut self, key: &[u8], entry: &ValueEntry) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                bail!("segment keys must be strictly ascending");
            }
        }
        let file = match self.file.as_mut() {
            Some(f) => f,
            None => bail!("segment writer already finished"),
        };

        if self.entry_count % self.sparse_every as u64 == 0 {
            self.index.push((key.to_vec(), self.offset));
        }

        self.record_buf.clear();
        encode_record(&mut self.record_buf, key, entry)?;
        file.write_all(&self.record_buf)?;

        self.offset += self.record_buf.len() as u64;
        self.entry_count += 1;
        self.max_seq = self.max_seq.max(entry.seq);
        self.last_key = Some(key.to_vec());
        Ok(())
    }

    /// Bytes of data written so far (index and footer not included).
    #[must_use]
    pub fn data_size(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Writes the sparse index and footer, syncs, atomically renames the file
    /// into place and opens it.
    ///
    /// # Errors
    ///
    /// Refuses to finish an empty segment; fails on any I/O error (the temp
    /// file is removed either way).
    pub fn finish(mut self) -> Result<Segment> {
        if self.entry_count == 0 {
            bail!("refusing to write an empty segment");
        }
        let mut file = match self.file.take() {
            Some(f) => f,
            None => bail!("segment writer already finished"),
        };

        let index_offset = self.offset;
        for (key, offset) in &self.index {
            encode_index_entry(&mut file, key, *offset)?;
        }
        Footer {
            max_seq: self.max_seq,
            entry_count: self.entry_count,
            index_offset,
            sparse_every: self.sparse_every as u32,
        }
        .write_to(&mut file)?;

        file.flush()?;
        file.into_inner()
            .map_err(|e| e.into_error())?
            .sync_all()?;

        fs::rename(&self.tmp_path, &self.final_path)?;
        sync_parent_dir(&self.final_path);

        Segment::open(&self.final_path)
    }

    /// Convenience: builds a complete segment from an ascending iterator.
    pub fn build<I>(dir: &Path, generation: u64, sparse_every: usize, entries: I) -> Result<Segment>
    where
        I: IntoIterator<Item = (Vec<u8>, ValueEntry)>,
    {
        let mut writer = Self::create(dir, generation, sparse_every)?;
        for (key, entry) in entries {
            writer.add(&key, &entry)?;
        }
        writer.finish()
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        // After a successful finish the temp file no longer exists.
        let _ = fs::remove_file(&self.tmp_path);
    }
}

/// Fsyncs the directory holding `path` so a rename survives a crash.
pub(crate) fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

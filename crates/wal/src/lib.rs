//! # WAL - Write-Ahead Log
//!
//! Provides crash-safe durability for the storage engine.
//!
//! Every mutation (`Put` or `Delete`) is serialized into a binary record and
//! appended to the WAL **before** the corresponding memtable update. On
//! restart the WAL is replayed to reconstruct the memtable, so no
//! acknowledged write is lost (within the limits of the [`FsyncPolicy`]).
//!
//! ## Binary Record Format
//!
//! ```text
//! [record_len: u32 LE][crc32: u32 LE][body ...]
//! ```
//!
//! Body: `[seq: u64][type: u8][key_len: u32][val_len: u32][key][value]`
//!
//! `type` is `0` for a put and `1` for a delete (which carries `val_len = 0`).
//! `record_len` includes the 4-byte CRC but **not** itself.
//!
//! ## Example
//!
//! ```rust,no_run
//! use config::FsyncPolicy;
//! use wal::{WalWriter, WalReader, WalRecord};
//!
//! let mut w = WalWriter::open("wal.log", FsyncPolicy::Always).unwrap();
//! w.append(&WalRecord::Put {
//!     seq: 1,
//!     key: b"hello".to_vec(),
//!     value: b"world".to_vec(),
//! }).unwrap();
//! w.close().unwrap();
//!
//! let reader = WalReader::open("wal.log").unwrap();
//! for rec in reader.records() {
//!     println!("{:?}", rec);
//! }
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::time::Instant;

pub use config::FsyncPolicy;
use thiserror::Error;
use tracing::warn;

const OP_PUT: u8 = 0;
const OP_DELETE: u8 = 1;

/// Frame header: `record_len` + `crc32`.
const HEADER_BYTES: usize = 8;
/// Fixed part of the body: seq + type + key_len + val_len.
const BODY_FIXED_BYTES: usize = 8 + 1 + 4 + 4;
/// Upper bound for a single record; anything larger is treated as garbage.
const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

/// A single WAL record representing either a key-value insertion or a deletion.
///
/// Each record carries the monotonically increasing **sequence number** that
/// the engine assigned to the mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// A key-value insertion.
    Put {
        /// Sequence number assigned by the engine.
        seq: u64,
        /// The lookup key.
        key: Vec<u8>,
        /// The payload value.
        value: Vec<u8>,
    },
    /// A key deletion (tombstone).
    Delete {
        /// Sequence number assigned by the engine.
        seq: u64,
        /// The key to delete.
        key: Vec<u8>,
    },
}

impl WalRecord {
    /// Returns the sequence number of this record.
    #[must_use]
    pub fn seq(&self) -> u64 {
        match self {
            WalRecord::Put { seq, .. } | WalRecord::Delete { seq, .. } => *seq,
        }
    }

    /// Returns the key this record mutates.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        match self {
            WalRecord::Put { key, .. } | WalRecord::Delete { key, .. } => key,
        }
    }

    /// Serializes the record, frame header included, into `buf`.
    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), WalError> {
        buf.clear();
        // Frame header is filled in once the body is known.
        buf.extend_from_slice(&[0u8; HEADER_BYTES]);

        let (op, seq, key, value): (u8, u64, &[u8], &[u8]) = match self {
            WalRecord::Put { seq, key, value } => (OP_PUT, *seq, key.as_slice(), value.as_slice()),
            WalRecord::Delete { seq, key } => (OP_DELETE, *seq, key.as_slice(), &[]),
        };
        buf.write_u64::<LittleEndian>(seq)?;
        buf.write_u8(op)?;
        buf.write_u32::<LittleEndian>(len_u32(key.len())?)?;
        buf.write_u32::<LittleEndian>(len_u32(value.len())?)?;
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);

        let body = &buf[HEADER_BYTES..];
        let record_len = body.len() as u64 + 4;
        if record_len > u64::from(MAX_RECORD_SIZE) {
            return Err(WalError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "WAL record too large",
            )));
        }
        let mut hasher = Crc32::new();
        hasher.update(body);
        let crc = hasher.finalize();

        buf[0..4].copy_from_slice(&(record_len as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&crc.to_le_bytes());
        Ok(())
    }

    /// Parses a CRC-verified body. `None` means the body is malformed.
    fn decode_body(body: &[u8]) -> Option<WalRecord> {
        if body.len() < BODY_FIXED_BYTES {
            return None;
        }
        let mut br = body;
        let seq = br.read_u64::<LittleEndian>().ok()?;
        let op = br.read_u8().ok()?;
        let key_len = br.read_u32::<LittleEndian>().ok()? as usize;
        let val_len = br.read_u32::<LittleEndian>().ok()? as usize;
        if key_len.checked_add(val_len)? != br.len() {
            return None;
        }
        let (key, value) = br.split_at(key_len);
        match op {
            OP_PUT => Some(WalRecord::Put {
                seq,
                key: key.to_vec(),
                value: value.to_vec(),
            }),
            OP_DELETE if val_len == 0 => Some(WalRecord::Delete {
                seq,
                key: key.to_vec(),
            }),
            _ => None,
        }
    }
}

fn len_u32(len: usize) -> Result<u32, WalError> {
    u32::try_from(len).map_err(|_| {
        WalError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "WAL field exceeds u32::MAX bytes",
        ))
    })
}

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A record failed CRC validation or contained an unknown type.
    #[error("corrupt record")]
    Corrupt,

    /// The writer was closed; no further appends are accepted.
    #[error("wal is closed")]
    Closed,
}

/// Append-only WAL writer.
///
/// Records are serialized into a reusable buffer, CRC-checksummed, and then
/// handed to the OS in a single `write_all` call. When the data reaches the
/// disk is decided by the [`FsyncPolicy`]:
///
/// - [`FsyncPolicy::Always`]: every append is followed by `sync_data()`.
/// - [`FsyncPolicy::Interval`]: appends sync only once the interval since the
///   previous sync has elapsed; an idle owner calls
///   [`sync_if_due`](WalWriter::sync_if_due) so the last writes of a burst
///   are not left unsynced.
pub struct WalWriter {
    file: Option<File>,
    policy: FsyncPolicy,
    /// Reusable scratch buffer to avoid allocation on every append.
    buf: Vec<u8>,
    last_sync: Instant,
    dirty: bool,
    /// Length of the committed prefix; a failed append is cut back to it.
    len: u64,
    #[cfg(test)]
    fail_next_sync: bool,
}

impl WalWriter {
    /// Opens (or creates) a WAL file positioned for append.
    ///
    /// # Errors
    ///
    /// Returns `WalError::Io` if the path is inaccessible.
    pub fn open<P: AsRef<Path>>(path: P, policy: FsyncPolicy) -> Result<Self, WalError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Some(file),
            policy,
            buf: Vec::with_capacity(256),
            last_sync: Instant::now(),
            dirty: false,
            len,
            #[cfg(test)]
            fail_next_sync: false,
        })
    }

    /// Serializes `record` and appends it to the WAL file.
    ///
    /// Returns once the bytes are handed to the OS (and, under
    /// [`FsyncPolicy::Always`], once they are synced). A failed append leaves
    /// previously committed records untouched.
    ///
    /// If the sync that follows the write fails, the frame is cut off again
    /// so an unacknowledged record never resurfaces on replay. Should the cut
    /// itself fail, [`len`](WalWriter::len) keeps counting the frame and the
    /// caller must treat its sequence number as consumed.
    pub fn append(&mut self, record: &WalRecord) -> Result<(), WalError> {
        let file = self.file.as_mut().ok_or(WalError::Closed)?;
        record.encode_into(&mut self.buf)?;
        if let Err(e) = file.write_all(&self.buf) {
            // Drop the torn frame so later appends stay readable.
            let _ = file.set_len(self.len);
            return Err(e.into());
        }
        let committed = self.len;
        let was_dirty = self.dirty;
        self.len += self.buf.len() as u64;
        self.dirty = true;

        let due = match self.policy {
            FsyncPolicy::Always => true,
            FsyncPolicy::Interval(every) => self.last_sync.elapsed() >= every,
        };
        if due {
            if let Err(e) = self.sync() {
                self.rewind(committed, was_dirty);
                return Err(e);
            }
        }
        Ok(())
    }

    fn rewind(&mut self, committed: u64, was_dirty: bool) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if file.set_len(committed).is_ok() {
            self.len = committed;
            self.dirty = was_dirty;
        }
    }

    /// Forces all written data to stable storage.
    pub fn sync(&mut self) -> Result<(), WalError> {
        let file = self.file.as_mut().ok_or(WalError::Closed)?;
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_sync) {
            return Err(io::Error::other("injected sync failure").into());
        }
        file.flush()?;
        file.sync_data()?;
        self.dirty = false;
        self.last_sync = Instant::now();
        Ok(())
    }

    /// Group-commit tick: syncs if there are unsynced appends and the
    /// interval has elapsed. Returns whether a sync happened.
    pub fn sync_if_due(&mut self) -> Result<bool, WalError> {
        if !self.dirty || self.file.is_none() {
            return Ok(false);
        }
        let due = match self.policy {
            FsyncPolicy::Always => true,
            FsyncPolicy::Interval(every) => self.last_sync.elapsed() >= every,
        };
        if due {
            self.sync()?;
        }
        Ok(due)
    }

    /// Byte length of the log as seen by this writer.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` if the log holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` if appends happened since the last sync.
    #[must_use]
    pub fn has_unsynced(&self) -> bool {
        self.dirty
    }

    /// Flushes and releases the file handle. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<(), WalError> {
        if self.file.is_some() {
            let result = self.sync();
            self.file = None;
            result?;
        }
        Ok(())
    }

    /// Returns `true` once [`close`](WalWriter::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "WAL close on drop failed");
        }
    }
}

/// Sequential WAL reader.
///
/// The reader is generic over any `Read` implementor, allowing it to be used
/// with real files (`WalReader<File>`) or in-memory buffers for testing.
///
/// Replay is exposed as a lazy iterator ([`records`](WalReader::records))
/// that yields records in file order and stops at the first record that is
/// truncated, fails its CRC, or does not parse. Everything before that point
/// is the valid prefix of the log; [`WalRecords::valid_len`] reports its size
/// so the caller can cut the file there.
pub struct WalReader<R: Read> {
    rdr: BufReader<R>,
}

impl WalReader<File> {
    /// Opens an existing WAL file for sequential replay.
    ///
    /// Returns `WalError::Io` if the file cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<WalReader<File>, WalError> {
        let f = File::open(path)?;
        Ok(WalReader {
            rdr: BufReader::new(f),
        })
    }
}

impl<R: Read> WalReader<R> {
    /// Constructs a reader from any `Read` implementor.
    pub fn from_reader(reader: R) -> Self {
        WalReader {
            rdr: BufReader::new(reader),
        }
    }

    /// Consumes the reader and returns the replay iterator.
    pub fn records(self) -> WalRecords<R> {
        WalRecords {
            rdr: self.rdr,
            body: Vec::with_capacity(256),
            valid_len: 0,
            stop: None,
        }
    }
}

/// Why replay stopped before a clean end of file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayStop {
    /// The last frame was cut short (crash mid-append).
    Truncated,
    /// A complete frame failed validation.
    Corrupt,
    /// The underlying reader failed.
    Io(io::ErrorKind),
}

/// Lazy, finite, non-restartable iterator over the records of a WAL.
pub struct WalRecords<R: Read> {
    rdr: BufReader<R>,
    body: Vec<u8>,
    valid_len: u64,
    stop: Option<Option<ReplayStop>>,
}

impl<R: Read> WalRecords<R> {
    /// Byte length of the fully valid prefix consumed so far.
    #[must_use]
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    /// Returns why replay stopped early, or `None` for a clean end of file
    /// (or if iteration has not finished yet).
    #[must_use]
    pub fn stopped_early(&self) -> Option<&ReplayStop> {
        self.stop.as_ref().and_then(|s| s.as_ref())
    }

    fn finish(&mut self, reason: Option<ReplayStop>) -> Option<WalRecord> {
        self.stop = Some(reason);
        None
    }

    fn read_frame(&mut self) -> Result<Option<WalRecord>, ReplayStop> {
        let mut header = [0u8; 4];
        match read_full(&mut self.rdr, &mut header) {
            Ok(0) => return Ok(None),
            Ok(4) => {}
            Ok(_) => return Err(ReplayStop::Truncated),
            Err(e) => return Err(ReplayStop::Io(e.kind())),
        }
        let record_len = u32::from_le_bytes(header);

        // record_len includes CRC (4 bytes) but not itself
        if (record_len as usize) < 4 + BODY_FIXED_BYTES || record_len > MAX_RECORD_SIZE {
            return Err(ReplayStop::Corrupt);
        }

        let crc = read_or_truncated(self.rdr.read_u32::<LittleEndian>())?;

        let body_len = (record_len - 4) as usize;
        self.body.clear();
        self.body.resize(body_len, 0);
        read_or_truncated(self.rdr.read_exact(&mut self.body))?;

        let mut hasher = Crc32::new();
        hasher.update(&self.body);
        if hasher.finalize() != crc {
            return Err(ReplayStop::Corrupt);
        }

        let record = WalRecord::decode_body(&self.body).ok_or(ReplayStop::Corrupt)?;
        self.valid_len += HEADER_BYTES as u64 + body_len as u64;
        Ok(Some(record))
    }
}

/// Reads until `buf` is full or the reader is exhausted, returning the
/// number of bytes read. Lets the caller tell a clean EOF (0) from a torn
/// frame header (1..=3).
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_or_truncated<T>(res: io::Result<T>) -> Result<T, ReplayStop> {
    res.map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => ReplayStop::Truncated,
        kind => ReplayStop::Io(kind),
    })
}

impl<R: Read> Iterator for WalRecords<R> {
    type Item = WalRecord;

    fn next(&mut self) -> Option<WalRecord> {
        if self.stop.is_some() {
            return None;
        }
        match self.read_frame() {
            Ok(Some(rec)) => Some(rec),
            Ok(None) => self.finish(None),
            Err(reason) => self.finish(Some(reason)),
        }
    }
}

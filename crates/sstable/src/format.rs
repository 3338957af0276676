//! Segment binary format: record codec, footer, and file naming.
//!
//! ## Data record
//!
//! ```text
//! [crc32: u32][key_len: u32][key][seq: u64][kind: u8][val_len: u32][val]
//! ```
//!
//! `kind` is `1` for a live value and `0` for a tombstone (which carries
//! `val_len = 0`). The CRC32 covers everything after itself.
//!
//! ## Footer (32 bytes)
//!
//! ```text
//! [max_seq: u64][entry_count: u64][index_offset: u64][sparse_every: u32][magic: u32 = "SEG1"]
//! ```

use anyhow::{bail, ensure, Result};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use memtable::{Value, ValueEntry};
use std::io::{self, Write};

/// Magic number identifying segment files (ASCII "SEG1").
pub const SEGMENT_MAGIC: u32 = 0x5345_4731;

/// Size of the footer in bytes.
pub const FOOTER_BYTES: u64 = 8 + 8 + 8 + 4 + 4;

/// Fixed bytes of a data record around key and value.
pub(crate) const RECORD_FIXED_BYTES: usize = 4 + 4 + 8 + 1 + 4;

/// Maximum key size accepted while decoding. Prevents huge allocations on corrupt files.
pub(crate) const MAX_KEY_BYTES: usize = 64 * 1024;

const KIND_TOMBSTONE: u8 = 0;
const KIND_PUT: u8 = 1;

const FILE_PREFIX: &str = "seg-";
const FILE_SUFFIX: &str = ".sst";

/// Returns the file name of the segment with the given generation.
#[must_use]
pub fn segment_file_name(generation: u64) -> String {
    format!("{FILE_PREFIX}{generation:020}{FILE_SUFFIX}")
}

/// Extracts the generation from a segment file name, if it is one.
#[must_use]
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    name.strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?
        .parse()
        .ok()
}

/// Parsed segment footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub max_seq: u64,
    pub entry_count: u64,
    pub index_offset: u64,
    pub sparse_every: u32,
}

impl Footer {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.max_seq)?;
        w.write_u64::<LittleEndian>(self.entry_count)?;
        w.write_u64::<LittleEndian>(self.index_offset)?;
        w.write_u32::<LittleEndian>(self.sparse_every)?;
        w.write_u32::<LittleEndian>(SEGMENT_MAGIC)?;
        Ok(())
    }

    /// Reads the footer from the tail of a whole-file buffer.
    pub fn read_from(file: &[u8]) -> Result<Self> {
        ensure!(
            file.len() as u64 >= FOOTER_BYTES,
            "segment file too small for footer ({} bytes)",
            file.len()
        );
        let tail = &file[file.len() - FOOTER_BYTES as usize..];
        let magic = LittleEndian::read_u32(&tail[28..32]);
        if magic != SEGMENT_MAGIC {
            bail!("unknown segment magic: {:#x}", magic);
        }
        let footer = Footer {
            max_seq: LittleEndian::read_u64(&tail[0..8]),
            entry_count: LittleEndian::read_u64(&tail[8..16]),
            index_offset: LittleEndian::read_u64(&tail[16..24]),
            sparse_every: LittleEndian::read_u32(&tail[24..28]),
        };
        ensure!(
            footer.index_offset <= file.len() as u64 - FOOTER_BYTES,
            "invalid index_offset {}",
            footer.index_offset
        );
        ensure!(footer.sparse_every > 0, "sparse interval must be positive");
        Ok(footer)
    }
}

/// Appends one encoded data record (CRC prefix included) to `buf`.
pub(crate) fn encode_record(buf: &mut Vec<u8>, key: &[u8], entry: &ValueEntry) -> io::Result<()> {
    let start = buf.len();
    buf.extend_from_slice(&[0u8; 4]);
    buf.write_u32::<LittleEndian>(key.len() as u32)?;
    buf.extend_from_slice(key);
    buf.write_u64::<LittleEndian>(entry.seq)?;
    match &entry.value {
        Value::Put(v) => {
            buf.write_u8(KIND_PUT)?;
            buf.write_u32::<LittleEndian>(v.len() as u32)?;
            buf.extend_from_slice(v);
        }
        Value::Tombstone => {
            buf.write_u8(KIND_TOMBSTONE)?;
            buf.write_u32::<LittleEndian>(0)?;
        }
    }
    let mut hasher = Crc32::new();
    hasher.update(&buf[start + 4..]);
    let crc = hasher.finalize();
    buf[start..start + 4].copy_from_slice(&crc.to_le_bytes());
    Ok(())
}

/// A decoded record borrowing from the mapped file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordRef<'a> {
    pub key: &'a [u8],
    pub seq: u64,
    pub value: Option<&'a [u8]>,
    /// Offset of the record following this one.
    pub next: usize,
}

impl RecordRef<'_> {
    pub fn to_entry(self) -> ValueEntry {
        match self.value {
            Some(v) => ValueEntry::put(self.seq, v.to_vec()),
            None => ValueEntry::tombstone(self.seq),
        }
    }
}

/// Decodes and CRC-verifies the record starting at `offset` of the data
/// region `data`.
pub(crate) fn decode_record(data: &[u8], offset: usize) -> Result<RecordRef<'_>> {
    let rest = data
        .get(offset..)
        .filter(|r| r.len() >= RECORD_FIXED_BYTES)
        .ok_or_else(|| anyhow::anyhow!("truncated record at offset {offset}"))?;

    let stored_crc = LittleEndian::read_u32(&rest[0..4]);
    let key_len = LittleEndian::read_u32(&rest[4..8]) as usize;
    ensure!(
        key_len <= MAX_KEY_BYTES,
        "corrupt data: key_len {} exceeds maximum {}",
        key_len,
        MAX_KEY_BYTES
    );
    let key_end = 8 + key_len;
    ensure!(rest.len() >= key_end + 13, "truncated record at offset {offset}");
    let seq = LittleEndian::read_u64(&rest[key_end..key_end + 8]);
    let kind = rest[key_end + 8];
    let val_len = LittleEndian::read_u32(&rest[key_end + 9..key_end + 13]) as usize;
    let val_start = key_end + 13;
    let body_end = val_start
        .checked_add(val_len)
        .filter(|end| *end <= rest.len())
        .ok_or_else(|| anyhow::anyhow!("truncated value at offset {offset}"))?;

    let mut hasher = Crc32::new();
    hasher.update(&rest[4..body_end]);
    let actual_crc = hasher.finalize();
    if actual_crc != stored_crc {
        bail!(
            "CRC32 mismatch at offset {}: expected {:#010x}, got {:#010x} (data corruption)",
            offset,
            stored_crc,
            actual_crc
        );
    }

    let value = match kind {
        KIND_PUT => Some(&rest[val_start..body_end]),
        KIND_TOMBSTONE => None,
        other => bail!("unknown record kind {other} at offset {offset}"),
    };
    Ok(RecordRef {
        key: &rest[8..key_end],
        seq,
        value,
        next: offset + body_end,
    })
}

/// Encodes one sparse index entry: `[key_len: u32][key][offset: u64]`.
pub(crate) fn encode_index_entry<W: Write>(w: &mut W, key: &[u8], offset: u64) -> io::Result<()> {
    w.write_u32::<LittleEndian>(key.len() as u32)?;
    w.write_all(key)?;
    w.write_u64::<LittleEndian>(offset)?;
    Ok(())
}

/// Decodes the whole sparse index section.
pub(crate) fn decode_index(mut section: &[u8]) -> Result<Vec<(Vec<u8>, u64)>> {
    let mut index = Vec::new();
    while !section.is_empty() {
        ensure!(section.len() >= 4, "corrupt index: truncated key length");
        let key_len = LittleEndian::read_u32(&section[0..4]) as usize;
        ensure!(
            key_len <= MAX_KEY_BYTES,
            "corrupt index: key_len {} exceeds maximum {}",
            key_len,
            MAX_KEY_BYTES
        );
        ensure!(section.len() >= 4 + key_len + 8, "corrupt index: truncated entry");
        let key = section[4..4 + key_len].to_vec();
        let offset = LittleEndian::read_u64(&section[4 + key_len..12 + key_len]);
        index.push((key, offset));
        section = &section[12 + key_len..];
    }
    Ok(index)
}

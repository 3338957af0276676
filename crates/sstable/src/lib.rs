//! # Segments - immutable sorted tables
//!
//! On-disk storage files for the LSM engine.
//!
//! When a frozen [`memtable::Memtable`] is flushed, or several segments are
//! merged by compaction, the result is written as a new segment. Segments are
//! *write-once, read-many*: once renamed into place they are never modified,
//! only replaced wholesale and deleted after the last reader lets go.
//!
//! ## File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ DATA SECTION (records sorted by key, one per key)             │
//! │                                                               │
//! │ crc32 (u32) | key_len (u32) | key | seq (u64)                 │
//! │ kind (u8: 1=put, 0=tombstone) | val_len (u32) | val           │
//! │                                                               │
//! │ The CRC32 covers everything after itself in the record.       │
//! ├───────────────────────────────────────────────────────────────┤
//! │ SPARSE INDEX (every K-th record, the first always included)   │
//! │                                                               │
//! │ key_len (u32) | key | data_offset (u64)                       │
//! ├───────────────────────────────────────────────────────────────┤
//! │ FOOTER (always last 32 bytes)                                 │
//! │                                                               │
//! │ max_seq (u64) | entry_count (u64) | index_offset (u64)        │
//! │ sparse_every (u32) | magic (u32) "SEG1"                       │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. A lookup binary-searches the sparse index
//! for the block that may hold the key and scans at most `K` records.
//!
//! ## Components
//!
//! | Type              | Role                                                  |
//! |-------------------|-------------------------------------------------------|
//! | [`SegmentWriter`] | single-pass builder, tmp file + fsync + rename         |
//! | [`Segment`]       | memory-mapped reader: `get`, `range_scan`, `iter`      |
//! | [`MergeIterator`] | k-way merge, newest sequence number wins per key       |

mod format;
mod merge;
mod reader;
mod writer;

pub use format::{
    parse_segment_file_name, segment_file_name, Footer, FOOTER_BYTES, SEGMENT_MAGIC,
};
pub use merge::{EntrySource, MergeIterator};
pub use reader::{Segment, SegmentIter};
pub use writer::SegmentWriter;

#[cfg(test)]
mod tests;

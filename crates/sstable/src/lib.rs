//! # SSTable — Sorted String Table
//!
//! Immutable on-disk runs of key-ordered records. The engine flushes a full
//! memtable into one of these, and the compactor merges several of them back
//! into one.
//!
//! ## File layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │ DATA SECTION (records in ascending key order)          │
//! │                                                        │
//! │ key_len (u32) | key | tombstone (u8)                   │
//! │ val_len (u32) | val | seq (u64)                        │
//! │ ... one record per key ...                             │
//! ├────────────────────────────────────────────────────────┤
//! │ BLOOM SECTION (encoded membership filter)              │
//! ├────────────────────────────────────────────────────────┤
//! │ SPARSE INDEX (every N-th record, ascending key order)  │
//! │                                                        │
//! │ key_len (u32) | key | data_offset (u64)                │
//! ├────────────────────────────────────────────────────────┤
//! │ FOOTER                                                 │
//! │                                                        │
//! │ v2 (30 B): index_off | bloom_off | bloom_len           │
//! │            | magic (u32) | version (u16) = 2           │
//! │ v1 (14 B): index_off | magic (u32) | version (u16) = 1 │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian; the magic value is `0x4C53_4D31`. New
//! files are always written with the v2 footer; v1 files (no bloom section)
//! remain readable.
//!
//! The sparse index keeps one entry per [`DEFAULT_INDEX_STRIDE`] records, so
//! a point lookup binary-searches the index for a starting offset and scans
//! forward at most one stride's worth of records.

use std::io;

use thiserror::Error;

mod builder;
mod format;
mod reader;

pub use builder::TableBuilder;
pub use format::{filename, parse_filename, SSTABLE_MAGIC};
pub use reader::{Table, TableIter};

/// Sparse-index stride: one index entry per this many data records.
pub const DEFAULT_INDEX_STRIDE: usize = 16;

#[derive(Debug, Error)]
pub enum SSTableError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt sstable")]
    Corrupt,
}

//! # PTable - Persisted Index Table
//!
//! Immutable, on-disk, binary-searchable tables of [`IndexEntry`] records.
//!
//! A PTable is created once, by flushing a [`MemTable`](memtable::MemTable),
//! by merging several PTables or by scavenging one, and is never modified
//! afterwards. Tables are shared through `Arc<PTable>`; a table marked for
//! destruction deletes its files when the last reference is dropped, so a
//! reader holding an old index map can keep using it after a swap.
//!
//! ## File layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ HEADER (16 B)                                             │
//! │ magic "PTBL" | version | reserved | entry_count           │
//! ├──────────────────────────────────────────────────────────┤
//! │ ENTRIES (entry_count * entry_size, ascending)             │
//! │ stream | version | position                               │
//! ├──────────────────────────────────────────────────────────┤
//! │ MIDPOINTS (V4 only, midpoint_count * 24 B)                │
//! │ stream | version | item_index                             │
//! ├──────────────────────────────────────────────────────────┤
//! │ FOOTER                                                    │
//! │ V4: midpoint_count | version | reserved | magic | crc32   │
//! │ V1-V3: crc32                                              │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! See [`format`] for field widths per version.
//!
//! ## Modules
//!
//! | Module       | Purpose                                              |
//! |--------------|------------------------------------------------------|
//! | [`format`]   | Versions, codecs, midpoint sizing                    |
//! | `writer`     | Crash-safe table writer (temp file + rename)         |
//! | `reader`     | [`PTable`]: open, validate, midpoint-guided search   |
//! | `merge`      | k-way [`MergeIterator`] with newest-wins dedup       |
//! | `scavenge`   | Rewrite a table keeping approved entries             |

pub mod format;
mod merge;
mod reader;
mod scavenge;
mod writer;

pub use format::{
    depth_for, midpoint_index, required_midpoint_count, PTableVersion, MAX_DEPTH,
};
pub use memtable::{EntryKey, IndexEntry, SearchTable};
pub use merge::MergeIterator;
pub use reader::{Midpoint, PTable};
pub use scavenge::Scavenged;
pub use writer::{PTableWriter, PendingTable};

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Default midpoint depth.
pub const DEFAULT_DEPTH: u32 = 16;

/// Errors raised while building or opening a table.
#[derive(Debug, Error)]
pub enum PTableError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Checksum mismatch, truncated file or inconsistent sections.
    #[error("corrupt table {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("unsupported ptable version {version} in {}", .path.display())]
    UnsupportedVersion { path: PathBuf, version: u8 },

    #[error("entries not sorted: {prev:?} followed by {next:?}")]
    NotSorted { prev: IndexEntry, next: IndexEntry },

    #[error("event number {} of stream {:#x} does not fit a {format} table", .entry.version, .entry.stream)]
    VersionOutOfRange {
        entry: IndexEntry,
        format: PTableVersion,
    },

    #[error("table build aborted")]
    Aborted,

    #[error("scavenge predicate failed: {0}")]
    Predicate(String),
}

impl PTableError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PTableError>;

/// How tables are opened and written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PTableOptions {
    /// Minimum midpoint depth.
    pub depth: u32,
    /// Verify the file checksum on open.
    pub verify: bool,
    /// Write bloom sidecars and use them on lookups.
    pub use_bloom_filter: bool,
}

impl Default for PTableOptions {
    fn default() -> Self {
        Self {
            depth: DEFAULT_DEPTH,
            verify: true,
            use_bloom_filter: true,
        }
    }
}

#[cfg(test)]
mod tests;

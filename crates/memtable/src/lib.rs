//! # MemTable
//!
//! In-memory write buffer of the stream index, plus the record types and the
//! read capability shared with on-disk tables.
//!
//! ## Records
//!
//! An [`IndexEntry`] maps `(stream hash, event number)` to the byte offset of
//! the event in the transaction log. Entries are ordered by
//! `(stream, version, position)` ascending everywhere in the index.
//!
//! ## Concurrency
//!
//! A [`MemTable`] has exactly one writer and any number of readers. Entries
//! live in a lock-free skip list, so inserts never block lookups. Every
//! [`add_entries`](MemTable::add_entries) call is stamped with a batch number
//! that is published only after the whole batch is in the list; readers skip
//! entries from unpublished batches, which makes a batch visible all at once.
//!
//! ## Lifecycle
//!
//! ```text
//! new() ──add/add_entries──▶ full ──mark_for_conversion()──▶ frozen ──▶ flushed to a PTable
//! ```
//!
//! A frozen table still serves reads until the orchestrator swaps it out.
use crossbeam_skiplist::SkipMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use uuid::Uuid;

/// A single index record.
///
/// Field order matters: the derived `Ord` is the total order used by every
/// table, `(stream, version, position)` ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexEntry {
    /// Hash of the stream identifier.
    pub stream: u64,
    /// Event number within the stream.
    pub version: i64,
    /// Offset of the event record in the transaction log.
    pub position: i64,
}

impl IndexEntry {
    pub fn new(stream: u64, version: i64, position: i64) -> Self {
        Self {
            stream,
            version,
            position,
        }
    }

    #[must_use]
    pub fn key(&self) -> EntryKey {
        EntryKey {
            stream: self.stream,
            version: self.version,
        }
    }
}

/// The `(stream, version)` part of an entry, used for lookups and midpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryKey {
    pub stream: u64,
    pub version: i64,
}

impl EntryKey {
    pub fn new(stream: u64, version: i64) -> Self {
        Self { stream, version }
    }
}

/// Entries of `stream` with versions in `start..=end`, across all positions.
pub fn stream_range(stream: u64, start: i64, end: i64) -> RangeInclusive<IndexEntry> {
    IndexEntry::new(stream, start, i64::MIN)..=IndexEntry::new(stream, end, i64::MAX)
}

/// Read contract shared by the in-memory table and every on-disk format.
///
/// Lookups never fail: "not found" is `None` or an empty vector. Integrity
/// problems are detected when a table is opened, not while it is read.
pub trait SearchTable: Send + Sync {
    /// Unique table id.
    fn id(&self) -> Uuid;

    /// Number of entries in the table.
    fn count(&self) -> u64;

    /// Position of the exact `(stream, version)` match. When the same key
    /// was written more than once, the highest position wins.
    fn try_get_one_value(&self, stream: u64, version: i64) -> Option<i64>;

    /// Entry with the highest version for `stream`.
    fn try_get_latest_entry(&self, stream: u64) -> Option<IndexEntry>;

    /// Entry with the lowest version for `stream`.
    fn try_get_oldest_entry(&self, stream: u64) -> Option<IndexEntry>;

    /// First entry of `stream` whose version is strictly greater than `after`.
    fn try_get_next_entry(&self, stream: u64, after: i64) -> Option<IndexEntry>;

    /// Last entry of `stream` whose version is strictly lower than `before`.
    fn try_get_previous_entry(&self, stream: u64, before: i64) -> Option<IndexEntry>;

    /// Entries of `stream` with `start <= version <= end`, newest first,
    /// truncated to `limit` when given.
    fn get_range(&self, stream: u64, start: i64, end: i64, limit: Option<usize>)
        -> Vec<IndexEntry>;

    /// Every entry in ascending order.
    fn iterate_all_in_order(&self) -> Box<dyn Iterator<Item = IndexEntry> + '_>;
}

/// Mutable, append-optimized sorted buffer.
///
/// Entries are keys of a [`SkipMap`]; the value is the batch number the entry
/// was written in.
pub struct MemTable {
    id: Uuid,
    entries: SkipMap<IndexEntry, u64>,
    /// Highest batch number readers are allowed to see.
    visible_batch: AtomicU64,
    /// Last batch number handed out to the writer.
    next_batch: AtomicU64,
    converting: AtomicBool,
}

impl MemTable {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    /// Creates an empty table with a caller-chosen id. The id becomes the
    /// file name of the PTable this table is flushed to.
    pub fn with_id(id: Uuid) -> Self {
        Self {
            id,
            entries: SkipMap::new(),
            visible_batch: AtomicU64::new(0),
            next_batch: AtomicU64::new(0),
            converting: AtomicBool::new(false),
        }
    }

    /// Adds one entry, visible as soon as this call returns.
    ///
    /// # Panics
    ///
    /// Panics if the table is frozen or `version`/`position` is negative.
    pub fn add(&self, stream: u64, version: i64, position: i64) {
        self.add_entries(&[IndexEntry::new(stream, version, position)]);
    }

    /// Adds a batch. No reader observes part of a batch.
    ///
    /// # Panics
    ///
    /// Panics if the table is frozen or any entry has a negative version or
    /// position.
    pub fn add_entries(&self, batch: &[IndexEntry]) {
        assert!(
            !self.converting.load(Ordering::Acquire),
            "cannot add to a memtable marked for conversion"
        );
        if batch.is_empty() {
            return;
        }
        let batch_no = self.next_batch.fetch_add(1, Ordering::Relaxed) + 1;
        for e in batch {
            assert!(e.version >= 0, "version must be non-negative");
            assert!(e.position >= 0, "position must be non-negative");
            self.entries.get_or_insert(*e, batch_no);
        }
        self.visible_batch.store(batch_no, Ordering::Release);
    }

    /// Number of entries inserted so far, including a batch still being
    /// written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Freezes the table. Returns `true` only for the first caller.
    pub fn mark_for_conversion(&self) -> bool {
        !self.converting.swap(true, Ordering::AcqRel)
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.converting.load(Ordering::Acquire)
    }

    fn visible_range(
        &self,
        stream: u64,
        start: i64,
        end: i64,
    ) -> impl DoubleEndedIterator<Item = IndexEntry> + '_ {
        let visible = self.visible_batch.load(Ordering::Acquire);
        self.entries
            .range(stream_range(stream, start, end))
            .filter(move |e| *e.value() <= visible)
            .map(|e| *e.key())
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable")
            .field("id", &self.id)
            .field("entries", &self.entries.len())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

impl SearchTable for MemTable {
    fn id(&self) -> Uuid {
        self.id
    }

    fn count(&self) -> u64 {
        self.entries.len() as u64
    }

    fn try_get_one_value(&self, stream: u64, version: i64) -> Option<i64> {
        self.visible_range(stream, version, version)
            .next_back()
            .map(|e| e.position)
    }

    fn try_get_latest_entry(&self, stream: u64) -> Option<IndexEntry> {
        self.visible_range(stream, 0, i64::MAX).next_back()
    }

    fn try_get_oldest_entry(&self, stream: u64) -> Option<IndexEntry> {
        self.visible_range(stream, 0, i64::MAX).next()
    }

    fn try_get_next_entry(&self, stream: u64, after: i64) -> Option<IndexEntry> {
        if after == i64::MAX {
            return None;
        }
        self.visible_range(stream, after + 1, i64::MAX).next()
    }

    fn try_get_previous_entry(&self, stream: u64, before: i64) -> Option<IndexEntry> {
        if before <= 0 {
            return None;
        }
        self.visible_range(stream, 0, before - 1).next_back()
    }

    fn get_range(
        &self,
        stream: u64,
        start: i64,
        end: i64,
        limit: Option<usize>,
    ) -> Vec<IndexEntry> {
        if start > end {
            return Vec::new();
        }
        self.visible_range(stream, start, end)
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .collect()
    }

    fn iterate_all_in_order(&self) -> Box<dyn Iterator<Item = IndexEntry> + '_> {
        let visible = self.visible_batch.load(Ordering::Acquire);
        Box::new(
            self.entries
                .iter()
                .filter(move |e| *e.value() <= visible)
                .map(|e| *e.key()),
        )
    }
}

#[cfg(test)]
mod tests;

//! Merge iterator over several tables, and [`PTable::merge`].
//!
//! Produces entries in ascending order. When the same `(stream, version)`
//! key appears in several inputs, only the entries of the **newest** input
//! containing it are emitted (inputs are ordered newest first).

use memtable::{EntryKey, IndexEntry, SearchTable};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use tracing::info;

use crate::format::PTableVersion;
use crate::{PTable, PTableError, PTableOptions, PTableWriter, Result};

/// Entries checked between two looks at the abort flag.
const ABORT_CHECK_INTERVAL: u64 = 4096;

/// The current head of one input.
struct HeapEntry {
    entry: IndexEntry,
    /// Index into the inputs, 0 = newest.
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.entry == other.entry && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest entry comes
        // first, and on ties the newest source.
        other
            .entry
            .cmp(&self.entry)
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Lazy k-way merge over sorted inputs, newest input first.
pub struct MergeIterator<'a> {
    sources: Vec<Box<dyn Iterator<Item = IndexEntry> + 'a>>,
    heap: BinaryHeap<HeapEntry>,
    /// Key being emitted and the input that owns it.
    current: Option<(EntryKey, usize)>,
}

impl<'a> MergeIterator<'a> {
    /// Creates a merge over `tables`, where `tables[0]` is the newest.
    pub fn new<T: SearchTable + ?Sized>(tables: &[&'a T]) -> Self {
        Self::from_sources(
            tables
                .iter()
                .map(|t| {
                    let t: &'a T = *t;
                    t.iterate_all_in_order()
                })
                .collect(),
        )
    }

    /// Creates a merge over already sorted iterators, newest first.
    pub fn from_sources(mut sources: Vec<Box<dyn Iterator<Item = IndexEntry> + 'a>>) -> Self {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (source, it) in sources.iter_mut().enumerate() {
            if let Some(entry) = it.next() {
                heap.push(HeapEntry { entry, source });
            }
        }
        Self {
            sources,
            heap,
            current: None,
        }
    }

    fn advance(&mut self, source: usize) {
        if let Some(entry) = self.sources[source].next() {
            self.heap.push(HeapEntry { entry, source });
        }
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = IndexEntry;

    fn next(&mut self) -> Option<IndexEntry> {
        loop {
            let top = self.heap.pop()?;
            self.advance(top.source);

            let key = top.entry.key();
            let owner = match self.current {
                Some((k, owner)) if k == key => owner,
                _ => {
                    // Every input holding this key has its head on it now,
                    // since it is the smallest key left anywhere.
                    let owner = self
                        .heap
                        .iter()
                        .filter(|h| h.entry.key() == key)
                        .map(|h| h.source)
                        .fold(top.source, usize::min);
                    self.current = Some((key, owner));
                    owner
                }
            };
            if top.source == owner {
                return Some(top.entry);
            }
        }
    }
}

impl PTable {
    /// Merges `tables` (newest first) into a new table at `path`.
    ///
    /// The output is written as `version`, or as V1 when any input is V1
    /// (see [`PTableVersion::for_rewrite_of`]).
    ///
    /// The merge stops with [`PTableError::Aborted`] as soon as `abort` is
    /// set; the partial output is deleted and the inputs are untouched.
    pub fn merge(
        tables: &[Arc<PTable>],
        path: &Path,
        version: PTableVersion,
        opts: &PTableOptions,
        abort: &AtomicBool,
    ) -> Result<PTable> {
        let version = version.for_rewrite_of(tables.iter().map(|t| t.version()));
        let expected: u64 = tables.iter().map(|t| t.count()).sum();
        let refs: Vec<&PTable> = tables.iter().map(|t| t.as_ref()).collect();
        let mut merge = MergeIterator::new(&refs);

        let mut seen = 0u64;
        let entries = std::iter::from_fn(|| {
            if seen % ABORT_CHECK_INTERVAL == 0 && abort.load(AtomicOrdering::Acquire) {
                return Some(Err(PTableError::Aborted));
            }
            seen += 1;
            merge.next().map(Ok)
        });

        let table = PTableWriter::write_table(path, version, opts, expected as usize, entries)?;
        info!(
            inputs = tables.len(),
            input_entries = expected,
            output_entries = table.count(),
            path = %path.display(),
            "ptables merged"
        );
        Ok(table)
    }
}

/// Read path: point lookups and range scans.
///
/// Every read works on a snapshot: the active memtable, the frozen ones
/// (newest first), then the persisted tables newest to oldest. The awaiting
/// queue is taken before the map, so an entry moving from a memtable to a
/// PTable is seen in at least one of them.
///
/// Point lookups return the first match; oldest-entry lookups walk the
/// snapshot backwards. Range scans merge all sources.
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::{stream_hash, IndexEntry, IndexError, Result, TableIndex, TableKind};

impl TableIndex {
    fn snapshot(&self) -> Vec<TableKind> {
        let awaiting = self.shared.current_awaiting();
        let map = self.shared.current_map();

        let mut tables = Vec::with_capacity(1 + awaiting.frozen.len() + map.table_count());
        tables.push(TableKind::Memory(Arc::clone(&awaiting.active)));
        tables.extend(
            awaiting
                .frozen
                .iter()
                .map(|item| TableKind::Memory(Arc::clone(&item.table))),
        );
        tables.extend(map.in_order().map(|t| TableKind::Persisted(Arc::clone(t))));
        tables
    }

    /// Log position of event `version` of `stream_id`. With duplicates in
    /// one table the highest position wins.
    ///
    /// # Errors
    ///
    /// [`IndexError::NotReady`] before `initialize` or after `close`,
    /// [`IndexError::InvalidArgument`] for a negative event number.
    pub fn try_get_one_value(&self, stream_id: &str, version: i64) -> Result<Option<i64>> {
        self.try_get_one_value_by_hash(stream_hash(stream_id), version)
    }

    pub fn try_get_one_value_by_hash(&self, stream: u64, version: i64) -> Result<Option<i64>> {
        self.shared.ensure_ready()?;
        check_version("event number", version)?;
        Ok(self
            .snapshot()
            .iter()
            .find_map(|t| t.as_search().try_get_one_value(stream, version)))
    }

    /// Entry with the highest event number of `stream_id`.
    pub fn try_get_latest_entry(&self, stream_id: &str) -> Result<Option<IndexEntry>> {
        self.try_get_latest_entry_by_hash(stream_hash(stream_id))
    }

    pub fn try_get_latest_entry_by_hash(&self, stream: u64) -> Result<Option<IndexEntry>> {
        self.shared.ensure_ready()?;
        Ok(self
            .snapshot()
            .iter()
            .find_map(|t| t.as_search().try_get_latest_entry(stream)))
    }

    /// Entry with the lowest event number of `stream_id`.
    pub fn try_get_oldest_entry(&self, stream_id: &str) -> Result<Option<IndexEntry>> {
        self.try_get_oldest_entry_by_hash(stream_hash(stream_id))
    }

    pub fn try_get_oldest_entry_by_hash(&self, stream: u64) -> Result<Option<IndexEntry>> {
        self.shared.ensure_ready()?;
        Ok(self
            .snapshot()
            .iter()
            .rev()
            .find_map(|t| t.as_search().try_get_oldest_entry(stream)))
    }

    /// Entries of `stream_id` with `start <= version <= end`, highest
    /// first, at most `limit` of them.
    ///
    /// Sources are merged; an entry present in several sources (a memtable
    /// and the table it was flushed to) is returned once.
    ///
    /// # Errors
    ///
    /// [`IndexError::InvalidArgument`] if `start` or `end` is negative.
    pub fn get_range(
        &self,
        stream_id: &str,
        start: i64,
        end: i64,
        limit: Option<usize>,
    ) -> Result<Vec<IndexEntry>> {
        self.get_range_by_hash(stream_hash(stream_id), start, end, limit)
    }

    pub fn get_range_by_hash(
        &self,
        stream: u64,
        start: i64,
        end: i64,
        limit: Option<usize>,
    ) -> Result<Vec<IndexEntry>> {
        self.shared.ensure_ready()?;
        check_version("range start", start)?;
        check_version("range end", end)?;
        if start > end || limit == Some(0) {
            return Ok(Vec::new());
        }

        // Each table's own top `limit` covers the merged top `limit`.
        let sources: Vec<Vec<IndexEntry>> = self
            .snapshot()
            .iter()
            .map(|t| t.as_search().get_range(stream, start, end, limit))
            .filter(|r| !r.is_empty())
            .collect();
        Ok(merge_descending(&sources, limit))
    }
}

fn check_version(what: &str, version: i64) -> Result<()> {
    if version < 0 {
        return Err(IndexError::InvalidArgument(format!(
            "{} must be non-negative, got {}",
            what, version
        )));
    }
    Ok(())
}

/// Merges descending runs into one descending run, dropping exact
/// duplicates.
fn merge_descending(sources: &[Vec<IndexEntry>], limit: Option<usize>) -> Vec<IndexEntry> {
    let limit = limit.unwrap_or(usize::MAX);
    let mut heap: BinaryHeap<(IndexEntry, usize, usize)> = sources
        .iter()
        .enumerate()
        .filter_map(|(src, run)| run.first().map(|e| (*e, src, 0)))
        .collect();

    let mut out: Vec<IndexEntry> = Vec::new();
    while let Some((entry, src, pos)) = heap.pop() {
        if out.last() != Some(&entry) {
            out.push(entry);
            if out.len() >= limit {
                break;
            }
        }
        if let Some(next) = sources[src].get(pos + 1) {
            heap.push((*next, src, pos + 1));
        }
    }
    out
}

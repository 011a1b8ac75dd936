/// Write path: `add()`, `add_entries()`, `force_flush()` and the memtable
/// switch.
///
/// All writes come from a single thread, in commit order. Entries land in
/// the active memtable; when it holds `max_memtable_entries` entries it is
/// frozen, queued with the checkpoints it covers and handed to the
/// background worker.
use memtable::MemTable;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

use crate::{stream_hash, Awaiting, IndexEntry, IndexError, IndexKey, Result, TableIndex, TableItem};

impl TableIndex {
    /// Indexes one event committed at `commit_pos`.
    pub fn add(&self, commit_pos: i64, stream_id: &str, version: i64, position: i64) -> Result<()> {
        self.add_hashed_entries(
            commit_pos,
            &[IndexEntry::new(stream_hash(stream_id), version, position)],
        )
    }

    /// Indexes the events of one commit. Readers see all of them or none.
    pub fn add_entries(&self, commit_pos: i64, entries: &[IndexKey]) -> Result<()> {
        let hashed: Vec<IndexEntry> = entries
            .iter()
            .map(|k| IndexEntry::new(k.hash(), k.version, k.position))
            .collect();
        self.add_hashed_entries(commit_pos, &hashed)
    }

    /// Like [`add_entries`](Self::add_entries) for callers that already
    /// hashed the stream ids.
    ///
    /// # Errors
    ///
    /// - [`IndexError::NotReady`] / [`IndexError::Faulted`] when the index
    ///   does not accept writes.
    /// - [`IndexError::InvalidArgument`] for a negative commit position,
    ///   event number or log position.
    /// - [`IndexError::CheckpointRegression`] when `commit_pos` is lower
    ///   than the previous one.
    pub fn add_hashed_entries(&self, commit_pos: i64, entries: &[IndexEntry]) -> Result<()> {
        let shared = &self.shared;
        shared.ensure_writable()?;
        if commit_pos < 0 {
            return Err(IndexError::InvalidArgument(format!(
                "commit position must be non-negative, got {}",
                commit_pos
            )));
        }
        if let Some(bad) = entries.iter().find(|e| e.version < 0 || e.position < 0) {
            return Err(IndexError::InvalidArgument(format!(
                "event number and position must be non-negative, got {}@{}",
                bad.version, bad.position
            )));
        }
        let last_commit = shared.last_commit.load(Ordering::Acquire);
        if commit_pos < last_commit {
            return Err(IndexError::CheckpointRegression {
                kind: "commit",
                current: last_commit,
                attempted: commit_pos,
            });
        }

        let awaiting = shared.current_awaiting();
        awaiting.active.add_entries(entries);
        shared.last_commit.store(commit_pos, Ordering::Release);
        if let Some(max) = entries.iter().map(|e| e.position).max() {
            shared.last_prepare.fetch_max(max, Ordering::AcqRel);
        }

        if awaiting.active.len() >= shared.config.max_memtable_entries {
            self.switch_memtable();
        }
        Ok(())
    }

    /// Queues the active memtable for persisting even though it is not full.
    ///
    /// This is a no-op if the memtable is empty. Must be called from the
    /// writer thread.
    pub fn force_flush(&self) -> Result<()> {
        self.shared.ensure_writable()?;
        if self.shared.current_awaiting().active.is_empty() {
            return Ok(());
        }
        self.switch_memtable();
        Ok(())
    }

    /// Freezes the active memtable behind a fresh one and wakes the worker.
    fn switch_memtable(&self) {
        let shared = &self.shared;
        let mut sched = shared.sched.lock();
        let item = {
            let mut awaiting = shared.awaiting.write();
            let item = TableItem {
                table: Arc::clone(&awaiting.active),
                prepare_checkpoint: shared.last_prepare.load(Ordering::Acquire),
                commit_checkpoint: shared.last_commit.load(Ordering::Acquire),
            };
            let mut frozen = Vec::with_capacity(awaiting.frozen.len() + 1);
            frozen.push(item.clone());
            frozen.extend(awaiting.frozen.iter().cloned());
            *awaiting = Arc::new(Awaiting {
                active: Arc::new(MemTable::new()),
                frozen,
            });
            item
        };
        debug!(
            entries = item.table.len(),
            prepare = item.prepare_checkpoint,
            commit = item.commit_checkpoint,
            "memtable switched"
        );
        shared.start_worker(&mut sched);
    }
}

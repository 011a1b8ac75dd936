//! # Index - Stream Table Index
//!
//! Maps `(stream, event number)` to a position in the transaction log. Ties
//! together the [`memtable`], [`ptable`] and [`config`] crates into an
//! LSM-shaped index that stays consistent with the log through prepare and
//! commit checkpoints.
//!
//! ## Architecture
//!
//! ```text
//! Log committer
//!   |
//!   v
//! ┌────────────────────────────────────────────────────┐
//! │                    TABLE INDEX                     │
//! │                                                    │
//! │ write.rs → hash stream id → active MemTable        │
//! │              |                                     │
//! │              |  (max_memtable_entries reached?)    │
//! │              |            yes                      │
//! │              v                                     │
//! │           switch → frozen MemTable queue           │
//! │              |                                     │
//! │              v  background.rs (worker thread)      │
//! │           PTable on level 0 → indexmap saved       │
//! │              |                                     │
//! │              |  (level full?)                      │
//! │              v                                     │
//! │           merge → one PTable on the next level     │
//! │                                                    │
//! │ read.rs → active → frozen MemTables → PTables      │
//! │            (newest first, first match wins)        │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module          | Purpose                                              |
//! |-----------------|------------------------------------------------------|
//! | `lib.rs`        | `TableIndex`, shared state, accessors, `close`       |
//! | [`index_map`]   | Levels, merge planning, checksummed manifest         |
//! | `recovery`      | `initialize`: load map, chaser check, orphan cleanup |
//! | `write`         | `add`, `add_entries`, `force_flush`, memtable switch |
//! | `read`          | Point lookups and range scans                        |
//! | `background`    | Flush and merge worker, exclusive access             |
//! | `scavenge`      | Table-by-table scavenge with cancellation            |
//! | [`hash`]        | Stream id hashing                                    |
//!
//! ## Consistency
//!
//! The map and the queue of memtables waiting to be persisted are `Arc`
//! snapshots swapped under short write locks. The worker swaps the map in
//! before it drops the flushed memtable from the queue, and readers take the
//! queue before the map, so an entry is never missing from both. Replaced
//! tables are marked for destruction and their files go away when the last
//! reader drops them.
mod background;
mod error;
pub mod hash;
pub mod index_map;
mod read;
mod recovery;
mod scavenge;
mod write;

use config::IndexConfig;
use memtable::MemTable;
use parking_lot::{Condvar, Mutex, RwLock};
use ptable::{PTable, PTableOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub use config::ConfigError;
pub use error::{IndexError, Result};
pub use hash::{stream_hash, IndexKey};
pub use index_map::{IndexMap, MapOptions, MergeKind, MergePlan, ScavengeOutcome, ScavengeResult};
pub use memtable::{IndexEntry, SearchTable};
pub use ptable::PTableVersion;
pub use scavenge::{CancellationToken, IndexScavengerLog};

/// How long `close` waits for the background worker.
pub const DEFAULT_BACKGROUND_TIMEOUT: Duration = Duration::from_secs(7);

/// Lifecycle of a [`TableIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Uninitialized,
    Initializing,
    Ready,
    Closing,
    Closed,
}

/// A switched-out memtable and the checkpoints it covers.
#[derive(Clone)]
pub(crate) struct TableItem {
    pub(crate) table: Arc<MemTable>,
    pub(crate) prepare_checkpoint: i64,
    pub(crate) commit_checkpoint: i64,
}

/// Memtables not yet persisted.
#[derive(Clone)]
pub(crate) struct Awaiting {
    /// Receives writes.
    pub(crate) active: Arc<MemTable>,
    /// Frozen memtables, newest first. The worker persists the last one.
    pub(crate) frozen: Vec<TableItem>,
}

impl Awaiting {
    pub(crate) fn fresh() -> Self {
        Self {
            active: Arc::new(MemTable::new()),
            frozen: Vec::new(),
        }
    }
}

/// A table a read can be routed to.
#[derive(Clone)]
pub(crate) enum TableKind {
    Memory(Arc<MemTable>),
    Persisted(Arc<PTable>),
}

impl TableKind {
    pub(crate) fn as_search(&self) -> &dyn SearchTable {
        match self {
            TableKind::Memory(m) => m.as_ref(),
            TableKind::Persisted(p) => p.as_ref(),
        }
    }
}

/// Background scheduling state.
#[derive(Debug, Default)]
pub(crate) struct Sched {
    /// A worker, or an exclusive task such as scavenge, owns the background.
    pub(crate) running: bool,
    pub(crate) manual_merge: bool,
}

/// State shared by the handle and the background worker.
pub(crate) struct Shared {
    pub(crate) dir: PathBuf,
    pub(crate) config: IndexConfig,
    pub(crate) table_opts: PTableOptions,
    pub(crate) version: PTableVersion,
    pub(crate) state: Mutex<IndexState>,
    pub(crate) map: RwLock<Arc<IndexMap>>,
    pub(crate) awaiting: RwLock<Arc<Awaiting>>,
    pub(crate) sched: Mutex<Sched>,
    /// Signalled whenever `sched.running` goes back to false.
    pub(crate) idle: Condvar,
    /// Set on close; stops the worker and aborts running merges.
    pub(crate) abort: AtomicBool,
    pub(crate) fault: Mutex<Option<String>>,
    pub(crate) last_prepare: AtomicI64,
    pub(crate) last_commit: AtomicI64,
}

impl Shared {
    pub(crate) fn manifest_path(&self) -> PathBuf {
        self.dir.join(index_map::INDEXMAP_FILENAME)
    }

    pub(crate) fn map_opts(&self) -> MapOptions {
        MapOptions::from_config(&self.config)
    }

    pub(crate) fn current_map(&self) -> Arc<IndexMap> {
        Arc::clone(&self.map.read())
    }

    pub(crate) fn current_awaiting(&self) -> Arc<Awaiting> {
        Arc::clone(&self.awaiting.read())
    }

    pub(crate) fn ensure_ready(&self) -> Result<()> {
        let state = *self.state.lock();
        if state == IndexState::Ready {
            Ok(())
        } else {
            Err(IndexError::NotReady(state))
        }
    }

    /// Ready and not faulted.
    pub(crate) fn ensure_writable(&self) -> Result<()> {
        self.ensure_ready()?;
        match self.fault.lock().as_ref() {
            Some(reason) => Err(IndexError::Faulted(reason.clone())),
            None => Ok(()),
        }
    }
}

/// The table index.
///
/// # Write Path
///
/// A single writer thread calls [`add`](TableIndex::add) or
/// [`add_entries`](TableIndex::add_entries) in commit order. Entries go to
/// the active memtable; all entries of one call become visible together.
/// When the memtable is full it is switched out and a background worker
/// writes it to a level-0 PTable, saves the index map and runs any merges
/// the map calls for.
///
/// # Read Path
///
/// Any number of threads may read at any time: the active memtable and the
/// frozen ones first, then the persisted tables newest to oldest.
///
/// # Lifecycle
///
/// [`new`](TableIndex::new) → [`initialize`](TableIndex::initialize) →
/// reads and writes → [`close`](TableIndex::close).
pub struct TableIndex {
    pub(crate) shared: Arc<Shared>,
}

impl std::fmt::Debug for TableIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let awaiting = self.shared.current_awaiting();
        f.debug_struct("TableIndex")
            .field("dir", &self.shared.dir)
            .field("state", &*self.shared.state.lock())
            .field("version", &self.shared.version)
            .field("active_entries", &awaiting.active.len())
            .field("frozen_memtables", &awaiting.frozen.len())
            .field("map", &*self.shared.current_map())
            .field("background_running", &self.shared.sched.lock().running)
            .finish()
    }
}

impl TableIndex {
    /// Creates an index over `dir`. Nothing touches the disk until
    /// [`initialize`](TableIndex::initialize).
    ///
    /// # Errors
    ///
    /// [`IndexError::Config`] when `config` fails validation.
    pub fn new<P: AsRef<Path>>(dir: P, config: IndexConfig) -> Result<Self> {
        config.validate()?;
        let version = PTableVersion::from_u8(config.ptable_version)
            .ok_or(ConfigError::PTableVersion(config.ptable_version))?;
        let table_opts = PTableOptions {
            depth: config.index_cache_depth,
            verify: !config.skip_index_verify,
            use_bloom_filter: config.use_bloom_filters,
        };
        let map_opts = MapOptions::from_config(&config);

        Ok(Self {
            shared: Arc::new(Shared {
                dir: dir.as_ref().to_path_buf(),
                config,
                table_opts,
                version,
                state: Mutex::new(IndexState::Uninitialized),
                map: RwLock::new(Arc::new(IndexMap::empty(map_opts))),
                awaiting: RwLock::new(Arc::new(Awaiting::fresh())),
                sched: Mutex::new(Sched::default()),
                idle: Condvar::new(),
                abort: AtomicBool::new(false),
                fault: Mutex::new(None),
                last_prepare: AtomicI64::new(-1),
                last_commit: AtomicI64::new(-1),
            }),
        })
    }

    #[must_use]
    pub fn state(&self) -> IndexState {
        *self.shared.state.lock()
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.shared.dir
    }

    #[must_use]
    pub fn config(&self) -> &IndexConfig {
        &self.shared.config
    }

    /// Prepare checkpoint of the persisted map, -1 when empty.
    #[must_use]
    pub fn prepare_checkpoint(&self) -> i64 {
        self.shared.current_map().prepare_checkpoint()
    }

    /// Commit checkpoint of the persisted map, -1 when empty.
    #[must_use]
    pub fn commit_checkpoint(&self) -> i64 {
        self.shared.current_map().commit_checkpoint()
    }

    /// Snapshot of the current index map.
    #[must_use]
    pub fn index_map(&self) -> Arc<IndexMap> {
        self.shared.current_map()
    }

    /// Memtables switched out but not yet persisted.
    #[must_use]
    pub fn frozen_memtable_count(&self) -> usize {
        self.shared.current_awaiting().frozen.len()
    }

    /// Whether a flush, merge or scavenge currently owns the background.
    #[must_use]
    pub fn is_background_task_running(&self) -> bool {
        self.shared.sched.lock().running
    }

    /// Reason the index stopped accepting writes, if it did.
    #[must_use]
    pub fn fault(&self) -> Option<String> {
        self.shared.fault.lock().clone()
    }

    /// Blocks until no background task is running.
    ///
    /// # Errors
    ///
    /// [`IndexError::Timeout`] if the background is still busy after
    /// `timeout`.
    pub fn wait_for_background_tasks(&self, timeout: Duration) -> Result<()> {
        self.shared.wait_idle(timeout)
    }

    /// Queues a merge of every table from the automatic merge limit up.
    pub fn merge_indexes(&self) -> Result<()> {
        self.shared.ensure_writable()?;
        let mut sched = self.shared.sched.lock();
        sched.manual_merge = true;
        self.shared.start_worker(&mut sched);
        Ok(())
    }

    /// Stops the background worker and releases the tables.
    ///
    /// Memtables not yet persisted are dropped; the log replays them on the
    /// next start. With `remove_files` the tables and the index map are
    /// deleted as well.
    ///
    /// # Errors
    ///
    /// [`IndexError::Timeout`] if the worker does not stop in time; the
    /// index stays in `Closing`.
    pub fn close(&self, remove_files: bool) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                IndexState::Closed => return Ok(()),
                IndexState::Uninitialized => {
                    *state = IndexState::Closed;
                    return Ok(());
                }
                IndexState::Ready | IndexState::Closing => *state = IndexState::Closing,
                IndexState::Initializing => return Err(IndexError::NotReady(*state)),
            }
        }

        self.shared.abort.store(true, Ordering::Release);
        self.shared.wait_idle(DEFAULT_BACKGROUND_TIMEOUT)?;

        let map = std::mem::replace(
            &mut *self.shared.map.write(),
            Arc::new(IndexMap::empty(self.shared.map_opts())),
        );
        *self.shared.awaiting.write() = Arc::new(Awaiting::fresh());

        if remove_files {
            for table in map.in_order() {
                table.mark_for_destruction();
            }
            match std::fs::remove_file(self.shared.manifest_path()) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            dir = %self.shared.dir.display(),
            tables = map.table_count(),
            remove_files,
            "table index closed"
        );
        *self.shared.state.lock() = IndexState::Closed;
        Ok(())
    }
}

/// Stops the background worker at its next check. Unlike
/// [`close`](TableIndex::close) this does not wait.
impl Drop for TableIndex {
    fn drop(&mut self) {
        self.shared.abort.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests;

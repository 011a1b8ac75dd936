//! Scavenge: rewriting persisted tables without the entries the log no
//! longer needs.
//!
//! The scavenge owns the background for its whole run, so no flush or merge
//! changes the map underneath it. Tables are processed newest to oldest and
//! each successful rewrite is persisted before the next table starts.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::{IndexEntry, IndexError, Result, ScavengeOutcome, SearchTable, TableIndex};

/// Receives one report per table.
pub trait IndexScavengerLog: Send + Sync {
    fn index_table_scavenged(
        &self,
        level: usize,
        index: usize,
        elapsed: Duration,
        entries_deleted: u64,
        entries_kept: u64,
        space_saved: i64,
    );

    /// `level` and `index` are `None` when the whole scavenge stopped before
    /// reaching a table.
    fn index_table_not_scavenged(
        &self,
        level: Option<usize>,
        index: Option<usize>,
        elapsed: Duration,
        entries_kept: u64,
        reason: &str,
    );
}

/// Shared flag a caller sets to stop a running scavenge.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl TableIndex {
    /// Rewrites every persisted table keeping the entries `should_keep`
    /// approves.
    ///
    /// A table that fails to rewrite is reported to `log` and left as it
    /// is; the scavenge moves on. Cancellation is checked between tables.
    ///
    /// # Errors
    ///
    /// [`IndexError::Cancelled`] when `cancel` fires, either while waiting
    /// for the background or between tables. Tables finished before that
    /// stay scavenged.
    pub fn scavenge(
        &self,
        log: &dyn IndexScavengerLog,
        should_keep: &mut dyn FnMut(&IndexEntry) -> anyhow::Result<bool>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.shared.ensure_ready()?;
        let start = Instant::now();
        self.shared.acquire_exclusive(cancel)?;
        info!("index scavenge started");

        let result = self.scavenge_tables(log, should_keep, cancel);
        self.shared.release_exclusive();

        match &result {
            Ok(()) => info!(elapsed_ms = start.elapsed().as_millis() as u64, "index scavenge finished"),
            Err(IndexError::Cancelled) => {
                info!(elapsed_ms = start.elapsed().as_millis() as u64, "index scavenge cancelled")
            }
            Err(e) => warn!(error = %e, "index scavenge failed"),
        }
        result
    }

    fn scavenge_tables(
        &self,
        log: &dyn IndexScavengerLog,
        should_keep: &mut dyn FnMut(&IndexEntry) -> anyhow::Result<bool>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let shared = &self.shared;
        let run_start = Instant::now();
        let tables: Vec<_> = shared.current_map().in_order().cloned().collect();

        for table in tables {
            if cancel.is_cancelled() || shared.abort.load(Ordering::Acquire) {
                log.index_table_not_scavenged(None, None, run_start.elapsed(), 0, "scavenge cancelled");
                return Err(IndexError::Cancelled);
            }

            let table_start = Instant::now();
            let result = shared.current_map().scavenge(
                table.id(),
                &shared.dir,
                shared.version,
                &shared.table_opts,
                should_keep,
            )?;
            let (level, index) = (result.level, result.index);

            match result.outcome {
                ScavengeOutcome::Success {
                    map,
                    old_table,
                    new_table,
                    entries_deleted,
                    entries_kept,
                    space_saved,
                } => {
                    if let Err(e) = shared.install(map, &new_table) {
                        warn!(table_level = level, table_index = index, error = %e, "scavenged table not installed");
                        log.index_table_not_scavenged(
                            Some(level),
                            Some(index),
                            table_start.elapsed(),
                            old_table.count(),
                            &e.to_string(),
                        );
                        continue;
                    }
                    old_table.mark_for_destruction();
                    info!(
                        table_level = level,
                        table_index = index,
                        entries_deleted,
                        entries_kept,
                        space_saved,
                        "table scavenged"
                    );
                    log.index_table_scavenged(
                        level,
                        index,
                        table_start.elapsed(),
                        entries_deleted,
                        entries_kept,
                        space_saved,
                    );
                }
                ScavengeOutcome::Unchanged { table } => {
                    log.index_table_not_scavenged(
                        Some(level),
                        Some(index),
                        table_start.elapsed(),
                        table.count(),
                        "no entries removed",
                    );
                }
                ScavengeOutcome::Failed { old_table, error } => {
                    warn!(table_level = level, table_index = index, error = %error, "table scavenge failed");
                    log.index_table_not_scavenged(
                        Some(level),
                        Some(index),
                        table_start.elapsed(),
                        old_table.count(),
                        &error,
                    );
                }
            }
        }
        Ok(())
    }
}

//! Background worker: persists frozen memtables, runs merges, and hands
//! out exclusive access to long tasks such as scavenge.
//!
//! At most one worker thread exists at a time. It is started on demand and
//! exits when there is nothing left to do; `sched.running` is true for as
//! long as it (or an exclusive task) owns the background.
use ptable::{PTable, PTableError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::index_map::{new_table_path, MergePlan};
use crate::{CancellationToken, IndexError, IndexMap, Result, Sched, SearchTable, Shared, TableItem};

enum Job {
    Flush(TableItem),
    ManualMerge,
}

impl Shared {
    /// Starts the worker unless one is already running. Called with the
    /// scheduling lock held.
    pub(crate) fn start_worker(self: &Arc<Self>, sched: &mut Sched) {
        if sched.running || self.abort.load(Ordering::Acquire) {
            return;
        }
        sched.running = true;
        let shared = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("table-index-bg".into())
            .spawn(move || shared.run_worker());
        if let Err(e) = spawned {
            sched.running = false;
            self.idle.notify_all();
            error!(error = %e, "failed to start table index background worker");
        }
    }

    /// Oldest frozen memtable first, then a pending manual merge. Gives up
    /// the background when there is neither.
    fn next_job(&self) -> Option<Job> {
        let mut sched = self.sched.lock();
        if !self.abort.load(Ordering::Acquire) {
            if let Some(item) = self.current_awaiting().frozen.last().cloned() {
                return Some(Job::Flush(item));
            }
            if std::mem::take(&mut sched.manual_merge) {
                return Some(Job::ManualMerge);
            }
        }
        sched.running = false;
        self.idle.notify_all();
        None
    }

    fn run_worker(self: Arc<Self>) {
        debug!("table index background worker started");
        while let Some(job) = self.next_job() {
            let result = match job {
                Job::Flush(item) => self.flush(item),
                Job::ManualMerge => self.manual_merge(),
            };
            if let Err(e) = result {
                self.record_failure(&e);
                let mut sched = self.sched.lock();
                sched.running = false;
                self.idle.notify_all();
                return;
            }
        }
        debug!("table index background worker stopped");
    }

    fn record_failure(&self, err: &IndexError) {
        match err {
            IndexError::CheckpointRegression { .. } => {
                error!(error = %err, "table index faulted, refusing further writes");
                *self.fault.lock() = Some(err.to_string());
            }
            _ => error!(error = %err, "table index background task failed"),
        }
    }

    /// Persists `map` and makes it current. On failure `new_table` is
    /// marked for destruction and the current map is left alone.
    pub(crate) fn install(&self, map: IndexMap, new_table: &Arc<PTable>) -> Result<()> {
        if let Err(e) = map.save(&self.manifest_path()) {
            new_table.mark_for_destruction();
            return Err(e);
        }
        *self.map.write() = Arc::new(map);
        Ok(())
    }

    fn flush(&self, item: TableItem) -> Result<()> {
        let start = Instant::now();
        item.table.mark_for_conversion();
        let table = Arc::new(PTable::from_memtable(
            &item.table,
            &self.dir,
            self.version,
            &self.table_opts,
        )?);

        let added = match self.current_map().add_ptable(
            Arc::clone(&table),
            item.prepare_checkpoint,
            item.commit_checkpoint,
        ) {
            Ok(added) => added,
            Err(e) => {
                table.mark_for_destruction();
                return Err(e);
            }
        };
        self.install(added.map, &table)?;

        // The map already serves these entries; drop the memtable.
        {
            let _sched = self.sched.lock();
            let mut awaiting = self.awaiting.write();
            let mut next = (**awaiting).clone();
            next.frozen.retain(|t| t.table.id() != item.table.id());
            *awaiting = Arc::new(next);
        }

        debug!(
            table = %table.filename(),
            entries = table.count(),
            prepare = item.prepare_checkpoint,
            commit = item.commit_checkpoint,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "memtable persisted"
        );
        self.run_auto_merges(added.merge)
    }

    fn run_auto_merges(&self, mut plan: Option<MergePlan>) -> Result<()> {
        while let Some(p) = plan {
            if self.abort.load(Ordering::Acquire) || !self.merge(&p)? {
                break;
            }
            plan = self.current_map().plan_merge();
        }
        Ok(())
    }

    fn manual_merge(&self) -> Result<()> {
        match self.current_map().plan_manual_merge() {
            Some(plan) => {
                self.merge(&plan)?;
            }
            None => debug!("manual merge requested, nothing to merge"),
        }
        Ok(())
    }

    /// Runs one merge. `Ok(false)` when it was aborted by close.
    fn merge(&self, plan: &MergePlan) -> Result<bool> {
        let start = Instant::now();
        let path = new_table_path(&self.dir);
        let merged = match PTable::merge(&plan.tables, &path, self.version, &self.table_opts, &self.abort) {
            Ok(t) => Arc::new(t),
            Err(PTableError::Aborted) => {
                info!(target_level = plan.target_level, "merge aborted by shutdown");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let map = match self.current_map().with_merged(plan, Arc::clone(&merged)) {
            Ok(map) => map,
            Err(e) => {
                merged.mark_for_destruction();
                return Err(e);
            }
        };
        self.install(map, &merged)?;
        for table in &plan.tables {
            table.mark_for_destruction();
        }

        info!(
            kind = ?plan.kind,
            inputs = plan.tables.len(),
            target_level = plan.target_level,
            entries = merged.count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "tables merged"
        );
        Ok(true)
    }

    // -------------------- exclusive access --------------------

    /// Waits until the background is free and takes it over. The worker
    /// will not start until [`release_exclusive`](Self::release_exclusive).
    pub(crate) fn acquire_exclusive(&self, cancel: &CancellationToken) -> Result<()> {
        let mut sched = self.sched.lock();
        while sched.running {
            if cancel.is_cancelled() {
                return Err(IndexError::Cancelled);
            }
            self.idle.wait_for(&mut sched, Duration::from_millis(100));
        }
        sched.running = true;
        Ok(())
    }

    /// Gives the background back and restarts the worker if work piled up.
    pub(crate) fn release_exclusive(self: &Arc<Self>) {
        let mut sched = self.sched.lock();
        sched.running = false;
        self.idle.notify_all();
        if sched.manual_merge || !self.current_awaiting().frozen.is_empty() {
            self.start_worker(&mut sched);
        }
    }

    pub(crate) fn wait_idle(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut sched = self.sched.lock();
        while sched.running {
            if self.idle.wait_until(&mut sched, deadline).timed_out() && sched.running {
                return Err(IndexError::Timeout(timeout));
            }
        }
        Ok(())
    }
}

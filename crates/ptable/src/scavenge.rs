//! Rewriting one table without the entries a caller no longer wants.

use memtable::{IndexEntry, SearchTable};
use std::path::Path;
use tracing::debug;

use crate::format::PTableVersion;
use crate::{PTable, PTableError, PTableOptions, PTableWriter, Result};

/// Outcome of a scavenge that produced a new table.
#[derive(Debug)]
pub struct Scavenged {
    pub table: PTable,
    pub entries_kept: u64,
    pub entries_deleted: u64,
    /// Old file size minus new file size. Negative when the format upgrade
    /// costs more than the deleted entries free.
    pub space_saved: i64,
}

impl PTable {
    /// Writes a copy of `table` at `path` keeping only entries for which
    /// `should_keep` returns `true`.
    ///
    /// A V1 table stays V1 whatever `version` asks for. Returns `Ok(None)`
    /// when nothing was dropped and the output format is the table's own:
    /// the output is discarded and the caller keeps the original. The
    /// original file is never touched.
    ///
    /// # Errors
    ///
    /// A failing predicate stops the rewrite with [`PTableError::Predicate`];
    /// I/O errors are returned as is. Partial output is removed either way.
    pub fn scavenged(
        table: &PTable,
        path: &Path,
        version: PTableVersion,
        opts: &PTableOptions,
        should_keep: &mut dyn FnMut(&IndexEntry) -> anyhow::Result<bool>,
    ) -> Result<Option<Scavenged>> {
        let version = version.for_rewrite_of([table.version()]);
        let mut kept = 0u64;
        let mut deleted = 0u64;

        let mut source = table.iterate_all_in_order();
        let entries = std::iter::from_fn(|| loop {
            let e = source.next()?;
            match should_keep(&e) {
                Ok(true) => {
                    kept += 1;
                    return Some(Ok(e));
                }
                Ok(false) => deleted += 1,
                Err(err) => return Some(Err(PTableError::Predicate(format!("{:#}", err)))),
            }
        });

        let pending = PTableWriter::write(path, version, opts, table.count() as usize, entries)?;

        if deleted == 0 && version == table.version() {
            debug!(table = %table.id(), "scavenge removed nothing, keeping original");
            pending.discard();
            return Ok(None);
        }

        let space_saved = table.file_size() as i64 - pending.file_size() as i64;
        let new_table = pending.commit(opts)?;
        Ok(Some(Scavenged {
            table: new_table,
            entries_kept: kept,
            entries_deleted: deleted,
            space_saved,
        }))
    }
}

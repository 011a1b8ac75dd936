use crate::*;
use anyhow::Result;
use config::IndexConfig;
use parking_lot::Mutex;
use std::fs;
use std::ops::Range;
use std::path::Path;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(10);

/// Four entries per memtable, two tables per level.
pub fn small_config() -> IndexConfig {
    IndexConfig {
        max_memtable_entries: 4,
        max_tables_per_level: 2,
        ..IndexConfig::default()
    }
}

pub fn open_index(dir: &Path, config: IndexConfig) -> Result<TableIndex> {
    let index = TableIndex::new(dir, config)?;
    index.initialize(i64::MAX)?;
    Ok(index)
}

/// Event `v` of `stream` at log position `base + v`, one commit per event.
pub fn add_events(index: &TableIndex, stream: &str, versions: Range<i64>, base: i64) -> Result<()> {
    for v in versions {
        index.add(base + v, stream, v, base + v)?;
    }
    Ok(())
}

/// Files named like a table id.
pub fn ptable_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .map(|n| uuid::Uuid::parse_str(n).is_ok())
                .unwrap_or(false)
        })
        .count()
}

pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Scavenge reports, in order.
#[derive(Default)]
pub struct RecordingLog {
    pub scavenged: Mutex<Vec<(usize, usize, u64, u64)>>,
    pub not_scavenged: Mutex<Vec<(Option<usize>, Option<usize>, String)>>,
}

impl IndexScavengerLog for RecordingLog {
    fn index_table_scavenged(
        &self,
        level: usize,
        index: usize,
        _elapsed: Duration,
        entries_deleted: u64,
        entries_kept: u64,
        _space_saved: i64,
    ) {
        self.scavenged
            .lock()
            .push((level, index, entries_deleted, entries_kept));
    }

    fn index_table_not_scavenged(
        &self,
        level: Option<usize>,
        index: Option<usize>,
        _elapsed: Duration,
        _entries_kept: u64,
        reason: &str,
    ) {
        self.not_scavenged
            .lock()
            .push((level, index, reason.to_string()));
    }
}

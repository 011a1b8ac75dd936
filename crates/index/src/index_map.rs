//! # Index map
//!
//! Immutable description of the persisted tables, grouped in levels, plus
//! the log checkpoints they cover. Every change (new table, merge,
//! scavenge) builds a new map; the background worker persists it and swaps
//! it in. Readers holding the previous map keep using its tables safely.
//!
//! ## Levels
//!
//! Level 0 holds freshly flushed tables. When a level reaches
//! `max_tables_per_level` tables it is merged into one table on the next
//! level. Within a level the oldest table comes first.
//!
//! ## File format
//!
//! ```text
//! 5d1e03a7
//! # table index map
//! version:1
//! checkpoints:<prepare>/<commit>
//! max-auto-merge-level:<n>
//! <level>,<index>,<ptable version>,<ptable id>
//! ```
//!
//! The first line is the CRC32 (8 hex digits) of every byte after it. The
//! file is replaced atomically: written to `indexmap.tmp`, fsynced, renamed.

use config::IndexConfig;
use memtable::IndexEntry;
use ptable::{PTable, PTableOptions, PTableVersion, SearchTable};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::{IndexError, Result};

/// Name of the manifest within the index directory.
pub const INDEXMAP_FILENAME: &str = "indexmap";

const INDEXMAP_TMP_FILENAME: &str = "indexmap.tmp";

/// Manifest format written by this version.
pub const INDEXMAP_VERSION: u32 = 1;

/// Path for a new table file in `dir`.
pub fn new_table_path(dir: &Path) -> PathBuf {
    dir.join(Uuid::new_v4().to_string())
}

/// Merge policy of a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapOptions {
    pub max_tables_per_level: usize,
    /// Levels from this one up are only merged by a manual merge.
    pub max_auto_merge_level: u32,
}

impl MapOptions {
    pub fn from_config(config: &IndexConfig) -> Self {
        Self {
            max_tables_per_level: config.max_tables_per_level,
            max_auto_merge_level: config.max_auto_merge_level,
        }
    }
}

impl Default for MapOptions {
    fn default() -> Self {
        Self::from_config(&IndexConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    /// A full level below the automatic merge limit.
    Automatic,
    /// Everything from the automatic merge limit up.
    Manual,
}

/// Tables to merge and where the result goes.
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub kind: MergeKind,
    /// Newest first, ready for [`PTable::merge`].
    pub tables: Vec<Arc<PTable>>,
    pub target_level: usize,
}

/// Result of [`IndexMap::add_ptable`].
#[derive(Debug)]
pub struct AddResult {
    pub map: IndexMap,
    /// The first merge the new map calls for, if any.
    pub merge: Option<MergePlan>,
}

/// Result of [`IndexMap::scavenge`] for the table at `level`/`index`.
#[derive(Debug)]
pub struct ScavengeResult {
    pub level: usize,
    pub index: usize,
    pub outcome: ScavengeOutcome,
}

#[derive(Debug)]
pub enum ScavengeOutcome {
    /// The table was rewritten; `map` references `new_table` in its place.
    Success {
        map: IndexMap,
        old_table: Arc<PTable>,
        new_table: Arc<PTable>,
        entries_deleted: u64,
        entries_kept: u64,
        space_saved: i64,
    },
    /// Nothing to remove; the table stays as it is.
    Unchanged { table: Arc<PTable> },
    /// The rewrite failed; the table stays as it is.
    Failed { old_table: Arc<PTable>, error: String },
}

/// Persisted tables by level, and the checkpoints they cover.
#[derive(Clone)]
pub struct IndexMap {
    levels: Vec<Vec<Arc<PTable>>>,
    prepare_checkpoint: i64,
    commit_checkpoint: i64,
    opts: MapOptions,
}

impl std::fmt::Debug for IndexMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let per_level: Vec<usize> = self.levels.iter().map(Vec::len).collect();
        f.debug_struct("IndexMap")
            .field("prepare_checkpoint", &self.prepare_checkpoint)
            .field("commit_checkpoint", &self.commit_checkpoint)
            .field("tables_per_level", &per_level)
            .field("opts", &self.opts)
            .finish()
    }
}

impl IndexMap {
    /// A map with no tables and both checkpoints at -1.
    pub fn empty(opts: MapOptions) -> Self {
        Self {
            levels: Vec::new(),
            prepare_checkpoint: -1,
            commit_checkpoint: -1,
            opts,
        }
    }

    #[must_use]
    pub fn prepare_checkpoint(&self) -> i64 {
        self.prepare_checkpoint
    }

    #[must_use]
    pub fn commit_checkpoint(&self) -> i64 {
        self.commit_checkpoint
    }

    #[must_use]
    pub fn options(&self) -> MapOptions {
        self.opts
    }

    /// Tables by level, oldest first within a level.
    #[must_use]
    pub fn levels(&self) -> &[Vec<Arc<PTable>>] {
        &self.levels
    }

    #[must_use]
    pub fn table_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table_count() == 0
    }

    /// Newest to oldest: level 0 first, newest table of each level first.
    pub fn in_order(&self) -> impl Iterator<Item = &Arc<PTable>> + '_ {
        self.levels.iter().flat_map(|level| level.iter().rev())
    }

    /// Oldest to newest.
    pub fn in_reverse_order(&self) -> impl Iterator<Item = &Arc<PTable>> + '_ {
        self.levels.iter().rev().flat_map(|level| level.iter())
    }

    /// File names of every table, newest first.
    #[must_use]
    pub fn get_all_filenames(&self) -> Vec<String> {
        self.in_order().map(|t| t.filename()).collect()
    }

    /// Level and index of the table with this id.
    #[must_use]
    pub fn find(&self, id: Uuid) -> Option<(usize, usize)> {
        self.levels.iter().enumerate().find_map(|(level, tables)| {
            tables
                .iter()
                .position(|t| t.id() == id)
                .map(|index| (level, index))
        })
    }

    /// Adds a freshly flushed table to level 0 and advances the checkpoints.
    ///
    /// # Errors
    ///
    /// [`IndexError::CheckpointRegression`] if either checkpoint would move
    /// backwards, [`IndexError::InvalidArgument`] if one is negative.
    pub fn add_ptable(&self, table: Arc<PTable>, prepare: i64, commit: i64) -> Result<AddResult> {
        if prepare < 0 || commit < 0 {
            return Err(IndexError::InvalidArgument(format!(
                "checkpoints must be non-negative, got {}/{}",
                prepare, commit
            )));
        }
        if prepare < self.prepare_checkpoint {
            return Err(IndexError::CheckpointRegression {
                kind: "prepare",
                current: self.prepare_checkpoint,
                attempted: prepare,
            });
        }
        if commit < self.commit_checkpoint {
            return Err(IndexError::CheckpointRegression {
                kind: "commit",
                current: self.commit_checkpoint,
                attempted: commit,
            });
        }

        let mut levels = self.levels.clone();
        if levels.is_empty() {
            levels.push(Vec::new());
        }
        levels[0].push(table);

        let map = Self {
            levels,
            prepare_checkpoint: prepare,
            commit_checkpoint: commit,
            opts: self.opts,
        };
        let merge = map.plan_merge();
        Ok(AddResult { map, merge })
    }

    /// The lowest full level below the automatic merge limit.
    #[must_use]
    pub fn plan_merge(&self) -> Option<MergePlan> {
        let auto_levels = self.levels.len().min(self.opts.max_auto_merge_level as usize);
        (0..auto_levels)
            .find(|&level| self.levels[level].len() >= self.opts.max_tables_per_level)
            .map(|level| MergePlan {
                kind: MergeKind::Automatic,
                tables: self.levels[level].iter().rev().cloned().collect(),
                target_level: level + 1,
            })
    }

    /// All tables from the automatic merge limit up, merged into one on the
    /// level above the limit. `None` when there is at most one such table.
    #[must_use]
    pub fn plan_manual_merge(&self) -> Option<MergePlan> {
        let first = self.opts.max_auto_merge_level as usize;
        if self.levels.len() <= first {
            return None;
        }
        let tables: Vec<Arc<PTable>> = self.levels[first..]
            .iter()
            .flat_map(|level| level.iter().rev())
            .cloned()
            .collect();
        if tables.len() <= 1 {
            return None;
        }
        Some(MergePlan {
            kind: MergeKind::Manual,
            tables,
            target_level: first + 1,
        })
    }

    /// Replaces the plan's tables with `merged`, placed as the newest table
    /// of the target level. Checkpoints are unchanged.
    ///
    /// # Errors
    ///
    /// [`IndexError::InvalidArgument`] if some planned table is no longer in
    /// the map.
    pub fn with_merged(&self, plan: &MergePlan, merged: Arc<PTable>) -> Result<IndexMap> {
        let ids: HashSet<Uuid> = plan.tables.iter().map(|t| t.id()).collect();
        let mut levels = self.levels.clone();
        let before = self.table_count();
        for level in &mut levels {
            level.retain(|t| !ids.contains(&t.id()));
        }
        let removed = before - levels.iter().map(Vec::len).sum::<usize>();
        if removed != ids.len() {
            return Err(IndexError::InvalidArgument(format!(
                "merge plan lists {} tables but {} are in the map",
                ids.len(),
                removed
            )));
        }

        while levels.len() <= plan.target_level {
            levels.push(Vec::new());
        }
        levels[plan.target_level].push(merged);
        while levels.last().map_or(false, Vec::is_empty) {
            levels.pop();
        }

        Ok(Self {
            levels,
            prepare_checkpoint: self.prepare_checkpoint,
            commit_checkpoint: self.commit_checkpoint,
            opts: self.opts,
        })
    }

    /// Rewrites the table `table_id` into `dir`, keeping the entries
    /// `should_keep` approves. A failed rewrite is reported in the outcome,
    /// not as an error; the existing table is never modified.
    ///
    /// # Errors
    ///
    /// [`IndexError::InvalidArgument`] if the table is not in the map.
    pub fn scavenge(
        &self,
        table_id: Uuid,
        dir: &Path,
        version: PTableVersion,
        table_opts: &PTableOptions,
        should_keep: &mut dyn FnMut(&IndexEntry) -> anyhow::Result<bool>,
    ) -> Result<ScavengeResult> {
        let (level, index) = self.find(table_id).ok_or_else(|| {
            IndexError::InvalidArgument(format!("table {} is not in the index map", table_id))
        })?;
        let old_table = Arc::clone(&self.levels[level][index]);

        let path = new_table_path(dir);
        let outcome = match PTable::scavenged(&old_table, &path, version, table_opts, should_keep) {
            Ok(None) => ScavengeOutcome::Unchanged { table: old_table },
            Ok(Some(scavenged)) => {
                let new_table = Arc::new(scavenged.table);
                let mut levels = self.levels.clone();
                levels[level][index] = Arc::clone(&new_table);
                ScavengeOutcome::Success {
                    map: Self {
                        levels,
                        prepare_checkpoint: self.prepare_checkpoint,
                        commit_checkpoint: self.commit_checkpoint,
                        opts: self.opts,
                    },
                    old_table,
                    new_table,
                    entries_deleted: scavenged.entries_deleted,
                    entries_kept: scavenged.entries_kept,
                    space_saved: scavenged.space_saved,
                }
            }
            Err(e) => ScavengeOutcome::Failed {
                old_table,
                error: e.to_string(),
            },
        };
        Ok(ScavengeResult {
            level,
            index,
            outcome,
        })
    }

    // -------------------- persistence --------------------

    /// Loads the map at `path`, opening every table it lists with up to
    /// `threads` threads.
    ///
    /// A missing file gives an empty map. The map's merge limit is the lower
    /// of the configured one and the one recorded in the file.
    ///
    /// # Errors
    ///
    /// [`IndexError::CorruptIndex`] when the file fails its checksum or does
    /// not parse, when any table fails to open (each failure is logged), or
    /// when the file was written with a lower merge limit than configured.
    pub fn from_file(
        path: &Path,
        opts: MapOptions,
        table_opts: &PTableOptions,
        threads: usize,
    ) -> Result<Self> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::empty(opts)),
            Err(e) => return Err(e.into()),
        };
        let text = String::from_utf8(bytes)
            .map_err(|_| IndexError::CorruptIndex("index map is not valid UTF-8".into()))?;
        let manifest = parse_manifest(&text)?;

        if manifest.max_auto_merge_level < opts.max_auto_merge_level {
            return Err(IndexError::CorruptIndex(format!(
                "index map was written with max auto merge level {} but {} is configured; rebuild required",
                manifest.max_auto_merge_level, opts.max_auto_merge_level
            )));
        }
        if !manifest.tables.is_empty()
            && (manifest.prepare_checkpoint < 0 || manifest.commit_checkpoint < 0)
        {
            return Err(IndexError::CorruptIndex(format!(
                "negative checkpoints {}/{} in a non-empty index map",
                manifest.prepare_checkpoint, manifest.commit_checkpoint
            )));
        }

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let levels = load_tables(dir, &manifest.tables, table_opts, threads)?;

        let opts = MapOptions {
            max_auto_merge_level: opts.max_auto_merge_level.min(manifest.max_auto_merge_level),
            ..opts
        };
        let map = Self {
            levels,
            prepare_checkpoint: manifest.prepare_checkpoint,
            commit_checkpoint: manifest.commit_checkpoint,
            opts,
        };
        debug!(
            path = %path.display(),
            tables = map.table_count(),
            prepare = map.prepare_checkpoint,
            commit = map.commit_checkpoint,
            "index map loaded"
        );
        Ok(map)
    }

    /// Persists the map atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let body = self.render();
        let contents = format!("{:08x}\n{}", crc32fast::hash(body.as_bytes()), body);
        let tmp_path = path.with_file_name(INDEXMAP_TMP_FILENAME);

        let written = (|| -> std::io::Result<()> {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            f.write_all(contents.as_bytes())?;
            f.sync_all()?;
            fs::rename(&tmp_path, path)
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        debug!(
            path = %path.display(),
            tables = self.table_count(),
            prepare = self.prepare_checkpoint,
            commit = self.commit_checkpoint,
            "index map saved"
        );
        Ok(())
    }

    fn render(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = writeln!(out, "# table index map");
        let _ = writeln!(out, "version:{}", INDEXMAP_VERSION);
        let _ = writeln!(
            out,
            "checkpoints:{}/{}",
            self.prepare_checkpoint, self.commit_checkpoint
        );
        let _ = writeln!(out, "max-auto-merge-level:{}", self.opts.max_auto_merge_level);
        for (level, tables) in self.levels.iter().enumerate() {
            for (index, table) in tables.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "{},{},{},{}",
                    level,
                    index,
                    table.version().as_u8(),
                    table.filename()
                );
            }
        }
        out
    }
}

// -------------------- parsing --------------------

struct Manifest {
    prepare_checkpoint: i64,
    commit_checkpoint: i64,
    max_auto_merge_level: u32,
    tables: Vec<TableRecord>,
}

#[derive(Debug, Clone)]
struct TableRecord {
    level: usize,
    index: usize,
    version: u8,
    filename: String,
}

fn corrupt(line_num: usize, msg: impl std::fmt::Display) -> IndexError {
    IndexError::CorruptIndex(format!("index map line {}: {}", line_num, msg))
}

fn parse_manifest(text: &str) -> Result<Manifest> {
    let (checksum, body) = text
        .split_once('\n')
        .ok_or_else(|| IndexError::CorruptIndex("index map has no checksum line".into()))?;
    let stored = u32::from_str_radix(checksum.trim(), 16)
        .map_err(|_| IndexError::CorruptIndex(format!("bad index map checksum {:?}", checksum)))?;
    let computed = crc32fast::hash(body.as_bytes());
    if stored != computed {
        return Err(IndexError::CorruptIndex(format!(
            "index map checksum mismatch: stored {:08x}, computed {:08x}",
            stored, computed
        )));
    }

    let mut version = None;
    let mut checkpoints = None;
    let mut max_auto_merge_level = None;
    let mut tables = Vec::new();

    for (i, line) in body.lines().enumerate() {
        let line_num = i + 2;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if let Some(v) = trimmed.strip_prefix("version:") {
            let v: u32 = v.parse().map_err(|_| corrupt(line_num, "bad version"))?;
            if v == 0 || v > INDEXMAP_VERSION {
                return Err(corrupt(line_num, format!("unsupported index map version {}", v)));
            }
            version = Some(v);
        } else if let Some(cp) = trimmed.strip_prefix("checkpoints:") {
            let (prepare, commit) = cp
                .split_once('/')
                .ok_or_else(|| corrupt(line_num, "expected checkpoints:<prepare>/<commit>"))?;
            let prepare: i64 = prepare.parse().map_err(|_| corrupt(line_num, "bad prepare checkpoint"))?;
            let commit: i64 = commit.parse().map_err(|_| corrupt(line_num, "bad commit checkpoint"))?;
            if prepare < -1 || commit < -1 {
                return Err(corrupt(line_num, "checkpoints below -1"));
            }
            checkpoints = Some((prepare, commit));
        } else if let Some(level) = trimmed.strip_prefix("max-auto-merge-level:") {
            max_auto_merge_level =
                Some(level.parse().map_err(|_| corrupt(line_num, "bad max auto merge level"))?);
        } else {
            tables.push(parse_table_line(line_num, trimmed)?);
        }
    }

    if version.is_none() {
        return Err(IndexError::CorruptIndex("index map has no version".into()));
    }
    let (prepare_checkpoint, commit_checkpoint) =
        checkpoints.ok_or_else(|| IndexError::CorruptIndex("index map has no checkpoints".into()))?;
    let max_auto_merge_level = max_auto_merge_level
        .ok_or_else(|| IndexError::CorruptIndex("index map has no max auto merge level".into()))?;

    Ok(Manifest {
        prepare_checkpoint,
        commit_checkpoint,
        max_auto_merge_level,
        tables,
    })
}

fn parse_table_line(line_num: usize, line: &str) -> Result<TableRecord> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() != 4 {
        return Err(corrupt(line_num, "expected <level>,<index>,<version>,<id>"));
    }
    let level = parts[0].parse().map_err(|_| corrupt(line_num, "bad level"))?;
    let index = parts[1].parse().map_err(|_| corrupt(line_num, "bad index"))?;
    let version = parts[2].parse().map_err(|_| corrupt(line_num, "bad ptable version"))?;
    let filename = parts[3].trim();
    if Uuid::parse_str(filename).is_err() {
        return Err(corrupt(line_num, format!("bad ptable id {:?}", filename)));
    }
    Ok(TableRecord {
        level,
        index,
        version,
        filename: filename.to_string(),
    })
}

/// Opens the listed tables and arranges them in levels. Every failure is
/// logged before the load is rejected.
fn load_tables(
    dir: &Path,
    records: &[TableRecord],
    table_opts: &PTableOptions,
    threads: usize,
) -> Result<Vec<Vec<Arc<PTable>>>> {
    // Highest levels hold the biggest files; start with them.
    let mut ordered: Vec<&TableRecord> = records.iter().collect();
    ordered.sort_by(|a, b| b.level.cmp(&a.level).then(a.index.cmp(&b.index)));

    let threads = threads.max(1);
    let chunk = ordered.len().div_ceil(threads).max(1);
    let opened: Vec<(TableRecord, std::result::Result<PTable, String>)> = std::thread::scope(|s| {
        let handles: Vec<_> = ordered
            .chunks(chunk)
            .map(|part| {
                s.spawn(move || {
                    part.iter()
                        .map(|r| ((*r).clone(), open_table(dir, r, table_opts)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap_or_default())
            .collect()
    });

    if opened.len() != records.len() {
        return Err(IndexError::CorruptIndex("a table loading thread panicked".into()));
    }

    let mut failures = 0usize;
    let mut slots: Vec<Vec<Option<Arc<PTable>>>> = Vec::new();
    for (record, result) in opened {
        match result {
            Ok(table) => {
                while slots.len() <= record.level {
                    slots.push(Vec::new());
                }
                let level = &mut slots[record.level];
                while level.len() <= record.index {
                    level.push(None);
                }
                if level[record.index].is_some() {
                    error!(
                        table_level = record.level,
                        table_index = record.index,
                        "duplicate table position in index map"
                    );
                    failures += 1;
                    continue;
                }
                level[record.index] = Some(Arc::new(table));
            }
            Err(reason) => {
                error!(
                    table_level = record.level,
                    table_index = record.index,
                    file = %record.filename,
                    reason = %reason,
                    "failed to load table"
                );
                failures += 1;
            }
        }
    }
    if failures > 0 {
        return Err(IndexError::CorruptIndex(format!(
            "{} of {} tables failed to load",
            failures,
            records.len()
        )));
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(level, tables)| {
            tables
                .into_iter()
                .enumerate()
                .map(|(index, t)| {
                    t.ok_or_else(|| {
                        IndexError::CorruptIndex(format!(
                            "index map is missing level {} position {}",
                            level, index
                        ))
                    })
                })
                .collect()
        })
        .collect()
}

fn open_table(
    dir: &Path,
    record: &TableRecord,
    table_opts: &PTableOptions,
) -> std::result::Result<PTable, String> {
    let table = PTable::open(dir.join(&record.filename), table_opts).map_err(|e| e.to_string())?;
    if table.version().as_u8() != record.version {
        return Err(format!(
            "index map says ptable version {} but the file is {}",
            record.version,
            table.version()
        ));
    }
    Ok(table)
}

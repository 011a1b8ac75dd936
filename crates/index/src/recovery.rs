/// Cold start: loading the index map and cleaning the directory.
///
/// A map that cannot be trusted (bad checksum, unreadable table, or
/// checkpoints ahead of the log) is thrown away and the index starts empty;
/// the log replays everything after the returned checkpoints. A corrupt
/// map is dumped to the log and the directory copied to a sibling
/// `index-backup-<millis>` first.
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

use crate::index_map::INDEXMAP_FILENAME;
use crate::{Awaiting, IndexError, IndexMap, IndexState, Result, TableIndex};

impl TableIndex {
    /// Loads the index from disk and makes it ready.
    ///
    /// `chaser_checkpoint` is how far the log has been read. A map whose
    /// commit checkpoint is not below it is discarded.
    ///
    /// # Errors
    ///
    /// [`IndexError::InvalidArgument`] for a negative checkpoint or when the
    /// index was already initialized; I/O errors while preparing the
    /// directory. On error the index stays uninitialized.
    pub fn initialize(&self, chaser_checkpoint: i64) -> Result<()> {
        if chaser_checkpoint < 0 {
            return Err(IndexError::InvalidArgument(format!(
                "chaser checkpoint must be non-negative, got {}",
                chaser_checkpoint
            )));
        }
        {
            let mut state = self.shared.state.lock();
            if *state != IndexState::Uninitialized {
                return Err(IndexError::InvalidArgument(format!(
                    "cannot initialize a table index in state {:?}",
                    *state
                )));
            }
            *state = IndexState::Initializing;
        }

        let result = self.load(chaser_checkpoint);
        *self.shared.state.lock() = match result {
            Ok(()) => IndexState::Ready,
            Err(_) => IndexState::Uninitialized,
        };
        result
    }

    fn load(&self, chaser_checkpoint: i64) -> Result<()> {
        let shared = &self.shared;
        fs::create_dir_all(&shared.dir)?;
        cleanup_tmp_files(&shared.dir);

        let manifest = shared.manifest_path();
        let loaded = IndexMap::from_file(
            &manifest,
            shared.map_opts(),
            &shared.table_opts,
            shared.config.initialization_threads,
        );
        let map = match loaded {
            Ok(map) if map.commit_checkpoint() >= chaser_checkpoint => {
                warn!(
                    commit = map.commit_checkpoint(),
                    chaser = chaser_checkpoint,
                    "index map is ahead of the log, rebuilding index from the log"
                );
                drop(map);
                remove_manifest(&manifest)?;
                IndexMap::empty(shared.map_opts())
            }
            Ok(map) => map,
            Err(IndexError::CorruptIndex(reason)) => {
                error!(reason = %reason, "index map rejected, rebuilding index from the log");
                log_manifest_content(&manifest);
                backup_index_dir(&shared.dir);
                remove_manifest(&manifest)?;
                IndexMap::empty(shared.map_opts())
            }
            Err(e) => return Err(e),
        };

        let removed = delete_orphans(&shared.dir, &map)?;

        shared.last_prepare.store(map.prepare_checkpoint(), Ordering::Release);
        shared.last_commit.store(map.commit_checkpoint(), Ordering::Release);
        *shared.awaiting.write() = Arc::new(Awaiting::fresh());
        info!(
            dir = %shared.dir.display(),
            tables = map.table_count(),
            prepare = map.prepare_checkpoint(),
            commit = map.commit_checkpoint(),
            orphans_removed = removed,
            "table index initialized"
        );
        *shared.map.write() = Arc::new(map);
        Ok(())
    }
}

fn remove_manifest(manifest: &Path) -> Result<()> {
    match fs::remove_file(manifest) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Logs the raw bytes of a rejected map, 16 per line.
fn log_manifest_content(manifest: &Path) {
    match fs::read(manifest) {
        Ok(bytes) => error!(
            path = %manifest.display(),
            bytes = bytes.len(),
            "index map content:\n{}",
            binary_dump(&bytes)
        ),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => error!(path = %manifest.display(), error = %e, "failed to read index map for dump"),
    }
}

pub(crate) fn binary_dump(bytes: &[u8]) -> String {
    bytes
        .chunks(16)
        .enumerate()
        .map(|(i, line)| {
            let hex: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
            let text: String = line
                .iter()
                .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
                .collect();
            format!("{:08x}  {:<47}  {}", i * 16, hex.join(" "), text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Copies `dir` to a sibling `index-backup-<millis>` for inspection. Failures
/// are logged; the rebuild goes ahead either way.
fn backup_index_dir(dir: &Path) {
    let ts = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis(),
        Err(e) => {
            error!(error = %e, "system clock before epoch, index not backed up");
            return;
        }
    };
    let parent = dir.parent().unwrap_or_else(|| Path::new("."));
    let backup = parent.join(format!("index-backup-{}", ts));
    error!(from = %dir.display(), to = %backup.display(), "backing up index folder for inspection");
    match copy_dir(dir, &backup) {
        Ok(files) => info!(to = %backup.display(), files, "index folder backed up"),
        Err(e) => error!(to = %backup.display(), error = %e, "failed to back up index folder"),
    }
}

fn copy_dir(from: &Path, to: &Path) -> io::Result<u64> {
    fs::create_dir(to)?;
    let mut files = 0;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            files += copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            files += 1;
        }
    }
    Ok(files)
}

/// Removes leftover `.tmp` files from interrupted table, sidecar or map
/// writes.
pub(crate) fn cleanup_tmp_files(dir: &Path) {
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let p = entry.path();
            if let Some(name) = p.file_name().and_then(|n| n.to_str()) {
                if name.ends_with(".tmp") {
                    let _ = fs::remove_file(&p);
                }
            }
        }
    }
}

/// Deletes every file in `dir` the map does not reference. Returns how many
/// were removed.
fn delete_orphans(dir: &Path, map: &IndexMap) -> Result<usize> {
    let mut keep: HashSet<String> = HashSet::new();
    keep.insert(INDEXMAP_FILENAME.to_string());
    for table in map.in_order() {
        keep.insert(table.filename());
        if let Some(name) = bloom::sidecar_path(table.path()).file_name() {
            keep.insert(name.to_string_lossy().into_owned());
        }
    }

    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if keep.contains(&name) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                info!(file = %name, "deleted orphaned index file");
                removed += 1;
            }
            Err(e) => warn!(file = %name, error = %e, "failed to delete orphaned index file"),
        }
    }
    Ok(removed)
}

use crate::*;
use std::path::{Path, PathBuf};

/// `streams` streams of `per_stream` events each. Stream hashes only use the
/// upper 32 bits so every format stores them unchanged.
pub fn sample_entries(streams: u64, per_stream: i64) -> Vec<IndexEntry> {
    let mut v = Vec::new();
    for s in 0..streams {
        for ver in 0..per_stream {
            v.push(IndexEntry::new((s + 1) << 32, ver, s as i64 * 1_000_000 + ver * 10));
        }
    }
    v.sort();
    v
}

pub fn table_path(dir: &Path) -> PathBuf {
    dir.join(uuid::Uuid::new_v4().to_string())
}

pub const ALL_VERSIONS: [PTableVersion; 4] = [
    PTableVersion::V1,
    PTableVersion::V2,
    PTableVersion::V3,
    PTableVersion::V4,
];

/// Highest position for `(stream, version)` found by a linear scan.
pub fn linear_lookup(entries: &[IndexEntry], stream: u64, version: i64) -> Option<i64> {
    entries
        .iter()
        .filter(|e| e.stream == stream && e.version == version)
        .map(|e| e.position)
        .max()
}

pub fn tmp_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .filter(|e| e.path().extension().map_or(false, |x| x == "tmp"))
                .count()
        })
        .unwrap_or(0)
}

use bloom::BloomFilter;
use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use memtable::{EntryKey, IndexEntry, MemTable, SearchTable};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::format::{
    file_size, midpoint_index, read_header, read_midpoint_footer, required_midpoint_count,
    PTableVersion, CHECKSUM_SIZE, HEADER_SIZE, MIDPOINT_FOOTER_SIZE, MIDPOINT_SIZE, PTABLE_MAGIC,
};
use crate::{PTableError, PTableOptions, PTableWriter, Result};

/// A sampled entry key and the index of the entry it was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Midpoint {
    pub key: EntryKey,
    pub item_index: u64,
}

/// An open, memory-mapped PTable.
///
/// Lookups bracket the target with a binary search over the in-memory
/// midpoints, then binary search the entries between the two bracketing
/// midpoints. The file is validated once in [`open`](PTable::open); reads
/// after that cannot fail.
pub struct PTable {
    id: Uuid,
    path: PathBuf,
    version: PTableVersion,
    count: u64,
    file_size: u64,
    mmap: Mmap,
    midpoints: Vec<Midpoint>,
    /// Smallest and largest entries, `None` for an empty table.
    bounds: Option<(IndexEntry, IndexEntry)>,
    bloom: Option<BloomFilter>,
    delete_on_drop: AtomicBool,
}

impl PTable {
    /// Opens and validates the table at `path`.
    ///
    /// # Validation
    ///
    /// - Header magic and version. An unknown version is
    ///   [`PTableError::UnsupportedVersion`].
    /// - File size matches the entry count, and for V4 the footer and
    ///   midpoint section.
    /// - The CRC32 trailer, unless `opts.verify` is false.
    /// - Persisted midpoints are in order and point inside the table.
    ///
    /// Everything else is [`PTableError::Corrupt`].
    ///
    /// Midpoints persisted in a V4 file are used when their count matches
    /// `opts.depth`; otherwise, and for V1-V3, they are sampled from the
    /// entries.
    pub fn open<P: AsRef<Path>>(path: P, opts: &PTableOptions) -> Result<Self> {
        Self::open_internal(path.as_ref(), opts, opts.verify)
    }

    /// Opens a table this process has just written and fsynced.
    pub(crate) fn open_written(path: &Path, opts: &PTableOptions) -> Result<Self> {
        Self::open_internal(path, opts, false)
    }

    fn open_internal(path: &Path, opts: &PTableOptions, verify: bool) -> Result<Self> {
        let file = File::open(path)?;
        let actual_size = file.metadata()?.len();
        if actual_size < HEADER_SIZE + CHECKSUM_SIZE {
            return Err(PTableError::corrupt(path, "file too small"));
        }

        // Safety: the file is never written after it is renamed into place.
        let mmap = unsafe { Mmap::map(&file)? };

        let (magic, raw_version, count) = read_header(&mmap[..HEADER_SIZE as usize]);
        if magic != PTABLE_MAGIC {
            return Err(PTableError::corrupt(path, format!("bad magic {:#x}", magic)));
        }
        let version = PTableVersion::from_u8(raw_version).ok_or_else(|| {
            PTableError::UnsupportedVersion {
                path: path.to_path_buf(),
                version: raw_version,
            }
        })?;

        let stored_midpoints = if version.has_midpoints() {
            if actual_size < HEADER_SIZE + MIDPOINT_FOOTER_SIZE + CHECKSUM_SIZE {
                return Err(PTableError::corrupt(path, "file too small for footer"));
            }
            let footer_at = (actual_size - CHECKSUM_SIZE - MIDPOINT_FOOTER_SIZE) as usize;
            let (midpoint_count, footer_version, footer_magic) =
                read_midpoint_footer(&mmap[footer_at..]);
            if footer_magic != PTABLE_MAGIC || footer_version != raw_version {
                return Err(PTableError::corrupt(path, "bad footer"));
            }
            midpoint_count
        } else {
            0
        };

        let expected_size = file_size(count, version, stored_midpoints);
        if expected_size != Some(actual_size) {
            return Err(PTableError::corrupt(
                path,
                format!(
                    "size {} does not match {} entries and {} midpoints",
                    actual_size, count, stored_midpoints
                ),
            ));
        }

        if verify {
            let body_len = (actual_size - CHECKSUM_SIZE) as usize;
            let mut hasher = Crc32::new();
            hasher.update(&mmap[..body_len]);
            let stored = LittleEndian::read_u32(&mmap[body_len..]);
            let computed = hasher.finalize();
            if stored != computed {
                return Err(PTableError::corrupt(
                    path,
                    format!(
                        "checksum mismatch: stored {:#010x}, computed {:#010x}",
                        stored, computed
                    ),
                ));
            }
        }

        let id = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| Uuid::parse_str(n).ok())
            .unwrap_or_else(Uuid::new_v4);

        let mut table = Self {
            id,
            path: path.to_path_buf(),
            version,
            count,
            file_size: actual_size,
            mmap,
            midpoints: Vec::new(),
            bounds: None,
            bloom: None,
            delete_on_drop: AtomicBool::new(false),
        };

        if count > 0 {
            table.bounds = Some((table.entry_at(0), table.entry_at(count - 1)));
        }

        let wanted = required_midpoint_count(count, PTableVersion::V4, opts.depth);
        table.midpoints = if stored_midpoints > 0 && stored_midpoints == wanted {
            table.read_stored_midpoints(stored_midpoints)?
        } else {
            table.sample_midpoints(wanted)
        };

        if opts.use_bloom_filter && count > 0 {
            table.bloom = load_bloom(path);
        }

        debug!(
            path = %path.display(),
            version = %version,
            entries = count,
            midpoints = table.midpoints.len(),
            bloom = table.bloom.is_some(),
            "ptable opened"
        );
        Ok(table)
    }

    /// Writes `entries` (ascending) to a new table at `path`.
    pub fn create_from_sorted<P, I>(
        path: P,
        entries: I,
        version: PTableVersion,
        opts: &PTableOptions,
    ) -> Result<Self>
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = IndexEntry>,
    {
        let iter = entries.into_iter();
        let expected = iter.size_hint().0;
        PTableWriter::write_table(path.as_ref(), version, opts, expected, iter.map(Ok))
    }

    /// Flushes a memtable into `dir`, naming the file after the memtable id.
    pub fn from_memtable(
        mem: &MemTable,
        dir: &Path,
        version: PTableVersion,
        opts: &PTableOptions,
    ) -> Result<Self> {
        let path = dir.join(mem.id().to_string());
        PTableWriter::write_table(
            &path,
            version,
            opts,
            mem.len(),
            mem.iterate_all_in_order().map(Ok),
        )
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name within its directory, as recorded in the index map.
    #[must_use]
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn version(&self) -> PTableVersion {
        self.version
    }

    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    #[must_use]
    pub fn midpoints(&self) -> &[Midpoint] {
        &self.midpoints
    }

    #[must_use]
    pub fn has_bloom(&self) -> bool {
        self.bloom.is_some()
    }

    /// Deletes the table file and its sidecar once the last reference drops.
    pub fn mark_for_destruction(&self) {
        self.delete_on_drop.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_marked_for_destruction(&self) -> bool {
        self.delete_on_drop.load(Ordering::Acquire)
    }

    /// Entry `i`. `i` must be below the entry count.
    pub(crate) fn entry_at(&self, i: u64) -> IndexEntry {
        let size = self.version.entry_size();
        let start = (HEADER_SIZE + i * size) as usize;
        self.version.read_entry(&self.mmap[start..start + size as usize])
    }

    fn read_stored_midpoints(&self, n: u64) -> Result<Vec<Midpoint>> {
        let base = HEADER_SIZE + self.count * self.version.entry_size();
        let mut out = Vec::with_capacity(n as usize);
        for k in 0..n {
            let at = (base + k * MIDPOINT_SIZE) as usize;
            let raw = &self.mmap[at..at + MIDPOINT_SIZE as usize];
            let mp = Midpoint {
                key: EntryKey::new(LittleEndian::read_u64(raw), LittleEndian::read_i64(&raw[8..])),
                item_index: LittleEndian::read_u64(&raw[16..]),
            };
            if mp.item_index >= self.count {
                return Err(PTableError::corrupt(&self.path, "midpoint points past the end"));
            }
            let in_order = out
                .last()
                .map_or(true, |p: &Midpoint| p.key <= mp.key && p.item_index <= mp.item_index);
            if !in_order {
                return Err(PTableError::corrupt(&self.path, "midpoints out of order"));
            }
            out.push(mp);
        }
        let first_last_ok = out.first().map(|m| m.item_index) == Some(0)
            && out.last().map(|m| m.item_index) == Some(self.count - 1);
        if !first_last_ok {
            return Err(PTableError::corrupt(&self.path, "midpoints do not span the table"));
        }
        Ok(out)
    }

    fn sample_midpoints(&self, n: u64) -> Vec<Midpoint> {
        (0..n)
            .map(|k| {
                let item_index = midpoint_index(k, self.count, n);
                Midpoint {
                    key: self.entry_at(item_index).key(),
                    item_index,
                }
            })
            .collect()
    }

    /// First index whose entry is `>= target` (or `> target` when
    /// `inclusive` is false).
    fn partition(&self, target: IndexEntry, inclusive: bool) -> u64 {
        let key = target.key();
        let lo = match self.midpoints.partition_point(|m| m.key < key) {
            0 => 0,
            p => self.midpoints[p - 1].item_index,
        };
        let hi = match self.midpoints.partition_point(|m| m.key <= key) {
            q if q == self.midpoints.len() => self.count,
            q => self.midpoints[q].item_index,
        };

        let (mut l, mut h) = (lo, hi);
        while l < h {
            let mid = l + (h - l) / 2;
            let e = self.entry_at(mid);
            let before = if inclusive { e < target } else { e <= target };
            if before {
                l = mid + 1;
            } else {
                h = mid;
            }
        }
        l
    }

    /// Index range of entries of `stream` with versions in `start..=end`.
    fn locate(&self, stream: u64, start: i64, end: i64) -> std::ops::Range<u64> {
        let stream = self.version.stream_key(stream);
        if start > end || !self.may_contain(stream) {
            return 0..0;
        }
        let from = self.partition(IndexEntry::new(stream, start, i64::MIN), true);
        let to = self.partition(IndexEntry::new(stream, end, i64::MAX), false);
        from..to.max(from)
    }

    fn may_contain(&self, stream: u64) -> bool {
        let Some((min, max)) = self.bounds else {
            return false;
        };
        if stream < min.stream || stream > max.stream {
            return false;
        }
        self.bloom.as_ref().map_or(true, |b| b.may_contain(stream))
    }
}

impl SearchTable for PTable {
    fn id(&self) -> Uuid {
        self.id
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn try_get_one_value(&self, stream: u64, version: i64) -> Option<i64> {
        let r = self.locate(stream, version, version);
        (!r.is_empty()).then(|| self.entry_at(r.end - 1).position)
    }

    fn try_get_latest_entry(&self, stream: u64) -> Option<IndexEntry> {
        let r = self.locate(stream, 0, i64::MAX);
        (!r.is_empty()).then(|| self.entry_at(r.end - 1))
    }

    fn try_get_oldest_entry(&self, stream: u64) -> Option<IndexEntry> {
        let r = self.locate(stream, 0, i64::MAX);
        (!r.is_empty()).then(|| self.entry_at(r.start))
    }

    fn try_get_next_entry(&self, stream: u64, after: i64) -> Option<IndexEntry> {
        if after == i64::MAX {
            return None;
        }
        let r = self.locate(stream, after + 1, i64::MAX);
        (!r.is_empty()).then(|| self.entry_at(r.start))
    }

    fn try_get_previous_entry(&self, stream: u64, before: i64) -> Option<IndexEntry> {
        if before <= 0 {
            return None;
        }
        let r = self.locate(stream, 0, before - 1);
        (!r.is_empty()).then(|| self.entry_at(r.end - 1))
    }

    fn get_range(
        &self,
        stream: u64,
        start: i64,
        end: i64,
        limit: Option<usize>,
    ) -> Vec<IndexEntry> {
        self.locate(stream, start, end)
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .map(|i| self.entry_at(i))
            .collect()
    }

    fn iterate_all_in_order(&self) -> Box<dyn Iterator<Item = IndexEntry> + '_> {
        Box::new((0..self.count).map(move |i| self.entry_at(i)))
    }
}

impl std::fmt::Debug for PTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PTable")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("version", &self.version)
            .field("count", &self.count)
            .field("midpoints", &self.midpoints.len())
            .finish()
    }
}

impl Drop for PTable {
    fn drop(&mut self) {
        if !self.delete_on_drop.load(Ordering::Acquire) {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "ptable deleted"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to delete ptable"),
        }
        let sidecar = bloom::sidecar_path(&self.path);
        match fs::remove_file(&sidecar) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %sidecar.display(), error = %e, "failed to delete bloom sidecar"),
        }
    }
}

fn load_bloom(path: &Path) -> Option<BloomFilter> {
    let sidecar = bloom::sidecar_path(path);
    match BloomFilter::read_file(&sidecar) {
        Ok(b) => Some(b),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %sidecar.display(), error = %e, "ignoring unreadable bloom filter");
            None
        }
    }
}

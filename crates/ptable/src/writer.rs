use bloom::BloomFilter;
use byteorder::{LittleEndian, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use memtable::IndexEntry;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::format::{
    midpoint_index, required_midpoint_count, write_header, write_midpoint_footer, PTableVersion,
    HEADER_SIZE,
};
use crate::{PTable, PTableError, PTableOptions, Result};

/// Default bloom filter false positive rate (1%).
const BLOOM_FPR: f64 = 0.01;

/// Writes sorted entries to disk as an immutable PTable file.
///
/// The writer is stateless. [`write`](PTableWriter::write) produces a fully
/// written and fsynced temp file wrapped in a [`PendingTable`]; nothing is
/// visible at the final path until [`PendingTable::commit`] renames it.
pub struct PTableWriter {}

impl PTableWriter {
    /// Writes `entries` to `path.tmp`.
    ///
    /// # Arguments
    ///
    /// * `expected_count` - used to size the bloom filter; over-estimating
    ///   is safe.
    /// * `entries` - ascending entries. The first `Err` aborts the build and
    ///   is returned as is, which is how merges and scavenges stop early.
    ///
    /// Entries are narrowed to `version` before they are written: V1 keeps
    /// only the upper half of each stream hash, V1 and V2 reject event
    /// numbers outside `i32`. Because narrowing hashes can reorder entries, V1
    /// tables are sorted in memory before writing.
    ///
    /// # Errors
    ///
    /// [`PTableError::NotSorted`] when entries go backwards, any error yielded
    /// by `entries`, or I/O failures. The temp file is removed on error.
    pub fn write<I>(
        path: &Path,
        version: PTableVersion,
        opts: &PTableOptions,
        expected_count: usize,
        entries: I,
    ) -> Result<PendingTable>
    where
        I: IntoIterator<Item = Result<IndexEntry>>,
    {
        let tmp_path = path.with_extension("tmp");
        match Self::write_internal(&tmp_path, version, opts, expected_count, entries) {
            Ok((count, file_size, bloom)) => Ok(PendingTable {
                tmp_path,
                path: path.to_path_buf(),
                version,
                count,
                file_size,
                bloom,
            }),
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    /// [`write`](PTableWriter::write) followed by [`PendingTable::commit`].
    pub fn write_table<I>(
        path: &Path,
        version: PTableVersion,
        opts: &PTableOptions,
        expected_count: usize,
        entries: I,
    ) -> Result<PTable>
    where
        I: IntoIterator<Item = Result<IndexEntry>>,
    {
        Self::write(path, version, opts, expected_count, entries)?.commit(opts)
    }

    fn write_internal<I>(
        tmp_path: &Path,
        version: PTableVersion,
        opts: &PTableOptions,
        expected_count: usize,
        entries: I,
    ) -> Result<(u64, u64, Option<BloomFilter>)>
    where
        I: IntoIterator<Item = Result<IndexEntry>>,
    {
        let raw_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(tmp_path)?;
        let mut file = BufWriter::new(raw_file);

        // The count is patched in once the entries are written.
        write_header(&mut file, version, 0)?;

        let mut bloom = opts
            .use_bloom_filter
            .then(|| BloomFilter::new(expected_count.max(1), BLOOM_FPR));

        let narrowed = entries
            .into_iter()
            .map(|item| item.and_then(|e| narrow(e, version)));
        let count = if version == PTableVersion::V1 {
            let mut all = narrowed.collect::<Result<Vec<_>>>()?;
            all.sort_unstable();
            write_entries(&mut file, version, bloom.as_mut(), all.into_iter().map(Ok))?
        } else {
            write_entries(&mut file, version, bloom.as_mut(), narrowed)?
        };

        file.flush()?;
        let mut file = file.into_inner().map_err(io::Error::from)?;
        file.seek(SeekFrom::Start(8))?;
        file.write_all(&count.to_le_bytes())?;

        // Second pass: checksum what is on disk and pick the midpoints.
        let midpoint_count = required_midpoint_count(count, version, opts.depth);
        let (mut hasher, midpoints) = scan_written(&mut file, version, count, midpoint_count)?;

        let mut tail = Vec::new();
        for (entry, item_index) in &midpoints {
            tail.write_u64::<LittleEndian>(entry.stream)?;
            tail.write_i64::<LittleEndian>(entry.version)?;
            tail.write_u64::<LittleEndian>(*item_index)?;
        }
        if version.has_midpoints() {
            write_midpoint_footer(&mut tail, midpoint_count)?;
        }
        hasher.update(&tail);
        tail.write_u32::<LittleEndian>(hasher.finalize())?;

        file.seek(SeekFrom::End(0))?;
        file.write_all(&tail)?;
        file.sync_all()?;
        let file_size = file.metadata()?.len();

        Ok((count, file_size, bloom))
    }
}

/// A table written to its temp file but not yet visible at its final path.
///
/// Dropping it without calling [`commit`](PendingTable::commit) deletes the
/// temp file.
pub struct PendingTable {
    tmp_path: PathBuf,
    path: PathBuf,
    version: PTableVersion,
    count: u64,
    file_size: u64,
    bloom: Option<BloomFilter>,
}

impl PendingTable {
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    #[must_use]
    pub fn version(&self) -> PTableVersion {
        self.version
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Renames the temp file into place, fsyncs the directory, writes the
    /// bloom sidecar and opens the table.
    pub fn commit(mut self, opts: &PTableOptions) -> Result<PTable> {
        fs::rename(&self.tmp_path, &self.path)?;

        // A crash after rename but before the directory is synced can lose
        // the entry on ext4/XFS.
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        if let Some(bloom) = self.bloom.take() {
            let sidecar = bloom::sidecar_path(&self.path);
            if let Err(e) = bloom.write_file(&sidecar) {
                warn!(path = %sidecar.display(), error = %e, "failed to write bloom filter");
            }
        }

        debug!(
            path = %self.path.display(),
            version = %self.version,
            entries = self.count,
            bytes = self.file_size,
            "ptable written"
        );
        PTable::open_written(&self.path, opts)
    }

    /// Deletes the temp file.
    pub fn discard(self) {}
}

impl Drop for PendingTable {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.tmp_path);
    }
}

fn narrow(e: IndexEntry, version: PTableVersion) -> Result<IndexEntry> {
    if version.narrow_versions() && i32::try_from(e.version).is_err() {
        return Err(PTableError::VersionOutOfRange { entry: e, format: version });
    }
    Ok(IndexEntry::new(version.stream_key(e.stream), e.version, e.position))
}

fn write_entries<W, J>(
    w: &mut W,
    version: PTableVersion,
    mut bloom: Option<&mut BloomFilter>,
    entries: J,
) -> Result<u64>
where
    W: Write,
    J: Iterator<Item = Result<IndexEntry>>,
{
    let mut prev: Option<IndexEntry> = None;
    let mut count = 0u64;
    for item in entries {
        let e = item?;
        if let Some(p) = prev {
            if e < p {
                return Err(PTableError::NotSorted { prev: p, next: e });
            }
        }
        version.write_entry(w, &e)?;
        if let Some(b) = bloom.as_deref_mut() {
            b.insert(e.stream);
        }
        prev = Some(e);
        count += 1;
    }
    Ok(count)
}

/// Re-reads header and entries, returning the running checksum and the
/// sampled midpoints as `(entry, item_index)`.
fn scan_written(
    file: &mut File,
    version: PTableVersion,
    count: u64,
    midpoint_count: u64,
) -> Result<(Crc32, Vec<(IndexEntry, u64)>)> {
    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Crc32::new();
    let mut buf = [0u8; 24];

    let header = &mut buf[..HEADER_SIZE as usize];
    reader.read_exact(header)?;
    hasher.update(header);

    let entry_size = version.entry_size() as usize;
    let mut midpoints = Vec::with_capacity(midpoint_count as usize);
    let mut k = 0u64;
    for i in 0..count {
        let raw = &mut buf[..entry_size];
        reader.read_exact(raw)?;
        hasher.update(raw);
        while k < midpoint_count && midpoint_index(k, count, midpoint_count) == i {
            midpoints.push((version.read_entry(raw), i));
            k += 1;
        }
    }
    Ok((hasher, midpoints))
}

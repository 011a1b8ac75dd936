//! # Bloom Filter
//!
//! Probabilistic membership test over stream hashes.
//!
//! A bloom filter can tell with certainty that a stream is **not** in a
//! table, but may occasionally report that it is when it isn't.
//!
//! ## Usage in the index
//!
//! Every PTable gets a sidecar file `<table>.bloomfilter` built from the
//! stream hashes it contains. Point lookups and range scans check the filter
//! first and skip the table when it says "not present". A missing or damaged
//! sidecar is never fatal: the table is simply searched without a filter.
//!
//! ## Sidecar format
//!
//! ```text
//! [magic: u32 "BLMF"][num_bits: u64][num_hashes: u32][bits_len: u32][bits][crc32: u32]
//! ```
//!
//! All integers little-endian. The CRC covers every byte before it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use bloom::BloomFilter;
//!
//! let mut bf = BloomFilter::new(1000, 0.01);
//! bf.insert(0xdead_beef);
//! assert!(bf.may_contain(0xdead_beef));
//! ```
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use xxhash_rust::xxh3::xxh3_128;

/// Magic number of a bloom sidecar file (ASCII "BLMF").
pub const BLOOM_MAGIC: u32 = 0x464D_4C42;

/// Extension appended to a PTable file name to get its sidecar.
pub const BLOOM_EXTENSION: &str = "bloomfilter";

/// Largest bit array accepted when reading a sidecar (128 MiB).
const MAX_BLOOM_BYTES: usize = 128 * 1024 * 1024;

/// A bloom filter backed by a bit vector with `k` hash functions.
///
/// Uses double hashing `h(i) = h1 + i * h2`, where `h1` and `h2` are the two
/// halves of an xxh3-128 digest of the stream hash.
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Creates a filter sized for `expected_items` at the given target
    /// `false_positive_rate`.
    ///
    /// # Panics
    ///
    /// Panics if `expected_items` is 0 or `false_positive_rate` is not in `(0, 1)`.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        assert!(expected_items > 0, "expected_items must be > 0");
        assert!(
            false_positive_rate > 0.0 && false_positive_rate < 1.0,
            "false_positive_rate must be in (0, 1)"
        );

        // m = -n * ln(p) / (ln(2)^2)
        let n = expected_items as f64;
        let m = (-n * false_positive_rate.ln() / (std::f64::consts::LN_2.powi(2))).ceil() as u64;
        let m = m.max(8);

        // k = (m/n) * ln(2)
        let k = ((m as f64 / n) * std::f64::consts::LN_2).ceil() as u32;
        let k = k.max(1);

        Self {
            bits: vec![0u8; m.div_ceil(8) as usize],
            num_bits: m,
            num_hashes: k,
        }
    }

    pub fn insert(&mut self, stream: u64) {
        let (h1, h2) = hash_pair(stream);
        for i in 0..self.num_hashes {
            let idx = self.bit_index(h1, h2, i);
            self.bits[(idx / 8) as usize] |= 1 << (idx % 8);
        }
    }

    /// Returns `false` only when `stream` is definitely absent.
    #[must_use]
    pub fn may_contain(&self, stream: u64) -> bool {
        let (h1, h2) = hash_pair(stream);
        (0..self.num_hashes).all(|i| {
            let idx = self.bit_index(h1, h2, i);
            (self.bits[(idx / 8) as usize] >> (idx % 8)) & 1 == 1
        })
    }

    #[must_use]
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    #[must_use]
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Size of the serialized filter in bytes, magic and checksum included.
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        4 + 8 + 4 + 4 + self.bits.len() + 4
    }

    /// Serializes the filter, checksum included.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut body = Vec::with_capacity(self.serialized_size());
        body.write_u32::<LittleEndian>(BLOOM_MAGIC)?;
        body.write_u64::<LittleEndian>(self.num_bits)?;
        body.write_u32::<LittleEndian>(self.num_hashes)?;
        body.write_u32::<LittleEndian>(self.bits.len() as u32)?;
        body.extend_from_slice(&self.bits);

        let mut hasher = Crc32::new();
        hasher.update(&body);
        w.write_all(&body)?;
        w.write_u32::<LittleEndian>(hasher.finalize())?;
        Ok(())
    }

    /// Deserializes a filter and verifies its checksum.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut hasher = Crc32::new();

        let magic = r.read_u32::<LittleEndian>()?;
        if magic != BLOOM_MAGIC {
            return Err(invalid(format!("bad bloom magic: {:#x}", magic)));
        }
        let num_bits = r.read_u64::<LittleEndian>()?;
        let num_hashes = r.read_u32::<LittleEndian>()?;
        let bits_len = r.read_u32::<LittleEndian>()? as usize;
        if bits_len > MAX_BLOOM_BYTES {
            return Err(invalid(format!("bloom filter too large: {} bytes", bits_len)));
        }
        if num_bits == 0 || num_bits > bits_len as u64 * 8 || num_hashes == 0 {
            return Err(invalid(format!(
                "inconsistent bloom header: {} bits, {} hashes, {} bytes",
                num_bits, num_hashes, bits_len
            )));
        }

        let mut bits = vec![0u8; bits_len];
        r.read_exact(&mut bits)?;

        hasher.update(&magic.to_le_bytes());
        hasher.update(&num_bits.to_le_bytes());
        hasher.update(&num_hashes.to_le_bytes());
        hasher.update(&(bits_len as u32).to_le_bytes());
        hasher.update(&bits);
        let stored = r.read_u32::<LittleEndian>()?;
        if stored != hasher.finalize() {
            return Err(invalid("bloom filter checksum mismatch".to_string()));
        }

        Ok(Self {
            bits,
            num_bits,
            num_hashes,
        })
    }

    /// Writes the filter to `path` through a temp file and rename.
    pub fn write_file(&self, path: &Path) -> io::Result<()> {
        let tmp_path = path.with_extension("bloomfilter.tmp");
        let raw = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut file = BufWriter::new(raw);
        self.write_to(&mut file)?;
        file.flush()?;
        file.into_inner()?.sync_all()?;
        fs::rename(&tmp_path, path)
    }

    /// Reads a sidecar written by [`write_file`](BloomFilter::write_file).
    pub fn read_file(path: &Path) -> io::Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::read_from(&mut reader)
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .field("bytes", &self.bits.len())
            .finish()
    }
}

/// Sidecar path for the table at `table_path`.
pub fn sidecar_path(table_path: &Path) -> std::path::PathBuf {
    let mut name = table_path.as_os_str().to_owned();
    name.push(".");
    name.push(BLOOM_EXTENSION);
    name.into()
}

fn hash_pair(stream: u64) -> (u64, u64) {
    let digest = xxh3_128(&stream.to_le_bytes());
    (digest as u64, (digest >> 64) as u64)
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

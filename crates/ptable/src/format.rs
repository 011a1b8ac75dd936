//! PTable binary format: versions, section sizes, entry codecs and the
//! midpoint sizing rules.
//!
//! ## Header (16 bytes)
//!
//! ```text
//! [magic: u32 LE "PTBL"][version: u8][reserved: 3 bytes][entry_count: u64 LE]
//! ```
//!
//! ## Entry encodings
//!
//! | Version | stream            | version | position | size |
//! |---------|-------------------|---------|----------|------|
//! | V1      | u32 (hash >> 32)  | i32     | i64      | 16   |
//! | V2      | u64               | i32     | i64      | 20   |
//! | V3      | u64               | i64     | i64      | 24   |
//! | V4      | u64               | i64     | i64      | 24   |
//!
//! ## Footer
//!
//! V1-V3 end with a bare `crc32: u32`. V4 stores its midpoints right after
//! the entries and ends with
//!
//! ```text
//! [midpoint_count: u32][version: u8][reserved: 3 bytes][magic: u32][crc32: u32]
//! ```
//!
//! Each midpoint is `[stream: u64][version: i64][item_index: u64]`. The CRC
//! covers every byte of the file before it.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use memtable::IndexEntry;
use std::io::{Result as IoResult, Write};

/// Magic number at the start of every PTable and inside the V4 footer
/// (ASCII "PTBL").
pub const PTABLE_MAGIC: u32 = 0x4C42_5450;

/// Header size: 4 (`magic`) + 1 (`version`) + 3 (reserved) + 8 (`entry_count`).
pub const HEADER_SIZE: u64 = 16;

/// Size of one on-disk midpoint.
pub const MIDPOINT_SIZE: u64 = 24;

/// Size of the trailing checksum.
pub const CHECKSUM_SIZE: u64 = 4;

/// Size of the V4 footer without the checksum: 4 (`midpoint_count`) +
/// 1 (`version`) + 3 (reserved) + 4 (`magic`).
pub const MIDPOINT_FOOTER_SIZE: u64 = 12;

/// Deepest midpoint tree, whatever depth is requested.
pub const MAX_DEPTH: u32 = 28;

/// Mask applied to stream hashes stored in V1 tables.
const V1_STREAM_MASK: u64 = 0xFFFF_FFFF_0000_0000;

/// On-disk format of a PTable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PTableVersion {
    V1 = 1,
    V2 = 2,
    V3 = 3,
    V4 = 4,
}

impl PTableVersion {
    pub const LATEST: PTableVersion = PTableVersion::V4;

    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            3 => Some(Self::V3),
            4 => Some(Self::V4),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Bytes used by one entry.
    #[must_use]
    pub fn entry_size(self) -> u64 {
        match self {
            Self::V1 => 16,
            Self::V2 => 20,
            Self::V3 | Self::V4 => 24,
        }
    }

    /// Whether midpoints are persisted in the file.
    #[must_use]
    pub fn has_midpoints(self) -> bool {
        self >= Self::V4
    }

    /// Bytes after the last entry when the table has no midpoints.
    #[must_use]
    pub fn footer_size(self) -> u64 {
        if self.has_midpoints() {
            MIDPOINT_FOOTER_SIZE + CHECKSUM_SIZE
        } else {
            CHECKSUM_SIZE
        }
    }

    /// Whether event numbers are stored as `i32`.
    #[must_use]
    pub fn narrow_versions(self) -> bool {
        self <= Self::V2
    }

    /// The stream hash as this format stores it.
    #[must_use]
    pub fn stream_key(self, stream: u64) -> u64 {
        match self {
            Self::V1 => stream & V1_STREAM_MASK,
            _ => stream,
        }
    }

    /// Format of a table rewritten from tables in `inputs`, when `self` was
    /// asked for. V1 keeps only the upper half of each stream hash and the
    /// lower half cannot be recovered, so the output stays V1 while any
    /// input is V1.
    #[must_use]
    pub fn for_rewrite_of<I>(self, inputs: I) -> Self
    where
        I: IntoIterator<Item = PTableVersion>,
    {
        if inputs.into_iter().any(|v| v == Self::V1) {
            Self::V1
        } else {
            self
        }
    }

    /// Encodes one entry. The entry must already be narrowed to this format.
    pub fn write_entry<W: Write>(self, w: &mut W, e: &IndexEntry) -> IoResult<()> {
        match self {
            Self::V1 => w.write_u32::<LittleEndian>((e.stream >> 32) as u32)?,
            _ => w.write_u64::<LittleEndian>(e.stream)?,
        }
        if self.narrow_versions() {
            w.write_i32::<LittleEndian>(e.version as i32)?;
        } else {
            w.write_i64::<LittleEndian>(e.version)?;
        }
        w.write_i64::<LittleEndian>(e.position)
    }

    /// Decodes one entry from exactly [`entry_size`](Self::entry_size) bytes.
    #[must_use]
    pub fn read_entry(self, buf: &[u8]) -> IndexEntry {
        let (stream, rest) = match self {
            Self::V1 => ((LittleEndian::read_u32(buf) as u64) << 32, &buf[4..]),
            _ => (LittleEndian::read_u64(buf), &buf[8..]),
        };
        let (version, rest) = if self.narrow_versions() {
            (LittleEndian::read_i32(rest) as i64, &rest[4..])
        } else {
            (LittleEndian::read_i64(rest), &rest[8..])
        };
        IndexEntry::new(stream, version, LittleEndian::read_i64(rest))
    }
}

impl std::fmt::Display for PTableVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "V{}", self.as_u8())
    }
}

/// Midpoint tree depth for a table whose entry section is `entries_bytes`
/// long.
///
/// Grows by one level each time the entry section doubles past 8 KiB, never
/// goes below `min(min_depth, MAX_DEPTH)` and never above [`MAX_DEPTH`].
#[must_use]
pub fn depth_for(entries_bytes: u64, min_depth: u32) -> u32 {
    let min_depth = min_depth.min(MAX_DEPTH);
    let size_depth = (0..MAX_DEPTH)
        .rev()
        .find(|&i| (2u128 << i) * 4096 < entries_bytes as u128)
        .map_or(0, |i| i + 1);
    min_depth.max(size_depth)
}

/// Number of midpoints a table of `count` entries carries.
///
/// Zero for formats without midpoints and for empty tables, otherwise
/// `max(2, min(2^depth, count))`.
#[must_use]
pub fn required_midpoint_count(count: u64, version: PTableVersion, min_depth: u32) -> u64 {
    if count == 0 || !version.has_midpoints() {
        return 0;
    }
    let depth = depth_for(count.saturating_mul(version.entry_size()), min_depth);
    (1u64 << depth).min(count).max(2)
}

/// Index of the entry sampled by midpoint `k` out of `midpoints` in a table
/// of `count` entries. The first and last midpoints hit the first and last
/// entries.
#[must_use]
pub fn midpoint_index(k: u64, count: u64, midpoints: u64) -> u64 {
    if k == 0 || count == 0 {
        0
    } else if k + 1 >= midpoints {
        count - 1
    } else {
        ((k as u128 * (count - 1) as u128) / (midpoints - 1) as u128) as u64
    }
}

/// Total file size of a table, or `None` when it does not fit in a `u64`.
#[must_use]
pub fn file_size(count: u64, version: PTableVersion, midpoint_count: u64) -> Option<u64> {
    count
        .checked_mul(version.entry_size())?
        .checked_add(midpoint_count.checked_mul(MIDPOINT_SIZE)?)?
        .checked_add(HEADER_SIZE + version.footer_size())
}

/// Writes the fixed header.
pub fn write_header<W: Write>(w: &mut W, version: PTableVersion, count: u64) -> IoResult<()> {
    w.write_u32::<LittleEndian>(PTABLE_MAGIC)?;
    w.write_u8(version.as_u8())?;
    w.write_all(&[0u8; 3])?;
    w.write_u64::<LittleEndian>(count)
}

/// Parsed header: `(magic, raw version byte, entry count)`.
#[must_use]
pub fn read_header(buf: &[u8]) -> (u32, u8, u64) {
    (
        LittleEndian::read_u32(&buf[0..4]),
        buf[4],
        LittleEndian::read_u64(&buf[8..16]),
    )
}

/// Writes the V4 midpoint footer (checksum excluded).
pub fn write_midpoint_footer<W: Write>(w: &mut W, midpoint_count: u64) -> IoResult<()> {
    w.write_u32::<LittleEndian>(midpoint_count as u32)?;
    w.write_u8(PTableVersion::V4.as_u8())?;
    w.write_all(&[0u8; 3])?;
    w.write_u32::<LittleEndian>(PTABLE_MAGIC)
}

/// Parsed V4 footer: `(midpoint_count, raw version byte, magic)`.
#[must_use]
pub fn read_midpoint_footer(buf: &[u8]) -> (u64, u8, u32) {
    (
        LittleEndian::read_u32(&buf[0..4]) as u64,
        buf[4],
        LittleEndian::read_u32(&buf[8..12]),
    )
}

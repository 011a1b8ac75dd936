//! Stream id hashing.
//!
//! The 64-bit stream hash is two independent 32-bit hashes of the stream
//! id: xxh32 in the upper half, the low half of xxh3 in the lower half.
//! V1 tables keep only the upper half.

use xxhash_rust::xxh3::xxh3_64;
use xxhash_rust::xxh32::xxh32;

/// Hashes a stream id to the value stored in index entries.
#[must_use]
pub fn stream_hash(stream_id: &str) -> u64 {
    let bytes = stream_id.as_bytes();
    let high = u64::from(xxh32(bytes, 0));
    let low = xxh3_64(bytes) & 0xFFFF_FFFF;
    (high << 32) | low
}

/// One event as handed over by the log: stream id, event number and log
/// position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKey {
    pub stream_id: String,
    pub version: i64,
    pub position: i64,
}

impl IndexKey {
    pub fn new(stream_id: impl Into<String>, version: i64, position: i64) -> Self {
        Self {
            stream_id: stream_id.into(),
            version,
            position,
        }
    }

    #[must_use]
    pub fn hash(&self) -> u64 {
        stream_hash(&self.stream_id)
    }
}

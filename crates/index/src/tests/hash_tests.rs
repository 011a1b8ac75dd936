use crate::*;
use xxhash_rust::xxh32::xxh32;

#[test]
fn hash_is_stable_per_stream() {
    assert_eq!(stream_hash("account-42"), stream_hash("account-42"));
    assert_ne!(stream_hash("account-42"), stream_hash("account-43"));
}

#[test]
fn upper_half_is_xxh32() {
    let h = stream_hash("orders");
    assert_eq!((h >> 32) as u32, xxh32(b"orders", 0));
}

#[test]
fn index_key_hashes_its_stream() {
    let key = IndexKey::new("orders", 3, 900);
    assert_eq!(key.hash(), stream_hash("orders"));
    assert_eq!(key.version, 3);
    assert_eq!(key.position, 900);
}

#[test]
fn empty_stream_id_hashes() {
    // Must not panic; the value itself is whatever the hashes give.
    let _ = stream_hash("");
}

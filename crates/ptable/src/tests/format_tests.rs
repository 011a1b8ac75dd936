use crate::format::*;
use crate::*;

// -------------------- Versions --------------------

#[test]
fn entry_sizes_per_version() {
    assert_eq!(PTableVersion::V1.entry_size(), 16);
    assert_eq!(PTableVersion::V2.entry_size(), 20);
    assert_eq!(PTableVersion::V3.entry_size(), 24);
    assert_eq!(PTableVersion::V4.entry_size(), 24);
    assert!(PTableVersion::V4.has_midpoints());
    assert!(!PTableVersion::V3.has_midpoints());
}

#[test]
fn version_bytes_roundtrip_and_reject_unknown() {
    for v in 1..=4u8 {
        assert_eq!(PTableVersion::from_u8(v).map(PTableVersion::as_u8), Some(v));
    }
    assert_eq!(PTableVersion::from_u8(0), None);
    assert_eq!(PTableVersion::from_u8(5), None);
}

#[test]
fn v1_keeps_upper_half_of_stream_hash() {
    let e = IndexEntry::new(0x1234_5678_9ABC_DEF0, 7, 99);
    let mut buf = Vec::new();
    PTableVersion::V1.write_entry(&mut buf, &e).unwrap();
    assert_eq!(buf.len(), 16);
    let back = PTableVersion::V1.read_entry(&buf);
    assert_eq!(back, IndexEntry::new(0x1234_5678_0000_0000, 7, 99));
}

#[test]
fn rewrites_of_v1_tables_stay_v1() {
    use PTableVersion::*;
    assert_eq!(V4.for_rewrite_of([V3, V4]), V4);
    assert_eq!(V2.for_rewrite_of([V4]), V2);
    assert_eq!(V4.for_rewrite_of([V4, V1]), V1);
    assert_eq!(V3.for_rewrite_of([]), V3);
}

#[test]
fn v3_entry_codec_is_lossless() {
    let e = IndexEntry::new(u64::MAX, i64::MAX, 1 << 40);
    let mut buf = Vec::new();
    PTableVersion::V3.write_entry(&mut buf, &e).unwrap();
    assert_eq!(PTableVersion::V3.read_entry(&buf), e);
}

// -------------------- Midpoint sizing --------------------

#[test]
fn no_midpoints_below_v4_or_when_empty() {
    for v in [PTableVersion::V1, PTableVersion::V2, PTableVersion::V3] {
        assert_eq!(required_midpoint_count(1000, v, 16), 0);
    }
    assert_eq!(required_midpoint_count(0, PTableVersion::V4, 16), 0);
}

#[test]
fn tiny_tables_get_two_midpoints() {
    assert_eq!(required_midpoint_count(1, PTableVersion::V4, 16), 2);
    assert_eq!(required_midpoint_count(2, PTableVersion::V4, 16), 2);
    assert_eq!(required_midpoint_count(3, PTableVersion::V4, 0), 2);
}

#[test]
fn midpoint_count_is_monotonic_and_bounded() {
    let counts: Vec<u64> = (0..200)
        .chain((200..5_000).step_by(97))
        .chain([1 << 16, 1 << 20, 5_000_000, 40_000_000])
        .collect();

    for d in 0..=32u32 {
        let mut prev = 0;
        for &n in &counts {
            let m = required_midpoint_count(n, PTableVersion::V4, d);
            assert!(m >= prev, "not monotonic in n: n={} d={}", n, d);
            prev = m;

            let lower = (1u64 << d.min(MAX_DEPTH)).min(n);
            let upper = n.max(2);
            assert!(m >= lower && m <= upper, "n={} d={} m={}", n, d, m);
        }
    }

    for &n in &counts {
        let mut prev = 0;
        for d in 0..=32u32 {
            let m = required_midpoint_count(n, PTableVersion::V4, d);
            assert!(m >= prev, "not monotonic in depth: n={} d={}", n, d);
            prev = m;
        }
    }
}

#[test]
fn depth_grows_with_size_and_caps() {
    assert_eq!(depth_for(0, 0), 0);
    assert_eq!(depth_for(8 * 1024, 0), 0);
    assert_eq!(depth_for(8 * 1024 + 1, 0), 1);
    assert_eq!(depth_for(u64::MAX, 0), MAX_DEPTH);
    assert_eq!(depth_for(0, 40), MAX_DEPTH);
    assert_eq!(depth_for(10, 12), 12);
}

#[test]
fn midpoint_indexes_span_the_table() {
    let n = 1000;
    let m = 17;
    let idx: Vec<u64> = (0..m).map(|k| midpoint_index(k, n, m)).collect();
    assert_eq!(idx[0], 0);
    assert_eq!(idx[m as usize - 1], n - 1);
    assert!(idx.windows(2).all(|w| w[0] < w[1]));
}

// -------------------- File sizes --------------------

#[test]
fn file_size_with_midpoints_is_never_smaller() {
    for n in [0u64, 1, 2, 10, 1000, 100_000] {
        for v in crate::tests::helpers::ALL_VERSIONS {
            let m = required_midpoint_count(n, v, 16);
            let with = file_size(n, v, m).unwrap();
            let without = HEADER_SIZE + n * v.entry_size() + v.footer_size();
            if v.has_midpoints() {
                assert!(with >= without);
            } else {
                assert_eq!(with, without);
            }
        }
    }
}

#[test]
fn file_size_overflow_is_none() {
    let v = PTableVersion::V3;
    assert_eq!(file_size(u64::MAX / v.entry_size(), v, 0), None);
    assert_eq!(file_size(0, PTableVersion::V4, u64::MAX / 8), None);
    assert_eq!(file_size(0, v, 0), Some(HEADER_SIZE + CHECKSUM_SIZE));
}

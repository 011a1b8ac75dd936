use super::*;
use std::sync::Arc;
use std::thread;

fn table_with(entries: &[(u64, i64, i64)]) -> MemTable {
    let m = MemTable::new();
    for &(s, v, p) in entries {
        m.add(s, v, p);
    }
    m
}

// -------------------- Ordering --------------------

#[test]
fn entries_order_by_stream_then_version_then_position() {
    let mut v = vec![
        IndexEntry::new(2, 0, 5),
        IndexEntry::new(1, 3, 1),
        IndexEntry::new(1, 1, 9),
        IndexEntry::new(1, 1, 2),
    ];
    v.sort();
    assert_eq!(
        v,
        vec![
            IndexEntry::new(1, 1, 2),
            IndexEntry::new(1, 1, 9),
            IndexEntry::new(1, 3, 1),
            IndexEntry::new(2, 0, 5),
        ]
    );
}

#[test]
fn iterate_all_in_order_is_sorted() {
    let m = table_with(&[(7, 2, 30), (3, 0, 10), (7, 0, 20), (3, 1, 5), (7, 1, 25)]);
    let all: Vec<_> = m.iterate_all_in_order().collect();
    let mut sorted = all.clone();
    sorted.sort();
    assert_eq!(all, sorted);
    assert_eq!(all.len(), 5);
}

#[test]
fn empty_and_single_entry_tables_iterate() {
    let m = MemTable::new();
    assert_eq!(m.iterate_all_in_order().count(), 0);
    assert!(m.is_empty());

    m.add(1, 0, 0);
    let all: Vec<_> = m.iterate_all_in_order().collect();
    assert_eq!(all, vec![IndexEntry::new(1, 0, 0)]);
}

// -------------------- Point lookups --------------------

#[test]
fn one_value_exact_match() {
    let m = table_with(&[(1, 0, 100), (1, 1, 200), (2, 0, 300)]);
    assert_eq!(m.try_get_one_value(1, 1), Some(200));
    assert_eq!(m.try_get_one_value(2, 0), Some(300));
    assert_eq!(m.try_get_one_value(1, 2), None);
    assert_eq!(m.try_get_one_value(3, 0), None);
}

#[test]
fn one_value_duplicate_key_returns_highest_position() {
    let m = table_with(&[(1, 0, 100), (1, 0, 150), (1, 0, 120)]);
    assert_eq!(m.try_get_one_value(1, 0), Some(150));
    assert_eq!(m.len(), 3);
}

#[test]
fn exact_duplicates_collapse() {
    let m = table_with(&[(1, 0, 100), (1, 0, 100)]);
    assert_eq!(m.len(), 1);
}

#[test]
fn latest_and_oldest() {
    let m = table_with(&[(5, 3, 30), (5, 0, 1), (5, 7, 70), (6, 9, 90)]);
    assert_eq!(m.try_get_latest_entry(5), Some(IndexEntry::new(5, 7, 70)));
    assert_eq!(m.try_get_oldest_entry(5), Some(IndexEntry::new(5, 0, 1)));
    assert_eq!(m.try_get_latest_entry(4), None);
    assert_eq!(m.try_get_oldest_entry(4), None);
}

#[test]
fn next_and_previous() {
    let m = table_with(&[(5, 0, 1), (5, 3, 30), (5, 7, 70)]);
    assert_eq!(m.try_get_next_entry(5, 0), Some(IndexEntry::new(5, 3, 30)));
    assert_eq!(m.try_get_next_entry(5, 7), None);
    assert_eq!(m.try_get_previous_entry(5, 7), Some(IndexEntry::new(5, 3, 30)));
    assert_eq!(m.try_get_previous_entry(5, 0), None);
}

// -------------------- Ranges --------------------

#[test]
fn range_is_inclusive_and_descending() {
    let m = MemTable::new();
    for v in 0..10 {
        m.add(1, v, v * 10);
    }
    m.add(2, 4, 999);

    let r = m.get_range(1, 2, 5, None);
    let versions: Vec<_> = r.iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![5, 4, 3, 2]);
    assert!(r.iter().all(|e| e.stream == 1));
}

#[test]
fn range_honors_limit() {
    let m = MemTable::new();
    for v in 0..10 {
        m.add(1, v, v);
    }
    let r = m.get_range(1, 0, 9, Some(3));
    let versions: Vec<_> = r.iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![9, 8, 7]);
}

#[test]
fn inverted_range_is_empty() {
    let m = table_with(&[(1, 0, 0), (1, 1, 1)]);
    assert!(m.get_range(1, 1, 0, None).is_empty());
}

// -------------------- Batches --------------------

#[test]
fn batch_is_visible_after_return() {
    let m = MemTable::new();
    m.add_entries(&[IndexEntry::new(9, 0, 10), IndexEntry::new(9, 1, 20)]);
    assert_eq!(m.try_get_one_value(9, 0), Some(10));
    assert_eq!(m.try_get_one_value(9, 1), Some(20));
}

#[test]
fn readers_never_observe_half_a_batch() {
    let m = Arc::new(MemTable::new());
    const BATCHES: i64 = 2_000;

    let reader = {
        let m = Arc::clone(&m);
        thread::spawn(move || {
            let mut checks = 0u64;
            loop {
                let latest = m.try_get_latest_entry(1);
                if let Some(e) = latest {
                    // Every batch writes versions 2k and 2k+1 together.
                    assert_eq!(e.version % 2, 1, "observed a partial batch: {:?}", e);
                    if e.version == BATCHES * 2 - 1 {
                        return checks;
                    }
                }
                checks += 1;
            }
        })
    };

    for k in 0..BATCHES {
        m.add_entries(&[
            IndexEntry::new(1, 2 * k, 2 * k),
            IndexEntry::new(1, 2 * k + 1, 2 * k + 1),
        ]);
    }
    reader.join().expect("reader panicked");
}

// -------------------- Conversion --------------------

#[test]
fn mark_for_conversion_wins_once() {
    let m = MemTable::new();
    assert!(!m.is_frozen());
    assert!(m.mark_for_conversion());
    assert!(!m.mark_for_conversion());
    assert!(m.is_frozen());
}

#[test]
fn frozen_table_still_serves_reads() {
    let m = table_with(&[(1, 0, 42)]);
    m.mark_for_conversion();
    assert_eq!(m.try_get_one_value(1, 0), Some(42));
}

#[test]
#[should_panic(expected = "marked for conversion")]
fn add_to_frozen_table_panics() {
    let m = MemTable::new();
    m.mark_for_conversion();
    m.add(1, 0, 0);
}

#[test]
#[should_panic(expected = "version must be non-negative")]
fn negative_version_panics() {
    MemTable::new().add(1, -1, 0);
}

#[test]
fn with_id_keeps_id() {
    let id = Uuid::new_v4();
    assert_eq!(MemTable::with_id(id).id(), id);
}

use super::helpers::*;
use crate::*;
use anyhow::Result;
use memtable::MemTable;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::tempdir;

const A: u64 = 1 << 32;
const B: u64 = 2 << 32;
const C: u64 = 3 << 32;

fn table(dir: &std::path::Path, entries: &[IndexEntry]) -> Result<Arc<PTable>> {
    Ok(Arc::new(PTable::create_from_sorted(
        table_path(dir),
        entries.iter().copied(),
        PTableVersion::V4,
        &PTableOptions::default(),
    )?))
}

// -------------------- MergeIterator --------------------

#[test]
fn disjoint_inputs_interleave() {
    let a = MemTable::new();
    let b = MemTable::new();
    a.add(A, 0, 1);
    a.add(C, 0, 3);
    b.add(B, 0, 2);

    let merged: Vec<_> = MergeIterator::new(&[&a, &b]).collect();
    assert_eq!(
        merged,
        vec![IndexEntry::new(A, 0, 1), IndexEntry::new(B, 0, 2), IndexEntry::new(C, 0, 3)]
    );
}

#[test]
fn newest_input_wins_per_key() -> Result<()> {
    let dir = tempdir()?;
    let old = table(
        dir.path(),
        &[IndexEntry::new(A, 0, 10), IndexEntry::new(A, 1, 11), IndexEntry::new(B, 0, 20)],
    )?;
    let mid = table(
        dir.path(),
        &[IndexEntry::new(A, 1, 31), IndexEntry::new(A, 1, 32), IndexEntry::new(C, 0, 40)],
    )?;
    let new = table(dir.path(), &[IndexEntry::new(A, 1, 51), IndexEntry::new(B, 0, 60)])?;

    let merged: Vec<_> = MergeIterator::new(&[new.as_ref(), mid.as_ref(), old.as_ref()]).collect();
    assert_eq!(
        merged,
        vec![
            IndexEntry::new(A, 0, 10),
            IndexEntry::new(A, 1, 51),
            IndexEntry::new(B, 0, 60),
            IndexEntry::new(C, 0, 40),
        ]
    );
    Ok(())
}

#[test]
fn duplicates_inside_the_owning_input_are_kept() {
    let newer = MemTable::new();
    let older = MemTable::new();
    newer.add(A, 4, 7);
    newer.add(A, 4, 9);
    older.add(A, 4, 1);

    let merged: Vec<_> = MergeIterator::new(&[&newer, &older]).collect();
    assert_eq!(merged, vec![IndexEntry::new(A, 4, 7), IndexEntry::new(A, 4, 9)]);
}

#[test]
fn empty_inputs_are_harmless() {
    let empty = MemTable::new();
    let one = MemTable::new();
    one.add(B, 1, 1);
    assert_eq!(MergeIterator::new(&[&empty, &one, &empty]).count(), 1);
    assert_eq!(MergeIterator::new::<MemTable>(&[]).count(), 0);
}

// -------------------- PTable::merge --------------------

#[test]
fn merge_writes_a_readable_table() -> Result<()> {
    let dir = tempdir()?;
    let older = table(dir.path(), &sample_entries(4, 30))?;
    let newer_entries: Vec<_> = sample_entries(4, 30)
        .into_iter()
        .filter(|e| e.version % 3 == 0)
        .map(|e| IndexEntry::new(e.stream, e.version, e.position + 1))
        .collect();
    let newer = table(dir.path(), &newer_entries)?;

    let out = table_path(dir.path());
    let merged = PTable::merge(
        &[Arc::clone(&newer), Arc::clone(&older)],
        &out,
        PTableVersion::V4,
        &PTableOptions::default(),
        &AtomicBool::new(false),
    )?;

    assert_eq!(merged.count(), older.count());
    for e in sample_entries(4, 30) {
        let expected = if e.version % 3 == 0 { e.position + 1 } else { e.position };
        assert_eq!(merged.try_get_one_value(e.stream, e.version), Some(expected));
    }
    // Inputs survive the merge.
    assert!(older.path().exists() && newer.path().exists());
    Ok(())
}

#[test]
fn merge_can_downgrade_to_an_older_format() -> Result<()> {
    let dir = tempdir()?;
    let a = table(dir.path(), &[IndexEntry::new(A, 0, 1)])?;
    let b = table(dir.path(), &[IndexEntry::new(B, 0, 2)])?;
    let merged = PTable::merge(
        &[a, b],
        &table_path(dir.path()),
        PTableVersion::V2,
        &PTableOptions::default(),
        &AtomicBool::new(false),
    )?;
    assert_eq!(merged.version(), PTableVersion::V2);
    assert_eq!(merged.count(), 2);
    Ok(())
}

#[test]
fn v1_input_keeps_the_merge_at_v1() -> Result<()> {
    // Full hashes with a lower half that V1 cannot store.
    let old_stream = 0x1111_1111_2222_2222u64;
    let new_stream = 0x3333_3333_4444_4444u64;
    let dir = tempdir()?;
    let opts = PTableOptions::default();
    let legacy = Arc::new(PTable::create_from_sorted(
        table_path(dir.path()),
        (0..4).map(|v| IndexEntry::new(old_stream, v, v)),
        PTableVersion::V1,
        &opts,
    )?);
    let current = Arc::new(PTable::create_from_sorted(
        table_path(dir.path()),
        (0..4).map(|v| IndexEntry::new(new_stream, v, 100 + v)),
        PTableVersion::V4,
        &opts,
    )?);

    let merged = PTable::merge(
        &[current, legacy],
        &table_path(dir.path()),
        PTableVersion::V4,
        &opts,
        &AtomicBool::new(false),
    )?;

    assert_eq!(merged.version(), PTableVersion::V1);
    assert_eq!(merged.count(), 8);
    for v in 0..4 {
        assert_eq!(merged.try_get_one_value(old_stream, v), Some(v));
        assert_eq!(merged.try_get_one_value(new_stream, v), Some(100 + v));
    }
    Ok(())
}

#[test]
fn aborted_merge_leaves_nothing_behind() -> Result<()> {
    let dir = tempdir()?;
    let a = table(dir.path(), &sample_entries(2, 10))?;
    let b = table(dir.path(), &sample_entries(3, 10))?;
    let out = table_path(dir.path());

    let err = PTable::merge(
        &[a, b],
        &out,
        PTableVersion::V4,
        &PTableOptions::default(),
        &AtomicBool::new(true),
    )
    .unwrap_err();
    assert!(matches!(err, PTableError::Aborted));
    assert!(!out.exists());
    assert_eq!(tmp_files(dir.path()), 0);
    Ok(())
}

use super::helpers::*;
use crate::*;
use anyhow::Result;
use config::IndexConfig;
use tempfile::tempdir;

// -------------------- Lifecycle --------------------

#[test]
fn invalid_config_is_rejected() {
    let config = IndexConfig {
        max_tables_per_level: 1,
        ..IndexConfig::default()
    };
    assert!(matches!(
        TableIndex::new("unused", config),
        Err(IndexError::Config(ConfigError::TablesPerLevel(1)))
    ));
}

#[test]
fn writes_need_an_initialized_index() -> Result<()> {
    let dir = tempdir()?;
    let index = TableIndex::new(dir.path(), IndexConfig::default())?;
    assert_eq!(index.state(), IndexState::Uninitialized);
    assert!(matches!(
        index.add(0, "s", 0, 0),
        Err(IndexError::NotReady(IndexState::Uninitialized))
    ));
    assert!(matches!(index.try_get_one_value("s", 0), Err(IndexError::NotReady(_))));

    index.initialize(0)?;
    assert_eq!(index.state(), IndexState::Ready);
    index.add(0, "s", 0, 0)?;

    index.close(false)?;
    assert_eq!(index.state(), IndexState::Closed);
    assert!(matches!(index.add(1, "s", 1, 1), Err(IndexError::NotReady(IndexState::Closed))));
    // Closing twice is harmless.
    index.close(false)?;
    Ok(())
}

// -------------------- add / add_entries --------------------

#[test]
fn add_and_read_back() -> Result<()> {
    let dir = tempdir()?;
    let index = open_index(dir.path(), IndexConfig::default())?;

    index.add(10, "orders", 0, 10)?;
    index.add(20, "orders", 1, 20)?;

    assert_eq!(index.try_get_one_value("orders", 1)?, Some(20));
    assert_eq!(
        index.try_get_latest_entry("orders")?,
        Some(IndexEntry::new(stream_hash("orders"), 1, 20))
    );
    assert_eq!(index.try_get_one_value("orders", 2)?, None);
    // Nothing is persisted yet.
    assert_eq!(index.commit_checkpoint(), -1);
    assert_eq!(index.index_map().table_count(), 0);
    Ok(())
}

#[test]
fn negative_arguments_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let index = open_index(dir.path(), IndexConfig::default())?;

    assert!(matches!(index.add(-1, "s", 0, 0), Err(IndexError::InvalidArgument(_))));
    assert!(matches!(index.add(0, "s", -1, 0), Err(IndexError::InvalidArgument(_))));
    assert!(matches!(index.add(0, "s", 0, -5), Err(IndexError::InvalidArgument(_))));
    assert!(matches!(
        index.add_entries(3, &[IndexKey::new("a", 0, 1), IndexKey::new("b", -2, 2)]),
        Err(IndexError::InvalidArgument(_))
    ));
    // A rejected batch leaves nothing behind.
    assert_eq!(index.try_get_one_value("a", 0)?, None);
    Ok(())
}

#[test]
fn commit_position_must_not_go_back() -> Result<()> {
    let dir = tempdir()?;
    let index = open_index(dir.path(), IndexConfig::default())?;

    index.add(100, "s", 0, 100)?;
    index.add(100, "s", 1, 100)?;
    match index.add(50, "s", 2, 50) {
        Err(IndexError::CheckpointRegression { kind, current, attempted }) => {
            assert_eq!((kind, current, attempted), ("commit", 100, 50));
        }
        other => panic!("expected regression, got {:?}", other),
    }
    Ok(())
}

#[test]
fn batch_is_indexed_under_one_commit() -> Result<()> {
    let dir = tempdir()?;
    let index = open_index(dir.path(), IndexConfig::default())?;

    index.add_entries(
        50,
        &[
            IndexKey::new("a", 0, 40),
            IndexKey::new("b", 0, 45),
            IndexKey::new("a", 1, 50),
        ],
    )?;
    assert_eq!(index.try_get_one_value("a", 1)?, Some(50));
    assert_eq!(index.try_get_one_value("b", 0)?, Some(45));

    index.force_flush()?;
    index.wait_for_background_tasks(WAIT)?;
    assert_eq!(index.prepare_checkpoint(), 50);
    assert_eq!(index.commit_checkpoint(), 50);
    Ok(())
}

#[test]
fn prehashed_entries() -> Result<()> {
    let dir = tempdir()?;
    let index = open_index(dir.path(), IndexConfig::default())?;

    index.add_hashed_entries(5, &[IndexEntry::new(42, 0, 5), IndexEntry::new(42, 1, 5)])?;
    assert_eq!(index.try_get_one_value_by_hash(42, 1)?, Some(5));
    assert_eq!(index.try_get_oldest_entry_by_hash(42)?, Some(IndexEntry::new(42, 0, 5)));
    Ok(())
}

// -------------------- Memtable switch --------------------

#[test]
fn full_memtable_is_persisted() -> Result<()> {
    let dir = tempdir()?;
    let index = open_index(dir.path(), small_config())?;

    add_events(&index, "s", 0..4, 0)?;
    index.wait_for_background_tasks(WAIT)?;

    assert_eq!(index.frozen_memtable_count(), 0);
    assert!(!index.is_background_task_running());
    let map = index.index_map();
    assert_eq!(map.table_count(), 1);
    assert_eq!(map.prepare_checkpoint(), 3);
    assert_eq!(map.commit_checkpoint(), 3);
    assert_eq!(ptable_files(dir.path()), 1);
    assert!(dir.path().join("indexmap").exists());
    for v in 0..4 {
        assert_eq!(index.try_get_one_value("s", v)?, Some(v));
    }
    Ok(())
}

#[test]
fn force_flush_persists_a_partial_memtable() -> Result<()> {
    let dir = tempdir()?;
    let index = open_index(dir.path(), IndexConfig::default())?;

    add_events(&index, "s", 0..3, 10)?;
    index.force_flush()?;
    index.wait_for_background_tasks(WAIT)?;
    assert_eq!(index.index_map().table_count(), 1);
    assert_eq!(index.commit_checkpoint(), 12);

    // Empty memtable: nothing to do.
    index.force_flush()?;
    index.wait_for_background_tasks(WAIT)?;
    assert_eq!(index.index_map().table_count(), 1);
    assert_eq!(index.try_get_latest_entry("s")?.map(|e| e.version), Some(2));
    Ok(())
}

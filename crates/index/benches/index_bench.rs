use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use config::IndexConfig;
use index::TableIndex;
use std::time::Duration;
use tempfile::tempdir;

const N_EVENTS: i64 = 10_000;
const STREAMS: i64 = 100;

fn config() -> IndexConfig {
    IndexConfig {
        max_memtable_entries: 2_000,
        ..IndexConfig::default()
    }
}

fn fill(index: &TableIndex) {
    for i in 0..N_EVENTS {
        let stream = format!("stream-{}", i % STREAMS);
        index.add(i, &stream, i / STREAMS, i).unwrap();
    }
}

fn index_write_benchmark(c: &mut Criterion) {
    c.bench_function("index_add_10k_with_flushes", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let index = TableIndex::new(dir.path(), config()).unwrap();
                index.initialize(0).unwrap();
                (dir, index)
            },
            |(_dir, index)| {
                fill(&index);
                index.wait_for_background_tasks(Duration::from_secs(60)).unwrap();
            },
            BatchSize::SmallInput,
        );
    });
}

fn index_read_benchmark(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let index = TableIndex::new(dir.path(), config()).unwrap();
    index.initialize(0).unwrap();
    fill(&index);
    index.wait_for_background_tasks(Duration::from_secs(60)).unwrap();
    let streams: Vec<String> = (0..STREAMS).map(|s| format!("stream-{}", s)).collect();

    c.bench_function("index_latest_entry_100_streams", |b| {
        b.iter(|| {
            for s in &streams {
                assert!(index.try_get_latest_entry(s).unwrap().is_some());
            }
        });
    });

    c.bench_function("index_range_100_streams", |b| {
        b.iter(|| {
            for s in &streams {
                assert_eq!(index.get_range(s, 0, 1_000, Some(20)).unwrap().len(), 20);
            }
        });
    });
}

criterion_group!(benches, index_write_benchmark, index_read_benchmark);
criterion_main!(benches);

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use engine::{EngineConfig, FsyncPolicy, StorageEngine};
use std::time::Duration;
use tempfile::{tempdir, TempDir};

const N_KEYS: usize = 5_000;
const VALUE_SIZE: usize = 100;

fn open_engine() -> (TempDir, StorageEngine) {
    let dir = tempdir().unwrap();
    let config = EngineConfig::new(dir.path())
        .fsync_policy(FsyncPolicy::Interval(Duration::from_millis(50)))
        .memtable_flush_bytes(256 * 1024);
    let engine = StorageEngine::open(config).unwrap();
    (dir, engine)
}

fn populated_engine() -> (TempDir, StorageEngine) {
    let (dir, engine) = open_engine();
    let value = vec![b'x'; VALUE_SIZE];
    for i in 0..N_KEYS {
        engine.put(format!("key{i:05}"), &value).unwrap();
    }
    engine.flush().unwrap();
    (dir, engine)
}

fn engine_put_benchmark(c: &mut Criterion) {
    let value = vec![b'x'; VALUE_SIZE];
    c.bench_function("engine_put_5k", |b| {
        b.iter_batched(
            open_engine,
            |(_dir, engine)| {
                for i in 0..N_KEYS {
                    engine.put(format!("key{i:05}"), &value).unwrap();
                }
                engine.close().unwrap();
            },
            BatchSize::PerIteration,
        );
    });
}

fn engine_put_batch_benchmark(c: &mut Criterion) {
    let entries: Vec<(String, Vec<u8>)> = (0..N_KEYS)
        .map(|i| (format!("key{i:05}"), vec![b'x'; VALUE_SIZE]))
        .collect();
    c.bench_function("engine_put_batch_5k", |b| {
        b.iter_batched(
            open_engine,
            |(_dir, engine)| {
                engine.put_batch(entries.iter().map(|(k, v)| (k, v))).unwrap();
                engine.close().unwrap();
            },
            BatchSize::PerIteration,
        );
    });
}

fn engine_get_benchmark(c: &mut Criterion) {
    let (_dir, engine) = populated_engine();
    c.bench_function("engine_get_hit_5k", |b| {
        b.iter(|| {
            for i in 0..N_KEYS {
                assert!(engine.get(format!("key{i:05}")).unwrap().is_some());
            }
        });
    });
}

fn engine_range_benchmark(c: &mut Criterion) {
    let (_dir, engine) = populated_engine();
    c.bench_function("engine_range_500", |b| {
        b.iter(|| {
            let got = engine.get_range("key01000", "key01499").unwrap();
            assert_eq!(got.len(), 500);
        });
    });
}

criterion_group!(
    benches,
    engine_put_benchmark,
    engine_put_batch_benchmark,
    engine_get_benchmark,
    engine_range_benchmark
);
criterion_main!(benches);

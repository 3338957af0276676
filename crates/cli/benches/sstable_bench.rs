use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use memtable::Memtable;
use sstable::{Segment, SegmentWriter};
use tempfile::{tempdir, TempDir};

const N_KEYS: usize = 10_000;
const VALUE_SIZE: usize = 100;
const SPARSE_EVERY: usize = 16;

fn build_memtable() -> Memtable {
    let mem = Memtable::new();
    for i in 0..N_KEYS {
        mem.put(format!("key{i:05}").into_bytes(), vec![b'x'; VALUE_SIZE], i as u64 + 1)
            .unwrap();
    }
    mem
}

fn build_segment() -> (TempDir, Segment) {
    let dir = tempdir().unwrap();
    let mem = build_memtable();
    let segment = SegmentWriter::build(dir.path(), 1, SPARSE_EVERY, mem.iter()).unwrap();
    (dir, segment)
}

fn segment_write_benchmark(c: &mut Criterion) {
    c.bench_function("segment_write_from_memtable_10k", |b| {
        b.iter_batched(
            || (tempdir().unwrap(), build_memtable()),
            |(dir, mem)| {
                SegmentWriter::build(dir.path(), 1, SPARSE_EVERY, mem.iter()).unwrap();
            },
            BatchSize::SmallInput,
        );
    });
}

fn segment_get_hit_benchmark(c: &mut Criterion) {
    let (_dir, segment) = build_segment();
    c.bench_function("segment_get_hit_10k", |b| {
        b.iter(|| {
            for i in 0..N_KEYS {
                let key = format!("key{i:05}").into_bytes();
                assert!(segment.get(&key).unwrap().is_some());
            }
        });
    });
}

fn segment_get_miss_benchmark(c: &mut Criterion) {
    let (_dir, segment) = build_segment();
    c.bench_function("segment_get_miss_10k", |b| {
        b.iter(|| {
            for i in 0..N_KEYS {
                let key = format!("key{i:05}x").into_bytes();
                assert!(segment.get(&key).unwrap().is_none());
            }
        });
    });
}

fn segment_range_benchmark(c: &mut Criterion) {
    let (_dir, segment) = build_segment();
    c.bench_function("segment_range_1k_of_10k", |b| {
        b.iter(|| {
            let n = segment
                .range_scan(b"key04000", b"key04999")
                .filter_map(|r| r.ok())
                .count();
            assert_eq!(n, 1000);
        });
    });
}

criterion_group!(
    benches,
    segment_write_benchmark,
    segment_get_hit_benchmark,
    segment_get_miss_benchmark,
    segment_range_benchmark
);
criterion_main!(benches);

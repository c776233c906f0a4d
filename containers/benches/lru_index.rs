//! Benchmarks for [`LruIndex`] at the working-set sizes the asset cache runs with.
//!
//! - Touch: re-touching every key in a full index (get/set path)
//! - Evict: draining the index from the least recently used end

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use vista_containers::prelude::LruIndex;

fn benchmark_lru_touch(c: &mut Criterion) {
    let mut group = c.benchmark_group("lru_index_touch");
    for size in [10u64, 50, 200].iter() {
        let mut index: LruIndex<u64> = LruIndex::new();
        for i in 0..*size {
            index.touch(&i);
        }
        group.bench_with_input(BenchmarkId::new("LruIndex", size), size, |b, &size| {
            b.iter(|| {
                for i in 0..size {
                    index.touch(black_box(&i));
                }
            });
        });
    }
    group.finish();
}

fn benchmark_lru_evict(c: &mut Criterion) {
    let mut group = c.benchmark_group("lru_index_evict");
    for size in [10u64, 50, 200].iter() {
        group.bench_with_input(BenchmarkId::new("LruIndex", size), size, |b, &size| {
            b.iter(|| {
                let mut index: LruIndex<u64> = LruIndex::new();
                for i in 0..size {
                    index.touch(&i);
                }
                while let Some(key) = index.pop_least_recent() {
                    black_box(key);
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_lru_touch, benchmark_lru_evict);
criterion_main!(benches);

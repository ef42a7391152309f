//! Benchmarks for deduplicated adds, lookups and compaction.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use genstore::{BufferTypeConfig, EnumStore, GenerationHandler};
use std::collections::BTreeMap;

/// Keys with roughly four references per distinct value.
fn generate_keys(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("user:{:08}", (i * 7919) % (n / 4).max(1))).collect()
}

fn bench_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("add");

    for size in [1_000, 10_000, 100_000] {
        let keys = generate_keys(size);

        group.bench_with_input(BenchmarkId::new("BTreeMap", size), &keys, |b, keys| {
            b.iter(|| {
                let mut map: BTreeMap<String, u32> = BTreeMap::new();
                for key in keys {
                    *map.entry(key.clone()).or_default() += 1;
                }
                black_box(map)
            });
        });

        group.bench_with_input(BenchmarkId::new("EnumStore", size), &keys, |b, keys| {
            b.iter(|| {
                let handler = GenerationHandler::new();
                let mut store: EnumStore<String> =
                    EnumStore::new(0, BufferTypeConfig::default(), &handler).unwrap();
                for key in keys {
                    store.add(key).unwrap();
                }
                black_box(store.num_uniques())
            });
        });
    }

    group.finish();
}

fn bench_reader_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("reader_get");

    for size in [1_000, 10_000, 100_000] {
        let keys = generate_keys(size);
        let handler = GenerationHandler::new();
        let mut store: EnumStore<String> = EnumStore::new(0, BufferTypeConfig::default(), &handler).unwrap();
        let refs: Vec<_> = keys.iter().map(|k| store.add(k).unwrap().entry_ref).collect();
        let reader = store.reader();

        group.bench_with_input(BenchmarkId::new("EnumStore", size), &refs, |b, refs| {
            b.iter(|| {
                let guard = handler.take_guard();
                let mut total = 0usize;
                for r in refs {
                    total += reader.get(*r, &guard).len();
                }
                black_box(total)
            });
        });
    }

    group.finish();
}

fn bench_compaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("compaction");

    for size in [10_000, 100_000] {
        let keys = generate_keys(size);

        group.bench_with_input(BenchmarkId::new("remove_half_compact", size), &keys, |b, keys| {
            b.iter(|| {
                let mut handler = GenerationHandler::new();
                let mut store: EnumStore<String> =
                    EnumStore::new(0, BufferTypeConfig::default(), &handler).unwrap();
                let refs: Vec<_> = keys.iter().map(|k| store.add(k).unwrap().entry_ref).collect();
                for r in refs.iter().step_by(2) {
                    store.remove(*r);
                }
                store.commit(&mut handler);
                if let Some(ctx) = store.compact_worst().unwrap() {
                    black_box(ctx.map().len());
                    ctx.finish();
                }
                black_box(store.memory_usage())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_add, bench_reader_get, bench_compaction);
criterion_main!(benches);

//! Method Table Performance Benchmarks
//!
//! Measures the dispatch-critical paths of the method table: lock-free
//! lookup on hot and cold names, store-with-overwrite, and insertion
//! sequences that cross resize thresholds.
//!
//! # Performance Targets
//!
//! - Hit lookup: < 20ns (hash, mask, short chain walk)
//! - Miss lookup: < 20ns (empty or short chain)
//! - In-place overwrite store: < 100ns (mutex + field stores)

use beryl_core::{intern, Symbol, Value};
use beryl_runtime::{MethodTable, Visibility};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn populated_table(names: &[Symbol]) -> MethodTable {
    let table = MethodTable::new();
    for (i, &name) in names.iter().enumerate() {
        table.store(
            name,
            Value::nil(),
            Value::fixnum(i as i64),
            Value::nil(),
            0,
            Visibility::Public,
        );
    }
    table
}

fn intern_names(count: usize) -> Vec<Symbol> {
    (0..count).map(|i| intern(&format!("method_{}", i))).collect()
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");

    for size in [8usize, 64, 512] {
        let names = intern_names(size);
        let table = populated_table(&names);
        let hot = names[size / 2];
        let missing = intern("no_such_method");

        group.bench_with_input(BenchmarkId::new("hit", size), &size, |b, _| {
            b.iter(|| black_box(table.lookup(black_box(hot)).is_some()))
        });
        group.bench_with_input(BenchmarkId::new("miss", size), &size, |b, _| {
            b.iter(|| black_box(table.lookup(black_box(missing)).is_none()))
        });
    }

    group.finish();
}

fn bench_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("store");

    group.bench_function("overwrite_existing", |b| {
        let names = intern_names(64);
        let table = populated_table(&names);
        let name = names[7];
        let mut serial = 0u64;
        b.iter(|| {
            serial += 1;
            table.store(
                black_box(name),
                Value::nil(),
                Value::fixnum(serial as i64),
                Value::nil(),
                serial,
                Visibility::Public,
            );
        })
    });

    group.bench_function("insert_256_with_resizes", |b| {
        let names = intern_names(256);
        b.iter(|| {
            let table = MethodTable::new();
            for (i, &name) in names.iter().enumerate() {
                table.store(
                    name,
                    Value::nil(),
                    Value::fixnum(i as i64),
                    Value::nil(),
                    0,
                    Visibility::Public,
                );
            }
            black_box(table.bins())
        })
    });

    group.finish();
}

fn bench_duplicate(c: &mut Criterion) {
    let names = intern_names(128);
    let table = populated_table(&names);

    c.bench_function("duplicate_128", |b| {
        b.iter(|| black_box(table.duplicate().entries()))
    });
}

criterion_group!(benches, bench_lookup, bench_store, bench_duplicate);
criterion_main!(benches);

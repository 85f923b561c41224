//! String table performance benchmarks.
//!
//! Measures:
//! - Interning new strings (probe + region allocation)
//! - Interning duplicates (probe only)
//! - Lookup of present and absent strings
//! - Handle resolution back to bytes
//! - A mixed workload of keywords and identifiers

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use strata_mem::{MemoryConfig, MemoryManager, StringRef, StringTable};

fn identifiers(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("identifier_{i}")).collect()
}

fn raw_table() -> StringTable<u32> {
    StringTable::with_manager(MemoryManager::new(MemoryConfig::raw()), 16).unwrap()
}

fn bench_insert_new(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_new");

    for size in [10, 100, 1_000, 10_000] {
        let strings = identifiers(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &strings, |b, strings| {
            b.iter(|| {
                let mut table = raw_table();
                for (i, s) in strings.iter().enumerate() {
                    black_box(table.insert(s.as_bytes(), i as u32).unwrap());
                }
            });
        });
    }

    group.finish();
}

fn bench_insert_duplicates(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_duplicates");

    for size in [10, 100, 1_000] {
        let strings = identifiers(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &strings, |b, strings| {
            let mut table = raw_table();
            for s in strings {
                table.insert(s.as_bytes(), 0).unwrap();
            }
            b.iter(|| {
                for s in strings {
                    black_box(table.insert(s.as_bytes(), 1).unwrap());
                }
            });
        });
    }

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");
    let strings = identifiers(1_000);
    let misses: Vec<String> = (0..1_000).map(|i| format!("missing_{i}")).collect();

    let mut table = raw_table();
    for s in &strings {
        table.insert(s.as_bytes(), 0).unwrap();
    }

    group.bench_function("hit", |b| {
        b.iter(|| {
            for s in &strings {
                black_box(table.lookup(s.as_bytes()));
            }
        });
    });
    group.bench_function("miss", |b| {
        b.iter(|| {
            for s in &misses {
                black_box(table.lookup(s.as_bytes()));
            }
        });
    });

    group.finish();
}

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve");

    for size in [10, 100, 1_000, 10_000] {
        let mut table = raw_table();
        let refs: Vec<StringRef> = identifiers(size)
            .iter()
            .map(|s| table.insert(s.as_bytes(), 0).unwrap().0)
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(size), &refs, |b, refs| {
            b.iter(|| {
                for &r in refs {
                    black_box(table.bytes(r));
                }
            });
        });
    }

    group.finish();
}

fn bench_mixed_workload(c: &mut Criterion) {
    const KEYWORDS: [&str; 12] = [
        "let", "mut", "fn", "struct", "return", "if", "else", "while", "for", "match", "enum",
        "impl",
    ];
    let mut group = c.benchmark_group("mixed_workload");

    for size in [100, 1_000, 10_000] {
        let strings: Vec<String> = (0..size)
            .map(|i| {
                if i % 3 == 0 {
                    KEYWORDS[i % KEYWORDS.len()].to_string()
                } else if i % 2 == 0 {
                    format!("var_{}", i % 100)
                } else {
                    format!("unique_identifier_{i}")
                }
            })
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(size), &strings, |b, strings| {
            b.iter(|| {
                let mut table = raw_table();
                for s in strings {
                    let (r, inserted) = table.insert(s.as_bytes(), 0).unwrap();
                    if !inserted {
                        black_box(table.bytes(r));
                    }
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_insert_new,
    bench_insert_duplicates,
    bench_lookup,
    bench_resolve,
    bench_mixed_workload
);
criterion_main!(benches);

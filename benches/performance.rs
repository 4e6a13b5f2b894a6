//! Performance benchmarks for the persistence facade.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use record_facade::{PersistenceFacade, Query, StoreConfig, Timestamp, Watch};
use tempfile::TempDir;

fn in_memory() -> PersistenceFacade {
    PersistenceFacade::open(StoreConfig::in_memory()).unwrap()
}

/// Benchmark create throughput with a growing store
fn bench_create(c: &mut Criterion) {
    let mut group = c.benchmark_group("create");

    group.bench_function("in_memory", |b| {
        let facade = in_memory();
        let mut ts = 0i64;
        b.iter(|| {
            ts += 1;
            black_box(facade.create(Timestamp(ts)).unwrap());
        });
    });

    group.bench_function("durable_no_sync", |b| {
        let dir = TempDir::new().unwrap();
        let mut config = StoreConfig::at(dir.path().join("store"));
        config.sync_on_commit = false;
        let facade = PersistenceFacade::open(config).unwrap();
        let mut ts = 0i64;
        b.iter(|| {
            ts += 1;
            black_box(facade.create(Timestamp(ts)).unwrap());
        });
    });

    group.finish();
}

/// Benchmark fetching the full result set at different store sizes
fn bench_items(c: &mut Criterion) {
    let mut group = c.benchmark_group("items");

    for size in [100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("records", size), &size, |b, &size| {
            let facade = in_memory();
            for ts in 0..size {
                facade.create(Timestamp(ts)).unwrap();
            }

            b.iter(|| {
                black_box(facade.items(Query::All).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark a write that fans out to N watches
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");

    for watchers in [1, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("watchers", watchers),
            &watchers,
            |b, &watchers| {
                let facade = in_memory();
                // Keep the store small so the cost is dominated by delivery
                for ts in 0..10 {
                    facade.create(Timestamp(ts)).unwrap();
                }
                let mut watches: Vec<Watch> = (0..watchers)
                    .map(|_| facade.watch(Query::All).unwrap())
                    .collect();

                let mut ts = 1_000i64;
                b.iter(|| {
                    ts += 1;
                    facade.create(Timestamp(ts)).unwrap();
                    facade.delete(Timestamp(ts)).unwrap();
                    for watch in watches.iter_mut() {
                        while let Some(snapshot) = watch.try_next() {
                            black_box(snapshot);
                        }
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_create, bench_items, bench_fanout);
criterion_main!(benches);

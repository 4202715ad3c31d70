//! Operation store benchmarks.

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use syncwell_bench::generate_operations;
use syncwell_protocol::{OperationStatus, Timestamp};
use syncwell_store::{MemoryLogs, OperationStore, StoreConfig, WriteOrigin};
use tempfile::TempDir;

fn memory_config() -> StoreConfig {
    StoreConfig::new().sync_on_write(false)
}

/// Benchmark queueing operations in an in-memory store.
fn bench_memory_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_insert");

    for size in [64, 1024, 8192].iter() {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let store = OperationStore::in_memory().unwrap();
            b.iter_batched(
                || generate_operations(1, 16, size).remove(0),
                |op| black_box(store.insert(op).unwrap()),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark the pending -> in-flight -> completed path.
fn bench_transitions(c: &mut Criterion) {
    c.bench_function("transition_to_completed", |b| {
        let store = OperationStore::in_memory().unwrap();
        b.iter_batched(
            || store.insert(generate_operations(1, 16, 256).remove(0)).unwrap(),
            |op| {
                store
                    .transition(
                        &op.id,
                        OperationStatus::InFlight,
                        WriteOrigin::Sync,
                        Timestamp::now(),
                        |_| {},
                    )
                    .unwrap();
                let done = store
                    .transition(
                        &op.id,
                        OperationStatus::Completed,
                        WriteOrigin::Sync,
                        Timestamp::now(),
                        |_| {},
                    )
                    .unwrap();
                black_box(done);
            },
            BatchSize::SmallInput,
        );
    });
}

/// Benchmark replaying a populated log on open.
fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay");
    group.sample_size(20);

    for count in [100, 1_000, 10_000].iter() {
        let logs = MemoryLogs::default();
        {
            let (store, _) = OperationStore::open_memory(&logs, memory_config()).unwrap();
            store.insert_all(generate_operations(*count, 64, 256)).unwrap();
        }

        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| {
                let (store, report) = OperationStore::open_memory(&logs, memory_config()).unwrap();
                black_box((store.counts(), report));
            });
        });
    }

    group.finish();
}

/// Benchmark selecting the dispatch order of a large queue.
fn bench_pending_order(c: &mut Criterion) {
    let store = OperationStore::in_memory().unwrap();
    store.insert_all(generate_operations(5_000, 500, 64)).unwrap();

    c.bench_function("pending_order_5000", |b| {
        b.iter(|| black_box(store.pending().len()));
    });
}

/// Benchmark durable inserts.
fn bench_file_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_insert");
    group.sample_size(30);

    for sync in [false, true].iter() {
        group.bench_with_input(BenchmarkId::new("sync_on_write", sync), sync, |b, &sync| {
            let temp_dir = TempDir::new().unwrap();
            let (store, _) =
                OperationStore::open(temp_dir.path(), StoreConfig::new().sync_on_write(sync))
                    .unwrap();
            b.iter_batched(
                || generate_operations(1, 16, 256).remove(0),
                |op| black_box(store.insert(op).unwrap()),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_memory_insert,
    bench_transitions,
    bench_replay,
    bench_pending_order,
    bench_file_insert,
);

criterion_main!(benches);

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use triplex_core::test_utils::MemoryTripleList;
use triplex_core::{
    InsertOutcome, MemoryBudget, StorageConfig, ThreeKeysIndex, TwoKeysGroupProxy,
};
use triplex_types::{ResourceComponent, ResourceId, tuple_status};

fn triple_for(value: u64) -> [ResourceId; 3] {
    [value % 1_000 + 1, value % 50 + 1, value + 1]
}

fn config(thread_count: usize) -> StorageConfig {
    StorageConfig { initial_bucket_count: 1024, thread_count, ..StorageConfig::default() }
}

fn populate(
    store: &MemoryTripleList,
    three_keys: &ThreeKeysIndex<MemoryTripleList>,
    proxy: &TwoKeysGroupProxy<MemoryTripleList>,
    values: impl Iterator<Item = u64>,
) {
    for value in values {
        let triple = triple_for(value);
        if let InsertOutcome::Claimed(token) = three_keys.insert_token(triple) {
            let tuple_index = store.append(triple, tuple_status::EDB | tuple_status::COMPLETE);
            token.commit(tuple_index).unwrap();
            proxy.insert_triple(tuple_index, triple);
        }
    }
}

fn build(
    size: usize,
    thread_count: usize,
) -> (Arc<MemoryTripleList>, Arc<ThreeKeysIndex<MemoryTripleList>>, Arc<TwoKeysGroupProxy<MemoryTripleList>>) {
    let budget = Arc::new(MemoryBudget::unlimited());
    let config = config(thread_count);
    let store = Arc::new(MemoryTripleList::new(budget.clone(), size).unwrap());
    let mut three_keys = ThreeKeysIndex::new(store.clone(), budget.clone(), &config);
    let mut proxy = TwoKeysGroupProxy::new(
        store.clone(),
        ResourceComponent::P,
        ResourceComponent::O,
        budget,
        &config,
    );
    assert!(three_keys.initialize(0));
    assert!(proxy.initialize(0));
    (store, Arc::new(three_keys), Arc::new(proxy))
}

fn bench_single_thread_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_thread_insert");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(10);

    for size in [10_000usize, 100_000, 1_000_000].iter() {
        group.bench_with_input(BenchmarkId::new("insert_triples", size), size, |b, &size| {
            b.iter_batched(
                || build(size, 1),
                |(store, three_keys, proxy)| {
                    populate(&store, &three_keys, &proxy, 0..size as u64);
                    black_box(three_keys.number_of_used_buckets())
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_parallel_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_insert");
    group.measurement_time(Duration::from_secs(15));
    group.sample_size(10);
    let size = 400_000usize;

    for threads in [2usize, 4, 8].iter() {
        group.bench_with_input(BenchmarkId::new("insert_triples", threads), threads, |b, &threads| {
            b.iter_batched(
                || build(size, threads),
                |(store, three_keys, proxy)| {
                    let barrier = Arc::new(Barrier::new(threads));
                    let per_thread = (size / threads) as u64;
                    let handles: Vec<_> = (0..threads as u64)
                        .map(|thread_id| {
                            let (store, three_keys, proxy, barrier) = (
                                Arc::clone(&store),
                                Arc::clone(&three_keys),
                                Arc::clone(&proxy),
                                Arc::clone(&barrier),
                            );
                            thread::spawn(move || {
                                barrier.wait();
                                let start = thread_id * per_thread;
                                populate(&store, &three_keys, &proxy, start..start + per_thread);
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                    black_box(three_keys.hash_index().resize_count())
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");
    let size = 100_000usize;
    let (store, three_keys, proxy) = build(size, 1);
    populate(&store, &three_keys, &proxy, 0..size as u64);

    group.bench_function("triple_index", |b| {
        let mut value = 0u64;
        b.iter(|| {
            value = (value + 7_919) % size as u64;
            black_box(three_keys.triple_index(triple_for(value)))
        });
    });
    group.bench_function("chain_scan", |b| {
        let mut predicate = 0u64;
        b.iter(|| {
            predicate = predicate % 50 + 1;
            black_box(proxy.index().chain(predicate).count())
        });
    });
    group.finish();
}

criterion_group!(benches, bench_single_thread_insert, bench_parallel_insert, bench_lookup);
criterion_main!(benches);

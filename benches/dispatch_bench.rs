//! Benchmarks for the hot paths of the dispatch runtime: drawing retry
//! schedules, pushing items through the batcher, and pool lease/return.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

use grid_dispatch::batch::{AdaptiveBatcher, BatcherConfig};
use grid_dispatch::grid::{InMemoryGrid, SimConnection};
use grid_dispatch::pool::ConnectionPool;
use grid_dispatch::retry::RetryPolicy;

fn bench_retry_schedule(c: &mut Criterion) {
    let mut group = c.benchmark_group("Retry Schedule");

    for attempts in [3u32, 5, 10] {
        let policy = RetryPolicy::new(attempts, Duration::from_secs(60));
        group.bench_with_input(BenchmarkId::from_parameter(attempts), &policy, |b, policy| {
            b.iter(|| black_box(policy.delays().map(|d| d.len())));
        });
    }
    group.finish();
}

fn bench_batcher(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("Adaptive Batcher");

    for batch_size in [50usize, 500] {
        group.bench_with_input(
            BenchmarkId::new("offer_5000", batch_size),
            &batch_size,
            |b, &batch_size| {
                b.to_async(&rt).iter(|| async move {
                    let (batcher, mut batches) = AdaptiveBatcher::new(BatcherConfig {
                        batch_size,
                        timeout: Duration::from_secs(10),
                        output_capacity: 4,
                    });
                    for i in 0..5_000u32 {
                        batcher.offer(i);
                    }
                    batcher.complete();

                    let mut items = 0;
                    while let Some(batch) = batches.recv().await {
                        items += batch.len();
                    }
                    black_box(items)
                });
            },
        );
    }
    group.finish();
}

fn bench_pool_lease(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let grid = Arc::new(InMemoryGrid::new());
    let pool: ConnectionPool<SimConnection> = ConnectionPool::new(grid);
    rt.block_on(pool.prewarm(4));

    c.bench_function("Pool acquire/release", |b| {
        b.to_async(&rt).iter(|| async {
            let conn = pool.acquire().await.expect("connection");
            black_box(conn.connection());
        });
    });
}

criterion_group!(benches, bench_retry_schedule, bench_batcher, bench_pool_lease);
criterion_main!(benches);

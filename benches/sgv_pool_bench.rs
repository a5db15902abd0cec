// SGV Pool Performance Benchmarks
// Measures the cache-hit allocation round-trip and the page population
// path under the different clustering policies.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sgv_pool::{
    AllocFlags, ClusteringMode, SgvAlloc, SgvConfig, SgvManager, SgvPool, PAGE_SIZE,
};
use std::sync::Arc;
use std::time::Duration;

fn create_pool(name: &str, clustering: ClusteringMode) -> (SgvManager, Arc<SgvPool>) {
    let config = SgvConfig {
        hi_watermark: 1 << 20,
        lo_watermark: 1 << 19,
        max_order: 8,
        purge_interval: Duration::from_secs(3600),
    };
    let manager = SgvManager::new(config).unwrap();
    let pool = manager.create_pool(name, clustering, false).unwrap();
    (manager, pool)
}

fn bench_cache_hit_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_hit_round_trip");

    for pages in [1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(pages), &pages, |b, &pages| {
            let (_manager, pool) = create_pool("bench-hit", ClusteringMode::None);
            // Warm the bucket so every iteration is a hit.
            let warm = match pool
                .alloc(pages * PAGE_SIZE, AllocFlags::empty(), None, None)
                .unwrap()
            {
                SgvAlloc::Ready { obj, .. } => obj,
                _ => unreachable!(),
            };
            pool.free(warm, None);

            b.iter(|| {
                let alloc = pool
                    .alloc(black_box(pages * PAGE_SIZE), AllocFlags::empty(), None, None)
                    .unwrap();
                match alloc {
                    SgvAlloc::Ready { obj, count } => {
                        black_box(count);
                        pool.free(obj, None);
                    }
                    _ => unreachable!(),
                }
            });
            pool.destroy();
        });
    }

    group.finish();
}

fn bench_population_by_clustering(c: &mut Criterion) {
    let mut group = c.benchmark_group("population");

    let modes = [
        ClusteringMode::None,
        ClusteringMode::Tail,
        ClusteringMode::Full,
    ];
    for mode in modes {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{mode}")),
            &mode,
            |b, &mode| {
                let (_manager, pool) = create_pool("bench-pop", mode);
                b.iter(|| {
                    // NO_CACHED keeps every iteration on the populate
                    // path instead of hitting the cache.
                    let alloc = pool
                        .alloc(
                            black_box(16 * PAGE_SIZE),
                            AllocFlags::NO_CACHED,
                            None,
                            None,
                        )
                        .unwrap();
                    match alloc {
                        SgvAlloc::Ready { obj, count } => {
                            black_box(count);
                            pool.free(obj, None);
                        }
                        _ => unreachable!(),
                    }
                });
                pool.destroy();
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_cache_hit_round_trip,
    bench_population_by_clustering
);
criterion_main!(benches);

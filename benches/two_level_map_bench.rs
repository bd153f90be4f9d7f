use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use dumbmap2d::{finalizer, TwoLevelMap};
use std::time::Duration;

fn lcg(mut s: u64) -> impl Iterator<Item = u64> {
    std::iter::from_fn(move || {
        s = s.wrapping_mul(6364136223846793005).wrapping_add(1);
        Some(s)
    })
}

fn populated(seed: u64, pairs: usize, primaries: u64) -> TwoLevelMap<u64, u64> {
    let m = TwoLevelMap::new();
    for x in lcg(seed).take(pairs) {
        m.put(x % primaries, x, []);
    }
    m
}

fn bench_put(c: &mut Criterion) {
    c.bench_function("two_level_map_put_10k", |b| {
        b.iter_batched(
            TwoLevelMap::<u64, u64>::new,
            |m| {
                for x in lcg(1).take(10_000) {
                    m.put(x % 128, x, []);
                }
                black_box(m)
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_put_delete_with_finalizer(c: &mut Criterion) {
    c.bench_function("two_level_map_put_delete_finalizer", |b| {
        let m: TwoLevelMap<u64, u64> = TwoLevelMap::new();
        let mut keys = lcg(3);
        b.iter(|| {
            let x = keys.next().unwrap_or(0);
            m.put(x % 64, x, [finalizer(|| {})]);
            black_box(m.delete(&(x % 64), &x));
        })
    });
}

fn bench_sync_small_delta(c: &mut Criterion) {
    c.bench_function("two_level_map_sync_10k_small_delta", |b| {
        b.iter_batched(
            || {
                let prev = populated(7, 10_000, 256);
                let next = populated(7, 10_000, 256);
                for x in lcg(99).take(100) {
                    next.put(x % 256, x, []);
                }
                (prev, next)
            },
            |(prev, next)| {
                let mut events = 0usize;
                prev.sync(
                    &next,
                    Some(&mut |_: &u64, _: &u64| events += 1),
                    Some(&mut |_: &u64, _: &u64| events += 1),
                );
                black_box((prev, events))
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_sync_disjoint(c: &mut Criterion) {
    c.bench_function("two_level_map_sync_disjoint_5k", |b| {
        b.iter_batched(
            || (populated(11, 5_000, 64), populated(13, 5_000, 64)),
            |(prev, next)| {
                prev.sync(&next, None, None);
                black_box(prev)
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_config() -> Criterion {
    Criterion::default()
        .sample_size(50)
        .measurement_time(Duration::from_secs(8))
        .warm_up_time(Duration::from_secs(2))
}

criterion_group! {
    name = benches;
    config = bench_config();
    targets = bench_put, bench_put_delete_with_finalizer, bench_sync_small_delta, bench_sync_disjoint
}
criterion_main!(benches);

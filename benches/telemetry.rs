use criterion::{criterion_group, criterion_main, Criterion};
use esox_poolcore::{PoolConfiguration, PoolCore};
use std::hint::black_box;
use std::time::Duration;

fn borrow_return(c: &mut Criterion) {
    let core = PoolCore::new(PoolConfiguration::new().with_monitoring(false));

    c.bench_function("update_stats_borrow", |b| {
        b.iter(|| {
            core.update_stats_borrow(
                black_box(Duration::from_millis(12)),
                black_box(Duration::from_millis(3)),
            )
        })
    });

    c.bench_function("update_stats_return", |b| {
        b.iter(|| core.update_stats_return(black_box(Duration::from_millis(40))))
    });

    c.bench_function("mean_idle_time_millis", |b| {
        b.iter(|| black_box(core.mean_idle_time_millis()))
    });
}

criterion_group!(benches, borrow_return);
criterion_main!(benches);

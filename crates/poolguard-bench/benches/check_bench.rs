//! Bounds and dereference check benchmarks.

use criterion::{Criterion, criterion_group, criterion_main};
use poolguard_membrane::{CheckSite, LogDestination, Runtime, RuntimeConfig};

fn bench_checks(c: &mut Criterion) {
    let Ok(rt) = Runtime::new(
        RuntimeConfig::new()
            .with_rewrite_oob(true)
            .with_log(LogDestination::Off),
    ) else {
        return;
    };
    let Ok(pool) = rt.create_pool(64) else { return };
    let objects: Vec<usize> = (0..512).filter_map(|_| rt.alloc(pool, 64).ok()).collect();
    let site = CheckSite::new();
    let Some(&first) = objects.first() else { return };

    let mut group = c.benchmark_group("checks");
    group.bench_function("exact_check", |b| {
        b.iter(|| criterion::black_box(rt.exact_check(first, first + 32, 64, &site)));
    });
    group.bench_function("check_bounds_hot", |b| {
        b.iter(|| criterion::black_box(rt.check_bounds(Some(pool), first, first + 32, &site)));
    });
    group.bench_function("check_deref_scattered", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 131) % objects.len();
            criterion::black_box(rt.check_deref(Some(pool), objects[i] + 8, 8, &site))
        });
    });
    group.bench_function("rewrite_and_reenter", |b| {
        b.iter(|| {
            let Ok(out) = rt.check_bounds(Some(pool), first, first + 100, &site) else {
                return;
            };
            let token = out.pointer();
            criterion::black_box(rt.check_bounds(Some(pool), token, token.wrapping_sub(90), &site));
        });
    });
    group.finish();
}

criterion_group!(benches, bench_checks);
criterion_main!(benches);

//! Range map and registry lookup benchmarks.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use poolguard_membrane::registry::Registry;
use poolguard_membrane::splay::RangeMap;
use poolguard_membrane::{ObjectClass, ObjectMeta};

fn populated_map(n: usize) -> RangeMap<()> {
    let mut map = RangeMap::new();
    for i in 0..n {
        let start = 0x10_0000 + i * 64;
        map.insert(start, start + 48, ());
    }
    map
}

fn bench_range_map_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_map_find");
    for &n in &[16usize, 1024, 65_536] {
        let mut map = populated_map(n);
        group.bench_with_input(BenchmarkId::new("strided", n), &n, |b, &n| {
            let mut i = 0usize;
            b.iter(|| {
                i = (i + 7919) % n;
                criterion::black_box(map.find(0x10_0000 + i * 64 + 8).map(|(s, e, _)| (s, e)));
            });
        });
        group.bench_with_input(BenchmarkId::new("same_object", n), &n, |b, _| {
            b.iter(|| criterion::black_box(map.find(0x10_0010).map(|(s, e, _)| (s, e))));
        });
    }
    group.finish();
}

fn bench_registry_cache(c: &mut Criterion) {
    let mut registry = Registry::new();
    for i in 0..4096usize {
        registry.register(0x20_0000 + i * 128, 96, ObjectMeta::new(ObjectClass::Heap));
    }
    let mut group = c.benchmark_group("registry_find");
    group.bench_function("alternating_pair", |b| {
        let mut flip = false;
        b.iter(|| {
            flip = !flip;
            let addr = if flip { 0x20_0000 } else { 0x20_0080 };
            criterion::black_box(registry.find(addr + 4));
        });
    });
    group.bench_function("scattered", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 977) % 4096;
            criterion::black_box(registry.find(0x20_0000 + i * 128));
        });
    });
    group.finish();
}

criterion_group!(benches, bench_range_map_find, bench_registry_cache);
criterion_main!(benches);

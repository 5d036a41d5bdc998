// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use allocator_api2::alloc::Global;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use libdd_flatmap::{FixedMap, GrowMap};

fn bench_fixed_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("fixed_map");

    group.bench_function("insert_1k", |b| {
        b.iter(|| {
            let mut map = FixedMap::new_in(1024, 0x5EED, Global).unwrap();
            for k in 0u64..1000 {
                map.insert(black_box(k), k).unwrap();
            }
            black_box(map.len())
        })
    });

    let mut map = FixedMap::new_in(1024, 0x5EED, Global).unwrap();
    for k in 0u64..1000 {
        map.insert(k, k).unwrap();
    }
    group.bench_function("get_hit", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            for k in 0u64..1000 {
                sum += *map.get(black_box(&k)).unwrap();
            }
            black_box(sum)
        })
    });
    group.bench_function("iterate_1k", |b| {
        b.iter(|| {
            let mut count = 0usize;
            for pair in map.iter() {
                black_box(pair);
                count += 1;
            }
            black_box(count)
        })
    });

    group.finish();
}

fn bench_grow_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("grow_map");

    group.bench_function("insert_1k_with_rehashes", |b| {
        b.iter(|| {
            let mut map = GrowMap::new_in(4, 0.7, 0x5EED, Global).unwrap();
            for k in 0u64..1000 {
                map.insert(black_box(k), k).unwrap();
            }
            black_box(map.slot_count())
        })
    });

    group.finish();
}

criterion_group!(benches, bench_fixed_map, bench_grow_map);
criterion_main!(benches);

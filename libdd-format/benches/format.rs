// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use allocator_api2::alloc::Global;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use libdd_format::{fmt_args, format_sink, StringBuilder};
use libdd_memview::sink::{CountingSink, SliceSink};

fn bench_engine(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine");

    group.bench_function("mixed_line", |b| {
        let mut buf = [0u8; 256];
        b.iter(|| {
            let mut sink = SliceSink::new(&mut buf);
            format_sink(
                &mut sink,
                b"%s pid=%d rss=%$$d elapsed=%.3fms",
                &fmt_args![black_box("worker"), 4182, 73449152, 12.875],
            )
        })
    });

    group.bench_function("float_heavy", |b| {
        let mut counter = CountingSink::new();
        b.iter(|| {
            format_sink(
                &mut counter,
                b"%.17g %.17g %.17g",
                &fmt_args![
                    black_box(core::f64::consts::PI),
                    black_box(5e-324),
                    black_box(1.7976931348623157e308)
                ],
            )
        })
    });

    group.finish();
}

fn bench_builder(c: &mut Criterion) {
    c.bench_function("builder_append_64KiB", |b| {
        let piece = [0xA5u8; 73];
        b.iter(|| {
            let mut builder = StringBuilder::with_chunk_size(Global, 1024, 8).unwrap();
            for _ in 0..(64 * 1024 / piece.len()) {
                builder.push_bytes(black_box(&piece)).unwrap();
            }
            black_box(builder.len())
        })
    });
}

criterion_group!(benches, bench_engine, bench_builder);
criterion_main!(benches);

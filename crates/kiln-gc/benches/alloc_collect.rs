//! Allocation fast-path and collection throughput.

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use kiln_gc::api;
use kiln_gc::{gc_init, DescBuilder, GcConfig};

fn bench_alloc(c: &mut Criterion) {
    gc_init(GcConfig::default()).expect("heap reservation failed");
    let d = DescBuilder::object(32).build();

    c.bench_function("alloc_32", |b| {
        b.iter(|| {
            let p = unsafe { api::alloc_object_fast(black_box(d)) };
            if p.is_null() {
                // Exhausted between trigger points; reclaim and go on.
                api::collect();
            }
            black_box(p)
        });
    });
}

fn bench_collect(c: &mut Criterion) {
    gc_init(GcConfig::default()).expect("heap reservation failed");
    let d = DescBuilder::object(64).build();

    c.bench_function("collect_after_1k_garbage", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                unsafe { api::alloc_object_fast(d) };
            }
            black_box(api::collect())
        });
    });
}

criterion_group!(benches, bench_alloc, bench_collect);
criterion_main!(benches);

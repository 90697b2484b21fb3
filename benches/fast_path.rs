//! Allocation fast path benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use spanmalloc::{frontend, Engine, FastCache, FreeHint, Request};

fn bench_malloc_free(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 32768, 1 << 20];
    let mut group = c.benchmark_group("malloc_free");

    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("unsized", size), &size, |b, &sz| {
            b.iter(|| unsafe {
                let p = frontend::malloc(black_box(sz));
                frontend::free(black_box(p));
            });
        });
        group.bench_with_input(BenchmarkId::new("sized", size), &size, |b, &sz| {
            b.iter(|| unsafe {
                let p = frontend::malloc(black_box(sz));
                frontend::free_sized(black_box(p), sz);
            });
        });
    }
    group.finish();
}

fn bench_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("burst");

    group.bench_function("1000x64B", |b| {
        b.iter(|| {
            let ptrs: Vec<*mut u8> = (0..1000).map(|_| frontend::malloc(64)).collect();
            for p in black_box(ptrs) {
                unsafe { frontend::free_sized(p, 64) };
            }
        });
    });

    group.bench_function("1000x64B private engine", |b| {
        let engine: &'static Engine = Box::leak(Box::new(Engine::new()));
        let mut cache = FastCache::new();
        let mut ptrs = Vec::with_capacity(1000);
        b.iter(|| {
            for _ in 0..1000 {
                if let Ok(allocation) = engine.allocate(Some(&mut cache), Request::new(64, 8)) {
                    ptrs.push(allocation.ptr);
                }
            }
            for p in ptrs.drain(..) {
                unsafe { engine.deallocate(Some(&mut cache), p, FreeHint::sized(64)) };
            }
        });
        cache.flush(engine);
    });

    group.finish();
}

criterion_group!(benches, bench_malloc_free, bench_burst);
criterion_main!(benches);

//! Allocation throughput against the system malloc.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

const OPS: u64 = 100_000;

fn streambed_alloc_free(size: usize) {
    for _ in 0..OPS {
        let ptr = streambed::allocate(size);
        black_box(ptr);
        unsafe { streambed::release(ptr) };
    }
}

fn libc_alloc_free(size: usize) {
    for _ in 0..OPS {
        unsafe {
            let ptr = libc::malloc(size);
            black_box(ptr);
            libc::free(ptr);
        }
    }
}

fn bench_alloc_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_throughput");

    for size in [16, 64, 256, 1024, 4096, 65536] {
        group.throughput(Throughput::Elements(OPS));

        group.bench_with_input(BenchmarkId::new("streambed", size), &size, |b, &size| {
            b.iter(|| streambed_alloc_free(size))
        });

        group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
            b.iter(|| libc_alloc_free(size))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_alloc_throughput);
criterion_main!(benches);

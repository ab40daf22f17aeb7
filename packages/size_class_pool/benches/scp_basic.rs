//! Basic benchmarks for the `size_class_pool` package.
//!
//! Compares recycling blocks through a warm registry with allocating from the system allocator
//! directly, and measures the cost of the first request that has to create a pool.

#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::hint::black_box;
use std::iter;
use std::time::Instant;

use alloc_tracker::{Allocator, Session};
use criterion::{Criterion, criterion_group, criterion_main};
use size_class_pool::{PoolAllocator, PoolRegistry};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

#[global_allocator]
static ALLOCATOR: Allocator<System> = Allocator::system();

const BATCH_SIZE: usize = 1000;
const BLOCK_BYTES: usize = 48;

fn entrypoint(c: &mut Criterion) {
    let allocs = Session::new();

    let mut group = c.benchmark_group("scp_recycle");

    let allocs_op = allocs.operation("registry_warm");
    group.bench_function("registry_warm", |b| {
        let mut registry = PoolRegistry::new();

        // Warm up so that every block of the batch is already on a free list.
        let warmup: Vec<_> = iter::repeat_with(|| registry.allocate_bytes(BLOCK_BYTES).unwrap())
            .take(BATCH_SIZE)
            .collect();
        for block in warmup {
            registry.deallocate_bytes(block, BLOCK_BYTES);
        }

        let mut blocks = Vec::with_capacity(BATCH_SIZE);

        b.iter_custom(|iters| {
            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                for _ in 0..BATCH_SIZE {
                    blocks.push(black_box(registry.allocate_bytes(BLOCK_BYTES).unwrap()));
                }

                for block in blocks.drain(..) {
                    registry.deallocate_bytes(block, BLOCK_BYTES);
                }
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("handle_warm");
    group.bench_function("handle_warm", |b| {
        let allocator = PoolAllocator::<[u64; 6]>::new();
        let mut ptrs = Vec::with_capacity(BATCH_SIZE);

        b.iter_custom(|iters| {
            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                for _ in 0..BATCH_SIZE {
                    ptrs.push(black_box(allocator.allocate(1).unwrap()));
                }

                for ptr in ptrs.drain(..) {
                    allocator.deallocate(ptr, 1);
                }
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("system");
    group.bench_function("system", |b| {
        let layout = Layout::from_size_align(BLOCK_BYTES, 8).unwrap();
        let mut ptrs = Vec::with_capacity(BATCH_SIZE);

        b.iter_custom(|iters| {
            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                for _ in 0..BATCH_SIZE {
                    // SAFETY: The layout has non-zero size.
                    ptrs.push(black_box(unsafe { System.alloc(layout) }));
                }

                for ptr in ptrs.drain(..) {
                    // SAFETY: The pointer was allocated above with the same layout.
                    unsafe { System.dealloc(ptr, layout) };
                }
            }

            start.elapsed()
        });
    });

    group.finish();

    let mut group = c.benchmark_group("scp_cold");

    let allocs_op = allocs.operation("first_request");
    group.bench_function("first_request", |b| {
        b.iter_custom(|iters| {
            let mut registries = iter::repeat_with(PoolRegistry::new)
                .take(usize::try_from(iters).unwrap())
                .collect::<Vec<_>>();

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for registry in &mut registries {
                _ = black_box(registry.allocate_bytes(black_box(BLOCK_BYTES)).unwrap());
            }

            start.elapsed()
        });
    });

    group.finish();

    allocs.print_to_stdout();
}

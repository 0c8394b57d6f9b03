//! Criterion benchmarks for ring buffer hot paths.
//!
//! Key metrics:
//! - Single-threaded acquire/publish/acquire/release cycle for various block sizes
//! - Producer/consumer throughput across two threads
//!
//! Run with: cargo bench --bench ring_buffer

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use heap_daq::data::ring_buffer::ShmNamespace;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(1);

/// One block through every state, no contention.
fn block_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer_cycle");

    let sizes = [
        ("4KB", 4 * 1024),
        ("64KB", 64 * 1024),
        ("1MB", 1024 * 1024),
    ];

    for (name, size) in sizes {
        let temp_dir = tempfile::tempdir().unwrap();
        let ring = ShmNamespace::new(temp_dir.path())
            .create_or_get(1, 8, size, "bench")
            .unwrap();
        let data = vec![0x5Au8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("fill_and_drain", name), &size, |b, _| {
            b.iter(|| {
                let mut block = ring.acquire_free(TIMEOUT).unwrap();
                block.data_mut()[..size].copy_from_slice(black_box(&data));
                block.publish();
                let block = ring.acquire_full(TIMEOUT).unwrap();
                black_box(block.data()[0]);
                block.release();
            });
        });
    }

    group.finish();
}

/// Producer and consumer on separate threads, 1000 blocks per iteration.
fn producer_consumer(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer_threads");
    const BLOCKS: usize = 1000;
    let size = 64 * 1024;

    let temp_dir = tempfile::tempdir().unwrap();
    let ring = Arc::new(
        ShmNamespace::new(temp_dir.path())
            .create_or_get(1, 8, size, "bench")
            .unwrap(),
    );

    group.throughput(Throughput::Bytes((BLOCKS * size) as u64));
    group.bench_function("spsc_64KB", |b| {
        b.iter(|| {
            let consumer_ring = Arc::clone(&ring);
            let consumer = thread::spawn(move || {
                for _ in 0..BLOCKS {
                    consumer_ring.acquire_full(TIMEOUT).unwrap().release();
                }
            });
            for i in 0..BLOCKS {
                let mut block = ring.acquire_free(TIMEOUT).unwrap();
                block.data_mut()[0] = i as u8;
                block.publish();
            }
            consumer.join().unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, block_cycle, producer_consumer);
criterion_main!(benches);

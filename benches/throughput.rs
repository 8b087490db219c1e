//! Throughput Benchmark for bucketd
//!
//! This benchmark measures the hot paths of a worker thread: the memcached
//! item store, the buffer loan cycle and request framing.

use bucketd::connection::BufferPool;
use bucketd::engine::default_engine::ItemStore;
use bucketd::engine::StoreOperation;
use bucketd::protocol::{FrameParser, Opcode, Request};
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

const CACHE_SIZE: u64 = 1 << 30;

fn set(store: &ItemStore, key: Bytes, value: Bytes) {
    let _ = store.store(key, value, 0, 0, 0, StoreOperation::Set, CACHE_SIZE);
}

/// Benchmark SET operations
fn bench_set(c: &mut Criterion) {
    let store = Arc::new(ItemStore::new());

    let mut group = c.benchmark_group("set");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_small", |b| {
        let mut i = 0u64;
        b.iter(|| {
            set(&store, Bytes::from(format!("key:{}", i % 100_000)), Bytes::from("small_value"));
            i += 1;
        });
    });

    group.bench_function("set_medium", |b| {
        let mut i = 0u64;
        let value = Bytes::from("x".repeat(1024)); // 1KB value
        b.iter(|| {
            set(&store, Bytes::from(format!("key:{}", i % 100_000)), value.clone());
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark GET operations
fn bench_get(c: &mut Criterion) {
    let store = Arc::new(ItemStore::new());

    // Pre-populate with data
    for i in 0..100_000 {
        set(&store, Bytes::from(format!("key:{}", i)), Bytes::from(format!("value:{}", i)));
    }

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{}", i % 100_000);
            black_box(store.get(key.as_bytes()));
            i += 1;
        });
    });

    group.bench_function("get_missing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("missing:{}", i);
            black_box(store.get(key.as_bytes()));
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark concurrent access
fn bench_concurrent(c: &mut Criterion) {
    use std::thread;

    let mut group = c.benchmark_group("concurrent");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("4_threads_mixed", |b| {
        b.iter(|| {
            let store = Arc::new(ItemStore::new());
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let store = Arc::clone(&store);
                    thread::spawn(move || {
                        for i in 0..10_000 {
                            let key = Bytes::from(format!("key:{}:{}", t, i));
                            set(&store, key.clone(), Bytes::from("value"));
                            store.get(&key);
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            black_box(store.len());
        });
    });

    group.finish();
}

/// Benchmark the buffer loan cycle of one request
fn bench_buffer_loans(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffers");
    group.throughput(Throughput::Elements(1));

    group.bench_function("loan_return_spare", |b| {
        let mut pool = BufferPool::new(2048);
        let mut read = None;
        let mut write = None;
        b.iter(|| {
            black_box(pool.loan_read(&mut read).unwrap());
            black_box(pool.loan_write(&mut write).unwrap());
            pool.return_read(&mut read);
            pool.return_write(&mut write);
        });
    });

    // Two connections alternating: one of them always allocates
    group.bench_function("loan_contended", |b| {
        let mut pool = BufferPool::new(2048);
        let mut first = None;
        let mut second = None;
        b.iter(|| {
            black_box(pool.loan_read(&mut first).unwrap());
            black_box(pool.loan_read(&mut second).unwrap());
            pool.return_read(&mut first);
            pool.return_read(&mut second);
        });
    });

    group.finish();
}

/// Benchmark request framing
fn bench_parse(c: &mut Criterion) {
    let parser = FrameParser::default();
    let get = Request::new(Opcode::Get).with_key("user:1000").encode();

    let mut pipeline = Vec::new();
    for i in 0..100 {
        pipeline.extend_from_slice(&Request::new(Opcode::Get).with_key(format!("key:{}", i)).encode());
    }

    let mut group = c.benchmark_group("parse");

    group.throughput(Throughput::Elements(1));
    group.bench_function("single_get", |b| {
        b.iter(|| black_box(parser.parse(&get).unwrap()));
    });

    group.throughput(Throughput::Elements(100));
    group.bench_function("pipeline_100", |b| {
        b.iter(|| {
            let mut offset = 0;
            while let Ok(Some((frame, used))) = parser.parse(&pipeline[offset..]) {
                black_box(frame);
                offset += used;
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_set,
    bench_get,
    bench_concurrent,
    bench_buffer_loans,
    bench_parse,
);

criterion_main!(benches);

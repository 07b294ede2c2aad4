use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures::future::BoxFuture;
use respool_rs::{CircuitBreaker, ResourceManager, ResourcePool, RingBuffer};
use std::fmt;
use std::time::Duration;

#[derive(Debug)]
struct BenchError;

impl fmt::Display for BenchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Benchmark error")
    }
}

impl std::error::Error for BenchError {}

fn successful_operation() -> Result<(), BenchError> {
    Ok(())
}

fn failing_operation() -> Result<(), BenchError> {
    Err(BenchError)
}

fn bench_ring_push_pop(c: &mut Criterion) {
    let mut ring = RingBuffer::new(1024);

    c.bench_function("ring_push_pop", |b| {
        b.iter(|| {
            for i in 0..512u64 {
                ring.push(black_box(i));
            }
            while let Some(item) = ring.pop() {
                black_box(item);
            }
        });
    });
}

fn bench_circuit_breaker_closed(c: &mut Criterion) {
    let breaker = CircuitBreaker::builder()
        .failure_threshold(5)
        .reset_timeout(Duration::from_secs(30))
        .build();

    c.bench_function("circuit_breaker_closed_success", |b| {
        b.iter(|| black_box(breaker.call("bench", successful_operation)));
    });
}

fn bench_circuit_breaker_transition(c: &mut Criterion) {
    let breaker = CircuitBreaker::builder()
        .failure_threshold(5)
        .reset_timeout(Duration::from_secs(30))
        .build();

    c.bench_function("circuit_breaker_transition", |b| {
        b.iter_custom(|iters| {
            let start = std::time::Instant::now();

            for _ in 0..iters {
                breaker.force_closed("bench");

                // Five failures trip the breaker
                for _ in 0..5 {
                    let _ = black_box(breaker.call("bench", failing_operation));
                }

                // One open-circuit rejection
                let _ = black_box(breaker.call("bench", successful_operation));
            }

            start.elapsed()
        });
    });
}

fn bench_circuit_breaker_concurrent(c: &mut Criterion) {
    use std::sync::{Arc, Barrier};
    use std::thread;

    let breaker = CircuitBreaker::builder().failure_threshold(100).build();

    const THREAD_COUNT: usize = 4;
    const ITERATIONS_PER_THREAD: usize = 1000;

    c.bench_function("circuit_breaker_concurrent", |b| {
        b.iter(|| {
            let barrier = Arc::new(Barrier::new(THREAD_COUNT + 1));
            let mut handles = Vec::with_capacity(THREAD_COUNT);

            for t in 0..THREAD_COUNT {
                let thread_breaker = breaker.clone();
                let thread_barrier = Arc::clone(&barrier);
                let key = format!("worker-{}", t % 2);

                handles.push(thread::spawn(move || {
                    thread_barrier.wait();
                    for _ in 0..ITERATIONS_PER_THREAD {
                        let _ = black_box(thread_breaker.call(&key, successful_operation));
                    }
                }));
            }

            barrier.wait();

            for handle in handles {
                handle.join().unwrap();
            }
        });
    });
}

struct Noop;

impl ResourceManager for Noop {
    type Resource = u64;
    type Error = BenchError;

    fn create(&self) -> BoxFuture<'_, Result<u64, BenchError>> {
        Box::pin(async { Ok(0) })
    }
}

fn bench_pool_acquire_release(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let pool = rt
        .block_on(ResourcePool::builder(Noop).min_size(4).max_size(4).build())
        .unwrap();

    c.bench_function("pool_acquire_release", |b| {
        b.iter(|| {
            rt.block_on(async {
                let handle = pool.acquire(Duration::from_millis(10)).await.unwrap();
                pool.release(black_box(&handle)).unwrap();
            })
        });
    });
}

criterion_group!(
    benches,
    bench_ring_push_pop,
    bench_circuit_breaker_closed,
    bench_circuit_breaker_transition,
    bench_circuit_breaker_concurrent,
    bench_pool_acquire_release
);
criterion_main!(benches);

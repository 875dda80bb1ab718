use breakwater::CircuitBreaker;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

// Custom error type that implements Error trait
#[derive(Debug)]
struct BenchError(String);

impl BenchError {
    fn new(msg: &str) -> Self {
        BenchError(msg.to_string())
    }
}

impl fmt::Display for BenchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Benchmark error: {}", self.0)
    }
}

impl Error for BenchError {}

async fn successful_operation() -> Result<u64, BenchError> {
    Ok(42)
}

async fn failing_operation() -> Result<u64, BenchError> {
    Err(BenchError::new("Simulated failure"))
}

fn bench_circuit_breaker_closed(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let breaker: CircuitBreaker<u64, BenchError> = CircuitBreaker::builder("bench-closed")
        .failure_rate_threshold(50.0)
        .wait_duration_in_open(Duration::from_secs(30))
        .build()
        .expect("valid config");

    c.bench_function("circuit_breaker_closed_success", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(breaker.execute(successful_operation).await) });
    });
}

fn bench_circuit_breaker_transition(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let breaker: CircuitBreaker<u64, BenchError> = CircuitBreaker::builder("bench-transition")
        .failure_rate_threshold(50.0)
        .minimum_calls(5)
        .wait_duration_in_open(Duration::from_secs(30))
        .build()
        .expect("valid config");

    c.bench_function("circuit_breaker_transition", |b| {
        b.to_async(&rt).iter_custom(|iters| {
            let breaker = &breaker;
            async move {
                let start = std::time::Instant::now();

                for _ in 0..iters {
                    // Reset to ensure a consistent starting point
                    breaker.reset();

                    // Enough failing calls to trip the breaker
                    for _ in 0..5 {
                        let _ = black_box(breaker.execute(failing_operation).await);
                    }

                    // One open-circuit rejection
                    let _ = black_box(breaker.execute(successful_operation).await);
                }

                start.elapsed()
            }
        });
    });
}

fn bench_circuit_breaker_concurrent(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let breaker: Arc<CircuitBreaker<u64, BenchError>> = Arc::new(
        CircuitBreaker::builder("bench-concurrent")
            .failure_rate_threshold(50.0)
            .minimum_calls(1_000_000) // High to avoid tripping
            .wait_duration_in_open(Duration::from_secs(30))
            .build()
            .expect("valid config"),
    );

    const TASK_COUNT: usize = 4;
    const ITERATIONS_PER_TASK: usize = 1000;

    c.bench_function("circuit_breaker_concurrent", |b| {
        b.to_async(&rt).iter(|| {
            let breaker = Arc::clone(&breaker);
            async move {
                let mut handles = Vec::with_capacity(TASK_COUNT);
                for _ in 0..TASK_COUNT {
                    let task_breaker = Arc::clone(&breaker);
                    handles.push(tokio::spawn(async move {
                        for _ in 0..ITERATIONS_PER_TASK {
                            let _ = black_box(task_breaker.execute(successful_operation).await);
                        }
                    }));
                }
                for handle in handles {
                    handle.await.expect("task panicked");
                }
            }
        });
    });
}

criterion_group!(
    benches,
    bench_circuit_breaker_closed,
    bench_circuit_breaker_transition,
    bench_circuit_breaker_concurrent
);
criterion_main!(benches);

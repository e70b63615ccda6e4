//! Benchmarks for pipeline execution.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use resilience::prelude::*;
use tokio::runtime::Runtime;

fn manager() -> ResilienceManager {
    let config = ManagerConfig::new()
        .with_target("passthrough", PolicyConfig::new())
        .with_target(
            "guarded",
            PolicyConfig::new()
                .with_circuit_breaker(CircuitBreakerConfig::new())
                .with_retry(RetryConfig::new())
                .with_rate_limiter(RateLimiterConfig::new(usize::MAX, 1)),
        );
    match ResilienceManager::new(config) {
        Ok(manager) => manager,
        Err(e) => panic!("invalid bench config: {e}"),
    }
}

fn pipeline_benchmark(c: &mut Criterion) {
    let rt = match Runtime::new() {
        Ok(rt) => rt,
        Err(e) => panic!("runtime: {e}"),
    };
    let manager = manager();

    for target in ["passthrough", "guarded"] {
        c.bench_function(target, |b| {
            b.iter(|| {
                rt.block_on(async {
                    let result = manager
                        .execute(target, || async { Ok::<_, std::io::Error>(black_box(42)) })
                        .await;
                    black_box(result.is_ok())
                })
            });
        });
    }
}

criterion_group!(benches, pipeline_benchmark);
criterion_main!(benches);

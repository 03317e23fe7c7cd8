use std::sync::Arc;
use std::time::Duration;

use bulwark_common::error::{DefaultClassifier, ErrorClassifier, OperationError};
use bulwark_common::time::MockClock;
use bulwark_core::{
    AdaptiveRateLimiter, CircuitBreakerConfig, EndpointCircuitBreaker, EndpointKey,
    FallbackOrchestrator, IdentityConfig, IdentityRotationManager, ProfiledStrategy,
    RateLimitConfig, Strategy, StrategyTier,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn classifier() -> Arc<dyn ErrorClassifier> {
    Arc::new(DefaultClassifier)
}

fn limiter(clock: &MockClock) -> Arc<AdaptiveRateLimiter> {
    let config = RateLimitConfig::builder()
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(10))
        .max_requests_per_minute(1_000_000)
        .build()
        .expect("valid rate limit config");
    Arc::new(AdaptiveRateLimiter::with_parts(config, clock.shared(), classifier()).expect("limiter"))
}

fn hits_strategy(name: &str, priority: i32, hits: usize) -> Arc<dyn Strategy<Vec<String>>> {
    let tier = StrategyTier::new(name, priority, Duration::from_secs(10), 0);
    Arc::new(ProfiledStrategy::new(tier, move |query: String| async move {
        Ok::<_, OperationError>(vec![query; hits])
    }))
}

fn gate_benchmark(c: &mut Criterion) {
    let clock = MockClock::new();
    let circuit = Arc::new(
        EndpointCircuitBreaker::with_parts(CircuitBreakerConfig::default(), clock.shared(), classifier())
            .expect("circuit breaker"),
    );
    let rate = limiter(&clock);
    let endpoint = EndpointKey::new("/api/search");

    let mut group = c.benchmark_group("gates");
    group.sample_size(50).measurement_time(Duration::from_secs(5));

    group.bench_function("circuit_closed_fast_path", |b| {
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        b.iter(|| {
            runtime.block_on(async {
                let result = circuit
                    .execute(&endpoint, || async { Ok::<_, OperationError>(black_box(1_u32)) })
                    .await;
                black_box(result).ok();
            });
        });
    });

    group.bench_function("rate_limiter_bookkeeping", |b| {
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        b.iter(|| {
            runtime.block_on(async {
                let result = rate
                    .execute_with_backoff(&endpoint, || async { Ok::<_, OperationError>(()) })
                    .await;
                black_box(result).ok();
            });
        });
    });

    group.bench_function("circuit_stats", |b| {
        for shard in 0..64 {
            circuit.record_success(&EndpointKey::new(format!("/api/shard/{shard}")));
        }
        b.iter(|| black_box(circuit.stats()));
    });

    group.finish();
}

fn fallback_benchmark(c: &mut Criterion) {
    let clock = MockClock::new();
    let circuit = Arc::new(
        EndpointCircuitBreaker::with_parts(CircuitBreakerConfig::default(), clock.shared(), classifier())
            .expect("circuit breaker"),
    );
    let fallback =
        FallbackOrchestrator::with_parts(circuit, limiter(&clock), clock.shared(), classifier());
    fallback.register_strategy("search", hits_strategy("primary", 100, 0));
    fallback.register_strategy("search", hits_strategy("alternative", 80, 0));
    fallback.register_strategy("search", hits_strategy("legacy", 60, 3));

    let mut group = c.benchmark_group("fallback");
    group.sample_size(30).measurement_time(Duration::from_secs(5));

    group.bench_function("traverse_to_third_strategy", |b| {
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        b.iter(|| {
            runtime.block_on(async {
                let outcome = fallback
                    .execute_with_fallback("search", "laptop", &["notebook"], |data| {
                        !data.is_empty()
                    })
                    .await;
                black_box(outcome.attempt_count);
            });
        });
    });

    let identities = IdentityRotationManager::with_seed(IdentityConfig::default(), 42)
        .expect("identity manager");
    group.bench_function("dynamic_headers", |b| {
        let endpoint = EndpointKey::new("/api/search");
        b.iter(|| {
            let profile = identities.next_profile();
            black_box(identities.generate_dynamic_headers(&profile, &endpoint))
        });
    });

    group.finish();
}

criterion_group!(resilience_benchmarks, gate_benchmark, fallback_benchmark);
criterion_main!(resilience_benchmarks);

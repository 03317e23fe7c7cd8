//! Integration tests for the circuit breaker, rate limiter, fallback
//! orchestrator, health monitor and identity rotation.
//!
//! Every scenario runs on a shared `MockClock`, so recovery timeouts and
//! backoff delays elapse instantly.

mod support;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bulwark_common::error::OperationError;
use bulwark_common::time::MockClock;
use bulwark_core::{
    AdaptiveRateLimiter, AlertSink, CircuitBreakerConfig, CircuitState, EndpointKey, FallbackOrchestrator,
    HealthMonitor, IdentityConfig, IdentityProfile, IdentityRotationManager, MemoryAlertSink,
    MonitorConfig, RateLimitConfig, RequestContext, ResilienceError, Viewport,
};
use futures::future::join_all;
use support::{circuit, classifier, counting_strategy, limiter, Results};

fn strict_circuit_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig::builder()
        .failure_threshold(5)
        .recovery_timeout(Duration::from_secs(60))
        .success_threshold(3)
        .open_on_critical(false)
        .build()
        .expect("valid circuit breaker config")
}

fn orchestrator(clock: &MockClock) -> FallbackOrchestrator<Results> {
    let circuit = Arc::new(circuit(clock, CircuitBreakerConfig::default()));
    let rate = Arc::new(limiter(clock, RateLimitConfig::default()));
    FallbackOrchestrator::with_parts(circuit, rate, clock.shared(), classifier())
}

async fn fail(
    breaker: &bulwark_core::EndpointCircuitBreaker,
    endpoint: &EndpointKey,
    status: u16,
) -> Result<(), ResilienceError> {
    breaker
        .execute(endpoint, || async move {
            Err::<(), _>(OperationError::status(status, "upstream failure"))
        })
        .await
}

/// Validates the forbidden-error scenario against a five-failure threshold.
///
/// # Test Steps
/// 1. Fail five times with 403 on one endpoint
/// 2. Issue a sixth call before the recovery timeout
/// 3. Verify it is rejected as circuit-open without running the operation
#[tokio::test]
async fn test_five_forbidden_errors_open_circuit() {
    let clock = MockClock::new();
    let breaker = circuit(&clock, strict_circuit_config());
    let endpoint = EndpointKey::new("/api/product");

    for _ in 0..5 {
        let result = fail(&breaker, &endpoint, 403).await;
        assert!(matches!(result, Err(ResilienceError::Operation(_))));
    }
    assert_eq!(breaker.state(&endpoint), CircuitState::Open);

    clock.advance(Duration::from_secs(10));
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let result = breaker
        .execute(&endpoint, || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, OperationError>(())
        })
        .await;

    match result {
        Err(ResilienceError::CircuitOpen { retry_after, .. }) => {
            assert_eq!(retry_after, Some(Duration::from_secs(50)));
        }
        other => panic!("expected circuit open, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

/// Validates that an open circuit never invokes the operation until the
/// recovery timeout has fully elapsed.
#[tokio::test]
async fn test_open_circuit_blocks_until_recovery() {
    let clock = MockClock::new();
    let breaker = circuit(&clock, strict_circuit_config());
    let endpoint = EndpointKey::new("/api/search");
    breaker.force_open(&endpoint);

    let calls = Arc::new(AtomicU32::new(0));
    for _ in 0..6 {
        clock.advance(Duration::from_secs(9));
        let counter = Arc::clone(&calls);
        let result = breaker
            .execute(&endpoint, || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, OperationError>(())
            })
            .await;
        assert!(result.is_err_and(|e| e.is_circuit_open()));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    clock.advance(Duration::from_secs(6));
    let counter = Arc::clone(&calls);
    breaker
        .execute(&endpoint, || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, OperationError>(())
        })
        .await
        .expect("probe admitted after recovery timeout");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(breaker.state(&endpoint), CircuitState::HalfOpen);
}

/// Validates that exactly `success_threshold` half-open successes close the
/// circuit.
#[tokio::test]
async fn test_half_open_closes_after_success_threshold() {
    let clock = MockClock::new();
    let breaker = circuit(&clock, strict_circuit_config());
    let endpoint = EndpointKey::new("/api/search");

    for _ in 0..5 {
        let _ = fail(&breaker, &endpoint, 500).await;
    }
    clock.advance(Duration::from_secs(60));

    for expected in [CircuitState::HalfOpen, CircuitState::HalfOpen, CircuitState::Closed] {
        breaker
            .execute(&endpoint, || async { Ok::<_, OperationError>(()) })
            .await
            .expect("half-open probe succeeds");
        assert_eq!(breaker.state(&endpoint), expected);
    }
}

/// Validates the half-open probe cap when many callers arrive together.
///
/// # Test Steps
/// 1. Open the circuit and let recovery elapse
/// 2. Fire ten concurrent calls whose operation takes a moment
/// 3. Verify only three were admitted and their successes closed the circuit
#[tokio::test(flavor = "multi_thread")]
async fn test_half_open_admits_bounded_probes() {
    let clock = MockClock::new();
    let breaker = circuit(&clock, strict_circuit_config());
    let endpoint = EndpointKey::new("/api/search");
    breaker.force_open(&endpoint);
    clock.advance(Duration::from_secs(61));

    let calls = Arc::new(AtomicU32::new(0));
    let results = join_all((0..10).map(|_| {
        let counter = Arc::clone(&calls);
        breaker.execute(&endpoint, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, OperationError>(())
        })
    }))
    .await;

    let rejected = results.iter().filter(|result| result.is_err()).count();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(rejected, 7);
    assert_eq!(breaker.state(&endpoint), CircuitState::Closed);
}

/// Validates per-endpoint isolation under concurrent load from many tasks.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_endpoints_are_isolated() {
    let clock = MockClock::new();
    let breaker = Arc::new(circuit(&clock, strict_circuit_config()));

    let handles: Vec<_> = (0..8)
        .map(|task| {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                let endpoint = EndpointKey::new(format!("/api/shard/{}", task % 2));
                for _ in 0..25 {
                    let outcome = if task % 2 == 0 {
                        Ok::<_, OperationError>(())
                    } else {
                        Err(OperationError::status(500, "shard down"))
                    };
                    let _ = breaker.execute(&endpoint, || async move { outcome }).await;
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.expect("task completes");
    }

    assert_eq!(breaker.state(&EndpointKey::new("/api/shard/0")), CircuitState::Closed);
    assert_eq!(breaker.state(&EndpointKey::new("/api/shard/1")), CircuitState::Open);
    let stats = breaker.stats();
    assert_eq!(stats.total_endpoints, 2);
    assert_eq!(stats.total_requests, 200);
}

/// Validates that the adaptive delay stays within its bounds for a mixed
/// run of successes and classified errors.
#[tokio::test]
async fn test_delay_stays_within_bounds() {
    let clock = MockClock::new();
    let config = RateLimitConfig::builder()
        .initial_delay(Duration::from_millis(500))
        .max_delay(Duration::from_secs(8))
        .max_requests_per_minute(1_000)
        .build()
        .expect("valid rate limit config");
    let rate = limiter(&clock, config.clone());
    let endpoint = EndpointKey::new("/api/search");

    let pattern: [Option<u16>; 12] =
        [Some(403), Some(429), None, Some(500), Some(429), Some(429), None, None, None, Some(403), None, None];
    for status in pattern {
        let _ = rate
            .execute_with_backoff(&endpoint, || async move {
                match status {
                    Some(code) => Err(OperationError::status(code, "upstream failure")),
                    None => Ok(()),
                }
            })
            .await;
        let delay = rate.current_delay(&endpoint);
        assert!(delay >= config.initial_delay, "delay {delay:?} below initial");
        assert!(delay <= config.max_delay, "delay {delay:?} above max");
    }
}

/// Validates that errors are returned unchanged after bookkeeping and that
/// the delay grows by the kind's factor.
#[tokio::test]
async fn test_errors_are_rethrown_and_grow_delay() {
    let clock = MockClock::new();
    let rate = limiter(&clock, RateLimitConfig::default());
    let endpoint = EndpointKey::new("/api/product");

    let result = rate
        .execute_with_backoff(&endpoint, || async {
            Err::<(), _>(OperationError::status(429, "slow down"))
        })
        .await;

    match result {
        Err(ResilienceError::Operation(err)) => assert_eq!(err.status_code(), Some(429)),
        other => panic!("expected the original error, got {other:?}"),
    }
    assert_eq!(rate.current_delay(&endpoint), Duration::from_secs(4));
    assert!(rate.is_in_cooldown(&endpoint));
}

/// Validates the global quota over a sequential run of requests.
///
/// # Test Steps
/// 1. Cap the limiter at five requests per minute
/// 2. Run twelve requests, recording the virtual time of each invocation
/// 3. Verify no sixty second window holds more than five invocations
#[tokio::test]
async fn test_global_quota_limits_window() {
    let clock = MockClock::new();
    let config = RateLimitConfig::builder()
        .initial_delay(Duration::from_millis(10))
        .max_delay(Duration::from_millis(100))
        .max_requests_per_minute(5)
        .build()
        .expect("valid rate limit config");
    let rate = limiter(&clock, config);
    let endpoint = EndpointKey::new("/api/search");

    let mut invoked = Vec::new();
    for _ in 0..12 {
        let at = rate
            .execute_with_backoff(&endpoint, || {
                let at = clock.elapsed();
                async move { Ok::<_, OperationError>(at) }
            })
            .await
            .expect("quota wait succeeds");
        invoked.push(at);
        assert!(rate.global_stats().requests_in_window <= 5);
    }

    let window = Duration::from_secs(60);
    for &start in &invoked {
        let in_window = invoked.iter().filter(|&&at| at >= start && at < start + window).count();
        assert!(in_window <= 5, "{in_window} requests within a minute of {start:?}");
    }
    assert!(clock.elapsed() >= Duration::from_secs(120));
}

/// Validates the global quota when callers race for it from many threads.
///
/// # Test Steps
/// 1. Cap the limiter at five requests per minute
/// 2. Spawn twelve concurrent callers on distinct endpoints
/// 3. Verify every invocation saw at most five admissions in its window
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_global_quota_holds_under_concurrent_callers() {
    let clock = MockClock::new();
    let config = RateLimitConfig::builder()
        .initial_delay(Duration::ZERO)
        .max_requests_per_minute(5)
        .max_quota_waits(20)
        .build()
        .expect("valid rate limit config");
    let rate = Arc::new(limiter(&clock, config));

    let handles: Vec<_> = (0..12)
        .map(|caller| {
            let rate = Arc::clone(&rate);
            tokio::spawn(async move {
                let endpoint = EndpointKey::new(format!("/api/caller/{caller}"));
                let observer = Arc::clone(&rate);
                rate.execute_with_backoff(&endpoint, || async move {
                    Ok::<_, OperationError>(observer.global_stats().requests_in_window)
                })
                .await
            })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        let in_window = handle.await.expect("task completes").expect("quota wait succeeds");
        assert!(in_window <= 5, "{in_window} admissions inside one window");
        admitted += 1;
    }
    assert_eq!(admitted, 12);
    assert!(clock.elapsed() >= Duration::from_secs(120));
}

/// Validates that the highest-priority valid strategy wins whatever order
/// the strategies were registered in.
#[tokio::test]
async fn test_highest_priority_result_wins() {
    let orders: [[usize; 3]; 3] = [[0, 1, 2], [2, 1, 0], [1, 2, 0]];
    let tiers = [("primary", 100), ("alternative", 80), ("legacy", 60)];

    for order in orders {
        let clock = MockClock::new();
        let fallback = orchestrator(&clock);
        let calls: Vec<Arc<AtomicU32>> = (0..3).map(|_| Arc::new(AtomicU32::new(0))).collect();
        for index in order {
            let (name, priority) = tiers[index];
            fallback.register_strategy(
                "search",
                counting_strategy(name, priority, Arc::clone(&calls[index]), Ok(2)),
            );
        }

        let outcome = fallback
            .execute_with_fallback("search", "laptop", &["notebook"], |data| !data.is_empty())
            .await;

        assert_eq!(outcome.strategy_used.as_deref(), Some("primary"));
        assert_eq!(outcome.data, Some(vec!["laptop#0".to_string(), "laptop#1".to_string()]));
        assert_eq!(calls[1].load(Ordering::SeqCst) + calls[2].load(Ordering::SeqCst), 0);
    }
}

/// Validates fallthrough from a failing strategy to a working one.
#[tokio::test]
async fn test_failed_strategy_falls_back() {
    let clock = MockClock::new();
    let fallback = orchestrator(&clock);
    let a_calls = Arc::new(AtomicU32::new(0));
    let b_calls = Arc::new(AtomicU32::new(0));
    fallback.register_strategy("search", counting_strategy("A", 100, a_calls.clone(), Err(500)));
    fallback.register_strategy("search", counting_strategy("B", 80, b_calls.clone(), Ok(3)));

    let outcome =
        fallback.execute_with_fallback("search", "laptop", &[], |data| !data.is_empty()).await;

    assert!(outcome.success);
    assert_eq!(outcome.strategy_used.as_deref(), Some("B"));
    assert_eq!(outcome.attempt_count, 2);
    assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    assert_eq!(clock.total_slept(), Duration::from_secs(1));
}

/// Validates that strategies behind an open circuit are skipped without
/// being called.
#[tokio::test]
async fn test_open_circuit_strategy_is_skipped() {
    let clock = MockClock::new();
    let circuit = Arc::new(circuit(&clock, CircuitBreakerConfig::default()));
    let rate = Arc::new(limiter(&clock, RateLimitConfig::default()));
    let fallback =
        FallbackOrchestrator::with_parts(Arc::clone(&circuit), rate, clock.shared(), classifier());

    let blocked = Arc::new(AtomicU32::new(0));
    fallback.register_strategy("search", counting_strategy("A", 100, blocked.clone(), Ok(1)));
    fallback.register_strategy("search", counting_strategy("B", 80, Arc::new(AtomicU32::new(0)), Ok(1)));
    circuit.force_open(&EndpointKey::new("A"));

    let outcome = fallback.execute_with_fallback("search", "laptop", &[], |_| true).await;

    assert_eq!(outcome.strategy_used.as_deref(), Some("B"));
    assert_eq!(outcome.attempt_count, 2);
    assert_eq!(blocked.load(Ordering::SeqCst), 0);
}

/// Validates the forbidden-burst alert and its cooldown.
///
/// # Test Steps
/// 1. Track three 403 errors on one endpoint inside five minutes
/// 2. Verify exactly one alert with a recommendation was sent
/// 3. Track a fourth 403 one second later
/// 4. Verify the alert was suppressed
#[tokio::test]
async fn test_forbidden_burst_alerts_once() {
    let clock = MockClock::new();
    let sink = Arc::new(MemoryAlertSink::new());
    let monitor = HealthMonitor::with_parts(
        MonitorConfig::default(),
        clock.shared(),
        classifier(),
        vec![sink.clone() as Arc<dyn AlertSink>],
    )
    .expect("valid monitor config");
    let context = RequestContext::new("/api/product").with_operation("product_lookup");
    let forbidden = OperationError::status(403, "blocked");

    for _ in 0..3 {
        monitor.track_error(&forbidden, &context);
        clock.advance(Duration::from_secs(30));
    }
    let alerts = sink.alerts();
    assert_eq!(alerts.len(), 1);
    assert!(!alerts[0].recommendation.is_empty());
    assert_eq!(alerts[0].endpoint.as_str(), "/api/product");

    clock.advance(Duration::from_secs(1));
    assert!(monitor.track_error(&forbidden, &context).is_none());
    assert_eq!(sink.len(), 1);
    assert_eq!(monitor.stats().alerts_suppressed, 1);
}

/// Validates that an exhausted identity becomes available again once its
/// cooldown elapses, without a manual reset.
#[tokio::test]
async fn test_identity_recovers_after_cooldown() {
    let clock = MockClock::new();
    let profiles = vec![
        IdentityProfile::new("agent-a", "Win32", "en-US", Viewport { width: 1920, height: 1080 }),
        IdentityProfile::new("agent-b", "MacIntel", "en-GB", Viewport { width: 1440, height: 900 }),
    ];
    let config = IdentityConfig {
        max_usage_per_profile: 3,
        cooldown_period: Duration::from_secs(300),
        profiles,
        ..IdentityConfig::default()
    };
    let identities = IdentityRotationManager::with_parts(config, clock.shared(), Some(7))
        .expect("valid identity config");

    for _ in 0..6 {
        identities.next_profile();
    }
    assert!(!identities.is_available(0));
    assert!(!identities.is_available(1));

    clock.advance(Duration::from_secs(299));
    assert!(!identities.is_available(0));

    clock.advance(Duration::from_secs(1));
    assert!(identities.is_available(0));
    assert!(identities.is_available(1));
    assert_eq!(identities.next_profile().user_agent, "agent-a");
}

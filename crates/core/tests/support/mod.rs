//! Shared test helpers for `bulwark-core` integration tests.
//!
//! Every component is built on a [`MockClock`] so backoff, cooldown and
//! recovery paths run without real waiting.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bulwark_common::error::{DefaultClassifier, ErrorClassifier, OperationError};
use bulwark_common::observability::{init_tracing, LogFormat};
use bulwark_common::time::MockClock;
use bulwark_core::{
    AdaptiveRateLimiter, CircuitBreakerConfig, Coordinator, Credential, CredentialSource,
    EndpointCircuitBreaker, IdentityProfile, MemoryAlertSink, ProfiledStrategy, RateLimitConfig,
    ResilienceConfig, Strategy, StrategyTier,
};

pub type Results = Vec<String>;

pub fn classifier() -> Arc<dyn ErrorClassifier> {
    Arc::new(DefaultClassifier)
}

pub fn circuit(clock: &MockClock, config: CircuitBreakerConfig) -> EndpointCircuitBreaker {
    EndpointCircuitBreaker::with_parts(config, clock.shared(), classifier())
        .expect("valid circuit breaker config")
}

pub fn limiter(clock: &MockClock, config: RateLimitConfig) -> AdaptiveRateLimiter {
    AdaptiveRateLimiter::with_parts(config, clock.shared(), classifier())
        .expect("valid rate limit config")
}

/// Coordinator on `clock` with alerts captured in the returned sink.
pub fn coordinator(
    clock: &MockClock,
    config: ResilienceConfig,
) -> (Arc<Coordinator<Results>>, Arc<MemoryAlertSink>) {
    let _ = init_tracing(LogFormat::Pretty);
    let sink = Arc::new(MemoryAlertSink::new());
    let coordinator = Coordinator::builder()
        .config(config)
        .clock(clock.shared())
        .alert_sink(sink.clone())
        .seed(42)
        .build()
        .expect("valid coordinator config");
    (Arc::new(coordinator), sink)
}

/// Strategy that counts its calls and either returns `hits` results for
/// the query or fails with `status`.
pub fn counting_strategy(
    name: &str,
    priority: i32,
    calls: Arc<AtomicU32>,
    outcome: Result<usize, u16>,
) -> Arc<dyn Strategy<Results>> {
    let tier = StrategyTier::new(name, priority, Duration::from_secs(10), 0);
    Arc::new(ProfiledStrategy::new(tier, move |query: String| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            match outcome {
                Ok(hits) => Ok((0..hits).map(|i| format!("{query}#{i}")).collect()),
                Err(status) => Err(OperationError::status(status, "upstream failure")),
            }
        }
    }))
}

/// Credential source that issues one token per call.
#[derive(Debug, Default)]
pub struct StaticCredentialSource {
    pub calls: AtomicU32,
}

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn acquire(
        &self,
        identity: &IdentityProfile,
    ) -> Result<Option<Credential>, OperationError> {
        let issued = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Credential::new(format!("{}-{issued}", &identity.fingerprint()[..12]))))
    }
}

//! Priority-ordered traversal of fallback strategies.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bulwark_common::error::{DefaultClassifier, ErrorClassifier, ErrorKind, OperationError};
use bulwark_common::time::{SharedClock, SystemClock};
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::strategy::{Strategy, StrategyInfo};
use crate::circuit_breaker::EndpointCircuitBreaker;
use crate::error::{ResilienceError, ResilienceResult};
use crate::rate_limiter::AdaptiveRateLimiter;

const DELAY_GROWTH: f64 = 1.5;
const MAX_ATTEMPT_DELAY: Duration = Duration::from_secs(15);
/// Strategies that also receive the alternate queries
const ALTERNATE_STRATEGY_LIMIT: usize = 2;

/// Base pause after a failed attempt, before growth.
fn base_delay(kind: ErrorKind) -> Duration {
    match kind {
        ErrorKind::Forbidden => Duration::from_secs(5),
        ErrorKind::RateLimited => Duration::from_secs(10),
        ErrorKind::ConnectionRefused | ErrorKind::DnsFailure => Duration::from_secs(3),
        ErrorKind::Timeout => Duration::from_secs(2),
        ErrorKind::Unauthorized | ErrorKind::Unclassified => Duration::from_secs(1),
    }
}

/// Pause after the `attempt`-th (1-based) attempt failed with `kind`.
pub fn attempt_delay(kind: ErrorKind, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let delay = base_delay(kind).as_secs_f64() * DELAY_GROWTH.powi(exponent);
    Duration::from_secs_f64(delay.min(MAX_ATTEMPT_DELAY.as_secs_f64()))
}

/// Result of a fallback traversal.
///
/// Failures are reported here rather than as an `Err`, so callers always
/// learn how many attempts ran and for how long.
#[derive(Debug)]
pub struct FallbackOutcome<T> {
    pub operation: String,
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ResilienceError>,
    pub strategy_used: Option<String>,
    pub query_used: Option<String>,
    pub attempt_count: u32,
    pub total_time: Duration,
}

impl<T> FallbackOutcome<T> {
    fn failed(operation: &str, error: ResilienceError, attempt_count: u32, total_time: Duration) -> Self {
        Self {
            operation: operation.to_string(),
            success: false,
            data: None,
            error: Some(error),
            strategy_used: None,
            query_used: None,
            attempt_count,
            total_time,
        }
    }

    pub fn into_result(self) -> ResilienceResult<T> {
        match self.data {
            Some(data) => Ok(data),
            None => Err(self.error.unwrap_or(ResilienceError::FallbackExhausted {
                operation: self.operation,
                attempts: self.attempt_count,
            })),
        }
    }
}

/// Registry snapshot: strategies per logical operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FallbackStats {
    pub total_operations: usize,
    pub total_strategies: usize,
    pub operations: BTreeMap<String, Vec<StrategyInfo>>,
}

struct Attempt<T> {
    strategy: Arc<dyn Strategy<T>>,
    query: String,
    label: String,
}

pub struct FallbackOrchestrator<T> {
    registry: DashMap<String, Vec<Arc<dyn Strategy<T>>>>,
    circuit: Arc<EndpointCircuitBreaker>,
    rate: Arc<AdaptiveRateLimiter>,
    classifier: Arc<dyn ErrorClassifier>,
    clock: SharedClock,
}

impl<T> fmt::Debug for FallbackOrchestrator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackOrchestrator")
            .field("operations", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> FallbackOrchestrator<T> {
    pub fn new(circuit: Arc<EndpointCircuitBreaker>, rate: Arc<AdaptiveRateLimiter>) -> Self {
        Self::with_parts(circuit, rate, Arc::new(SystemClock), Arc::new(DefaultClassifier))
    }

    pub fn with_parts(
        circuit: Arc<EndpointCircuitBreaker>,
        rate: Arc<AdaptiveRateLimiter>,
        clock: SharedClock,
        classifier: Arc<dyn ErrorClassifier>,
    ) -> Self {
        Self { registry: DashMap::new(), circuit, rate, classifier, clock }
    }

    /// Register `strategy` for `operation`, replacing one with the same name.
    ///
    /// The list stays sorted by descending priority; equal priorities keep
    /// registration order.
    pub fn register_strategy(&self, operation: &str, strategy: Arc<dyn Strategy<T>>) {
        let mut strategies = self.registry.entry(operation.to_string()).or_default();
        strategies.retain(|existing| existing.name() != strategy.name());
        info!(
            operation,
            strategy = strategy.name(),
            priority = strategy.priority(),
            "strategy_registered"
        );
        strategies.push(strategy);
        strategies.sort_by_key(|strategy| Reverse(strategy.priority()));
    }

    pub fn remove_strategy(&self, operation: &str, name: &str) -> bool {
        let Some(mut strategies) = self.registry.get_mut(operation) else {
            return false;
        };
        let before = strategies.len();
        strategies.retain(|strategy| strategy.name() != name);
        before != strategies.len()
    }

    pub fn clear_strategies(&self, operation: &str) {
        self.registry.remove(operation);
    }

    pub fn registered_strategies(&self, operation: &str) -> Vec<String> {
        self.registry
            .get(operation)
            .map(|strategies| strategies.iter().map(|s| s.name().to_string()).collect())
            .unwrap_or_default()
    }

    pub fn has_strategies(&self, operation: &str) -> bool {
        self.registry.get(operation).is_some_and(|strategies| !strategies.is_empty())
    }

    pub fn stats(&self) -> FallbackStats {
        let operations: BTreeMap<String, Vec<StrategyInfo>> = self
            .registry
            .iter()
            .map(|entry| {
                let infos = entry.value().iter().map(|s| StrategyInfo::of(s.as_ref())).collect();
                (entry.key().clone(), infos)
            })
            .collect();
        FallbackStats {
            total_operations: operations.len(),
            total_strategies: operations.values().map(Vec::len).sum(),
            operations,
        }
    }

    fn build_attempts(&self, operation: &str, primary: &str, alternates: &[&str]) -> Vec<Attempt<T>> {
        let strategies: Vec<Arc<dyn Strategy<T>>> =
            self.registry.get(operation).map(|entry| entry.value().clone()).unwrap_or_default();

        let mut attempts: Vec<Attempt<T>> = strategies
            .iter()
            .filter(|strategy| strategy.is_available())
            .map(|strategy| Attempt {
                strategy: Arc::clone(strategy),
                query: primary.to_string(),
                label: strategy.name().to_string(),
            })
            .collect();

        for alternate in alternates {
            for strategy in strategies.iter().take(ALTERNATE_STRATEGY_LIMIT) {
                if strategy.is_available() {
                    attempts.push(Attempt {
                        strategy: Arc::clone(strategy),
                        query: (*alternate).to_string(),
                        label: format!("{}_alternate", strategy.name()),
                    });
                }
            }
        }
        attempts
    }

    async fn run_attempt(&self, attempt: &Attempt<T>) -> ResilienceResult<T> {
        let endpoint = attempt.strategy.endpoint();
        let strategy = Arc::clone(&attempt.strategy);
        let query = attempt.query.clone();
        let timeout = strategy.timeout();

        self.circuit
            .execute(&endpoint, || {
                self.rate.execute_with_backoff(&endpoint, || async move {
                    match tokio::time::timeout(timeout, strategy.execute(&query)).await {
                        Ok(result) => result,
                        Err(_) => Err(OperationError::timeout(timeout)),
                    }
                })
            })
            .await
    }

    /// Try every strategy for `operation` until `validator` accepts a result.
    pub async fn execute_with_fallback<V>(
        &self,
        operation: &str,
        primary: &str,
        alternates: &[&str],
        validator: V,
    ) -> FallbackOutcome<T>
    where
        V: Fn(&T) -> bool + Send + Sync,
    {
        self.execute_with_fallback_cancellable(
            operation,
            primary,
            alternates,
            validator,
            CancellationToken::new(),
        )
        .await
    }

    /// Like [`Self::execute_with_fallback`], aborting as soon as `cancel`
    /// fires. The in-flight attempt is dropped, not detached.
    #[instrument(skip(self, alternates, validator, cancel), fields(operation = %operation))]
    pub async fn execute_with_fallback_cancellable<V>(
        &self,
        operation: &str,
        primary: &str,
        alternates: &[&str],
        validator: V,
        cancel: CancellationToken,
    ) -> FallbackOutcome<T>
    where
        V: Fn(&T) -> bool + Send + Sync,
    {
        let started = self.clock.now();
        let elapsed = |clock: &SharedClock| clock.now().saturating_duration_since(started);

        if !self.has_strategies(operation) {
            warn!(operation, "no_strategies_registered");
            return FallbackOutcome::failed(
                operation,
                ResilienceError::NoStrategies { operation: operation.to_string() },
                0,
                elapsed(&self.clock),
            );
        }

        let attempts = self.build_attempts(operation, primary, alternates);
        let mut attempt_count = 0_u32;
        let mut last_error: Option<ResilienceError> = None;

        for (index, attempt) in attempts.iter().enumerate() {
            if cancel.is_cancelled() {
                return FallbackOutcome::failed(
                    operation,
                    ResilienceError::Cancelled,
                    attempt_count,
                    elapsed(&self.clock),
                );
            }
            attempt_count += 1;

            let endpoint = attempt.strategy.endpoint();
            if !self.circuit.is_available(&endpoint) || self.rate.is_in_cooldown(&endpoint) {
                debug!(strategy = %attempt.label, endpoint = %endpoint, "attempt_skipped");
                continue;
            }

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!(strategy = %attempt.label, "fallback_cancelled");
                    return FallbackOutcome::failed(
                        operation,
                        ResilienceError::Cancelled,
                        attempt_count,
                        elapsed(&self.clock),
                    );
                }
                result = self.run_attempt(attempt) => result,
            };

            match result {
                Ok(data) if validator(&data) => {
                    info!(
                        strategy = %attempt.label,
                        attempts = attempt_count,
                        "fallback_succeeded"
                    );
                    return FallbackOutcome {
                        operation: operation.to_string(),
                        success: true,
                        data: Some(data),
                        error: None,
                        strategy_used: Some(attempt.strategy.name().to_string()),
                        query_used: Some(attempt.query.clone()),
                        attempt_count,
                        total_time: elapsed(&self.clock),
                    };
                }
                Ok(_) => {
                    warn!(strategy = %attempt.label, query = %attempt.query, "fallback_result_invalid");
                }
                Err(err) => {
                    let kind = err.kind_with(|e| self.classifier.classify(e));
                    warn!(
                        strategy = %attempt.label,
                        kind = %kind,
                        error = %err,
                        "fallback_attempt_failed"
                    );
                    last_error = Some(err);

                    if index + 1 < attempts.len() {
                        let delay = attempt_delay(kind, attempt_count);
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => {
                                return FallbackOutcome::failed(
                                    operation,
                                    ResilienceError::Cancelled,
                                    attempt_count,
                                    elapsed(&self.clock),
                                );
                            }
                            () = self.clock.sleep(delay) => {}
                        }
                    }
                }
            }
        }

        let error = last_error.unwrap_or(ResilienceError::FallbackExhausted {
            operation: operation.to_string(),
            attempts: attempt_count,
        });
        warn!(operation, attempts = attempt_count, error = %error, "fallback_exhausted");
        FallbackOutcome::failed(operation, error, attempt_count, elapsed(&self.clock))
    }
}

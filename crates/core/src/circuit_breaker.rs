//! Per-endpoint circuit breaker
//!
//! Each endpoint key owns an independent three-state machine:
//!
//! ```text
//!            failure_threshold reached / critical error
//!   CLOSED ─────────────────────────────────────────────▶ OPEN
//!     ▲                                                   │
//!     │ success_threshold successes                       │ recovery_timeout elapsed
//!     │                                                   ▼ (first call)
//!     └──────────────────────────────────────────────── HALF_OPEN
//!                        any failure ──▶ OPEN
//! ```
//!
//! States are created lazily on first use and swept by [`cleanup`] once an
//! endpoint has been idle for twice the monitoring window.
//!
//! [`cleanup`]: EndpointCircuitBreaker::cleanup

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bulwark_common::duration_millis;
use bulwark_common::error::{
    ConfigError, ConfigResult, DefaultClassifier, ErrorClassifier, ErrorKind,
};
use bulwark_common::time::{SharedClock, SystemClock};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::endpoint::EndpointKey;
use crate::error::{ResilienceError, ResilienceResult};

//==============================================================================
// Configuration
//==============================================================================

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within the monitoring window before the circuit opens
    pub failure_threshold: u32,
    /// How long an open circuit waits before admitting a probe
    #[serde(with = "duration_millis")]
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes needed to close
    pub success_threshold: u32,
    /// Span after which the failure count starts over
    #[serde(with = "duration_millis")]
    pub monitoring_window: Duration,
    /// Concurrent probes admitted while half-open
    pub half_open_max_calls: u32,
    /// Open immediately on critical error kinds
    pub open_on_critical: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(300),
            success_threshold: 3,
            monitoring_window: Duration::from_secs(600),
            half_open_max_calls: 3,
            open_on_critical: true,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold", "must be greater than 0"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold", "must be greater than 0"));
        }
        if self.half_open_max_calls == 0 {
            return Err(ConfigError::invalid("half_open_max_calls", "must be greater than 0"));
        }
        if self.recovery_timeout.is_zero() {
            return Err(ConfigError::invalid("recovery_timeout", "must be greater than 0"));
        }
        if self.monitoring_window.is_zero() {
            return Err(ConfigError::invalid("monitoring_window", "must be greater than 0"));
        }
        Ok(())
    }

    /// Endpoints idle longer than this are removed by `cleanup`.
    pub fn idle_eviction(&self) -> Duration {
        self.monitoring_window.saturating_mul(2)
    }
}

/// Builder for circuit breaker configuration
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.recovery_timeout = timeout;
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn monitoring_window(mut self, window: Duration) -> Self {
        self.config.monitoring_window = window;
        self
    }

    pub fn half_open_max_calls(mut self, max_calls: u32) -> Self {
        self.config.half_open_max_calls = max_calls;
        self
    }

    pub fn open_on_critical(mut self, enabled: bool) -> Self {
        self.config.open_on_critical = enabled;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

//==============================================================================
// State
//==============================================================================

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected without invoking the operation
    Open,
    /// A limited number of probes test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug)]
struct EndpointCircuitState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    last_success_time: Option<Instant>,
    window_start: Instant,
    total_requests: u64,
    blocked_requests: u64,
    half_open_in_flight: u32,
    /// Bumped on every transition into HALF_OPEN and on `force_close`
    generation: u64,
}

impl EndpointCircuitState {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_success_time: None,
            window_start: now,
            total_requests: 0,
            blocked_requests: 0,
            half_open_in_flight: 0,
            generation: 0,
        }
    }

    fn open_elapsed(&self, now: Instant) -> Duration {
        self.last_failure_time.map_or(Duration::MAX, |at| now.saturating_duration_since(at))
    }

    fn last_activity(&self) -> Instant {
        match (self.last_failure_time, self.last_success_time) {
            (Some(failure), Some(success)) => failure.max(success),
            (Some(at), None) | (None, Some(at)) => at,
            (None, None) => self.window_start,
        }
    }

    fn availability(&self) -> f64 {
        if self.total_requests == 0 {
            return 100.0;
        }
        let admitted = self.total_requests.saturating_sub(self.blocked_requests) as f64;
        let ratio = admitted / self.total_requests as f64 * 100.0;
        (ratio * 100.0).round() / 100.0
    }
}

/// Point-in-time view of one endpoint's circuit
#[derive(Debug, Clone, Serialize)]
pub struct EndpointCircuitSnapshot {
    pub endpoint: EndpointKey,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_requests: u64,
    pub blocked_requests: u64,
    /// Percentage of calls that were not blocked, rounded to two decimals
    pub availability: f64,
    #[serde(with = "bulwark_common::option_duration_millis")]
    pub since_last_failure: Option<Duration>,
    #[serde(with = "bulwark_common::option_duration_millis")]
    pub since_last_success: Option<Duration>,
}

/// Aggregated circuit breaker statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CircuitBreakerStats {
    pub total_endpoints: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub endpoints: Vec<EndpointCircuitSnapshot>,
}

//==============================================================================
// Breaker
//==============================================================================

type SharedState = Arc<Mutex<EndpointCircuitState>>;

/// Releases a half-open probe slot even when the wrapped future is dropped.
///
/// A trial call from an earlier half-open period leaves the current period's
/// slots alone.
struct ProbeGuard {
    state: Option<SharedState>,
    generation: u64,
}

impl ProbeGuard {
    fn release(&mut self) {
        if let Some(state) = self.state.take() {
            let mut guard = state.lock();
            if guard.generation == self.generation {
                guard.half_open_in_flight = guard.half_open_in_flight.saturating_sub(1);
            }
        }
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Circuit breaker keyed by endpoint
///
/// All per-endpoint state lives in a sharded map with one lock per entry;
/// locks are never held across the wrapped operation.
pub struct EndpointCircuitBreaker {
    config: RwLock<CircuitBreakerConfig>,
    endpoints: DashMap<EndpointKey, SharedState>,
    classifier: Arc<dyn ErrorClassifier>,
    clock: SharedClock,
}

impl fmt::Debug for EndpointCircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointCircuitBreaker")
            .field("config", &*self.config.read())
            .field("endpoints", &self.endpoints.len())
            .finish_non_exhaustive()
    }
}

impl Default for EndpointCircuitBreaker {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl EndpointCircuitBreaker {
    /// Create a breaker with the system clock and default classifier.
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_parts(config, Arc::new(SystemClock), Arc::new(DefaultClassifier))
    }

    pub fn with_defaults() -> Self {
        Self {
            config: RwLock::new(CircuitBreakerConfig::default()),
            endpoints: DashMap::new(),
            classifier: Arc::new(DefaultClassifier),
            clock: Arc::new(SystemClock),
        }
    }

    /// Create a breaker with an injected clock and classifier.
    pub fn with_parts(
        config: CircuitBreakerConfig,
        clock: SharedClock,
        classifier: Arc<dyn ErrorClassifier>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self { config: RwLock::new(config), endpoints: DashMap::new(), classifier, clock })
    }

    fn entry(&self, endpoint: &EndpointKey) -> SharedState {
        if let Some(existing) = self.endpoints.get(endpoint) {
            return Arc::clone(existing.value());
        }
        let now = self.clock.now();
        Arc::clone(
            self.endpoints
                .entry(endpoint.clone())
                .or_insert_with(|| Arc::new(Mutex::new(EndpointCircuitState::new(now))))
                .value(),
        )
    }

    /// Execute `operation` through the endpoint's circuit.
    ///
    /// Returns [`ResilienceError::CircuitOpen`] without invoking the
    /// operation when the circuit does not admit calls. Only
    /// [`ResilienceError::Operation`] failures are recorded against the
    /// circuit; other resilience errors pass through untouched.
    #[instrument(skip(self, operation), fields(endpoint = %endpoint))]
    pub async fn execute<F, Fut, T, E>(
        &self,
        endpoint: &EndpointKey,
        operation: F,
    ) -> ResilienceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
    {
        let state = self.entry(endpoint);
        let mut probe = self.admit(endpoint, &state)?;

        let outcome: ResilienceResult<T> = operation().await.map_err(Into::into);
        probe.release();

        match &outcome {
            Ok(_) => self.on_success(endpoint, &state, Some(probe.generation)),
            Err(ResilienceError::Operation(err)) => {
                let kind = self.classifier.classify(err);
                self.on_failure(endpoint, &state, kind);
            }
            Err(other) => {
                debug!(endpoint = %endpoint, error = other.label(), "circuit_passthrough_error");
            }
        }

        outcome
    }

    /// Admission check with side effects: counts the request, moves OPEN to
    /// HALF_OPEN once recovery elapsed and reserves a probe slot.
    fn admit(&self, endpoint: &EndpointKey, state: &SharedState) -> ResilienceResult<ProbeGuard> {
        let config = self.config.read().clone();
        let now = self.clock.now();
        let mut guard = state.lock();
        guard.total_requests += 1;

        if guard.state == CircuitState::Open {
            let elapsed = guard.open_elapsed(now);
            if elapsed >= config.recovery_timeout {
                guard.state = CircuitState::HalfOpen;
                guard.success_count = 0;
                guard.half_open_in_flight = 0;
                guard.generation = guard.generation.wrapping_add(1);
                info!(endpoint = %endpoint, "circuit_half_open");
            } else {
                guard.blocked_requests += 1;
                let retry_after = config.recovery_timeout.saturating_sub(elapsed);
                debug!(
                    endpoint = %endpoint,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "circuit_rejected"
                );
                return Err(ResilienceError::CircuitOpen {
                    endpoint: endpoint.clone(),
                    retry_after: Some(retry_after),
                });
            }
        }

        if guard.state == CircuitState::HalfOpen {
            if guard.half_open_in_flight >= config.half_open_max_calls {
                guard.blocked_requests += 1;
                debug!(endpoint = %endpoint, "circuit_probe_limit_reached");
                return Err(ResilienceError::CircuitOpen {
                    endpoint: endpoint.clone(),
                    retry_after: None,
                });
            }
            guard.half_open_in_flight += 1;
            return Ok(ProbeGuard { state: Some(Arc::clone(state)), generation: guard.generation });
        }

        Ok(ProbeGuard { state: None, generation: guard.generation })
    }

    /// `generation` is the period the call was admitted in; successes from
    /// an earlier period are ignored.
    fn on_success(&self, endpoint: &EndpointKey, state: &SharedState, generation: Option<u64>) {
        let success_threshold = self.config.read().success_threshold;
        let now = self.clock.now();
        let mut guard = state.lock();
        if generation.is_some_and(|admitted| admitted != guard.generation) {
            debug!(endpoint = %endpoint, "stale_success_ignored");
            return;
        }
        guard.success_count = guard.success_count.saturating_add(1);
        guard.last_success_time = Some(now);

        match guard.state {
            CircuitState::HalfOpen if guard.success_count >= success_threshold => {
                guard.state = CircuitState::Closed;
                guard.failure_count = 0;
                guard.window_start = now;
                info!(endpoint = %endpoint, successes = guard.success_count, "circuit_closed");
            }
            CircuitState::Closed => {
                guard.failure_count = guard.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn on_failure(&self, endpoint: &EndpointKey, state: &SharedState, kind: ErrorKind) {
        let config = self.config.read().clone();
        let now = self.clock.now();
        let mut guard = state.lock();

        if now.saturating_duration_since(guard.window_start) > config.monitoring_window {
            guard.window_start = now;
            guard.failure_count = 1;
        } else {
            guard.failure_count = guard.failure_count.saturating_add(1);
        }
        guard.last_failure_time = Some(now);

        match guard.state {
            CircuitState::HalfOpen => {
                guard.state = CircuitState::Open;
                guard.success_count = 0;
                warn!(endpoint = %endpoint, kind = %kind, "circuit_reopened");
            }
            CircuitState::Closed => {
                let critical = config.open_on_critical && kind.is_critical();
                if critical || guard.failure_count >= config.failure_threshold {
                    guard.state = CircuitState::Open;
                    warn!(
                        endpoint = %endpoint,
                        kind = %kind,
                        failures = guard.failure_count,
                        critical,
                        "circuit_opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a success observed outside `execute`.
    pub fn record_success(&self, endpoint: &EndpointKey) {
        let state = self.entry(endpoint);
        self.on_success(endpoint, &state, None);
    }

    /// Record a failure of `kind` observed outside `execute`.
    pub fn record_failure(&self, endpoint: &EndpointKey, kind: ErrorKind) {
        let state = self.entry(endpoint);
        self.on_failure(endpoint, &state, kind);
    }

    /// Whether a call to `endpoint` would currently be admitted.
    ///
    /// Unlike `execute` this never changes state; an open circuit whose
    /// recovery timeout elapsed reports available and transitions on the
    /// next real call.
    pub fn is_available(&self, endpoint: &EndpointKey) -> bool {
        let Some(state) = self.endpoints.get(endpoint).map(|entry| Arc::clone(entry.value()))
        else {
            return true;
        };
        let config = self.config.read().clone();
        let now = self.clock.now();
        let guard = state.lock();
        match guard.state {
            CircuitState::Closed => true,
            CircuitState::Open => guard.open_elapsed(now) >= config.recovery_timeout,
            CircuitState::HalfOpen => guard.half_open_in_flight < config.half_open_max_calls,
        }
    }

    /// Current state; unknown endpoints are `Closed`.
    pub fn state(&self, endpoint: &EndpointKey) -> CircuitState {
        self.endpoints.get(endpoint).map_or(CircuitState::Closed, |entry| entry.value().lock().state)
    }

    pub fn force_open(&self, endpoint: &EndpointKey) {
        let state = self.entry(endpoint);
        let mut guard = state.lock();
        guard.state = CircuitState::Open;
        guard.last_failure_time = Some(self.clock.now());
        warn!(endpoint = %endpoint, "circuit_forced_open");
    }

    pub fn force_close(&self, endpoint: &EndpointKey) {
        let state = self.entry(endpoint);
        let mut guard = state.lock();
        guard.state = CircuitState::Closed;
        guard.failure_count = 0;
        guard.success_count = 0;
        guard.half_open_in_flight = 0;
        guard.generation = guard.generation.wrapping_add(1);
        guard.window_start = self.clock.now();
        info!(endpoint = %endpoint, "circuit_forced_closed");
    }

    /// Forget all state for one endpoint.
    pub fn reset(&self, endpoint: &EndpointKey) {
        self.endpoints.remove(endpoint);
    }

    pub fn reset_all(&self) {
        self.endpoints.clear();
    }

    /// Remove endpoints idle longer than twice the monitoring window.
    ///
    /// Returns the number of removed endpoints.
    pub fn cleanup(&self) -> usize {
        let idle_limit = self.config.read().idle_eviction();
        let now = self.clock.now();
        let before = self.endpoints.len();
        self.endpoints.retain(|endpoint, state| {
            let guard = state.lock();
            let keep = guard.half_open_in_flight > 0
                || now.saturating_duration_since(guard.last_activity()) <= idle_limit;
            if !keep {
                debug!(endpoint = %endpoint, "circuit_state_evicted");
            }
            keep
        });
        let removed = before.saturating_sub(self.endpoints.len());
        if removed > 0 {
            info!(removed, "circuit_cleanup_completed");
        }
        removed
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let now = self.clock.now();
        let mut stats = CircuitBreakerStats::default();

        for entry in &self.endpoints {
            let guard = entry.value().lock();
            match guard.state {
                CircuitState::Closed => stats.closed += 1,
                CircuitState::Open => stats.open += 1,
                CircuitState::HalfOpen => stats.half_open += 1,
            }
            stats.total_requests += guard.total_requests;
            stats.blocked_requests += guard.blocked_requests;
            stats.endpoints.push(EndpointCircuitSnapshot {
                endpoint: entry.key().clone(),
                state: guard.state,
                failure_count: guard.failure_count,
                success_count: guard.success_count,
                total_requests: guard.total_requests,
                blocked_requests: guard.blocked_requests,
                availability: guard.availability(),
                since_last_failure: guard
                    .last_failure_time
                    .map(|at| now.saturating_duration_since(at)),
                since_last_success: guard
                    .last_success_time
                    .map(|at| now.saturating_duration_since(at)),
            });
        }

        stats.total_endpoints = stats.endpoints.len();
        stats.endpoints.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        stats
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config.read().clone()
    }

    /// Replace the configuration; existing endpoint state is kept.
    pub fn update_config(&self, config: CircuitBreakerConfig) -> ConfigResult<()> {
        config.validate()?;
        info!(
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout.as_millis() as u64,
            "circuit_config_updated"
        );
        *self.config.write() = config;
        Ok(())
    }
}

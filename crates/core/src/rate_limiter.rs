//! Adaptive rate limiter
//!
//! Two independent gates guard every call:
//!
//! 1. A process-wide quota: at most `max_requests_per_minute` admissions in
//!    any rolling `quota_window`, tracked as a sliding log of admission times.
//! 2. Per-endpoint spacing: each endpoint keeps a `current_delay` that grows
//!    multiplicatively on errors (by a factor chosen per error class) and
//!    shrinks on success, always staying within
//!    `[initial_delay, max_delay]`. After repeated errors an extra cooldown
//!    applies on top of the spacing.
//!
//! Per-endpoint counters decay by `decay_factor` when their window rolls
//! over instead of resetting, so trends survive the rollover.

use std::collections::VecDeque;
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

/// Delay multipliers applied per error class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffFactors {
    pub forbidden: f64,
    pub rate_limited: f64,
    pub connection_refused: f64,
}

impl Default for BackoffFactors {
    fn default() -> Self {
        Self { forbidden: 3.0, rate_limited: 4.0, connection_refused: 2.5 }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Growth factor for error kinds without a dedicated factor
    pub backoff_multiplier: f64,
    /// Shrink factor applied to the delay after a success
    pub success_reduction: f64,
    pub max_requests_per_minute: u32,
    #[serde(with = "duration_millis")]
    pub quota_window: Duration,
    /// Wait rounds a caller may spend on a saturated quota before giving up
    pub max_quota_waits: u32,
    /// Consecutive errors before the error cooldown applies
    pub error_cooldown_threshold: u32,
    #[serde(with = "duration_millis")]
    pub error_cooldown_step: Duration,
    #[serde(with = "duration_millis")]
    pub error_cooldown_cap: Duration,
    /// How long after the last error an erroring endpoint reports cooldown
    #[serde(with = "duration_millis")]
    pub cooldown_probe_window: Duration,
    #[serde(with = "duration_millis")]
    pub decay_window: Duration,
    pub decay_factor: f64,
    pub factors: BackoffFactors,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            success_reduction: 0.5,
            max_requests_per_minute: 20,
            quota_window: Duration::from_secs(60),
            max_quota_waits: 10,
            error_cooldown_threshold: 3,
            error_cooldown_step: Duration::from_millis(5_000),
            error_cooldown_cap: Duration::from_millis(30_000),
            cooldown_probe_window: Duration::from_millis(15_000),
            decay_window: Duration::from_secs(60),
            decay_factor: 0.1,
            factors: BackoffFactors::default(),
        }
    }
}

impl RateLimitConfig {
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::default()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::invalid("initial_delay", "must not exceed max_delay"));
        }
        if self.max_delay > Duration::from_secs(24 * 3600) {
            return Err(ConfigError::invalid("max_delay", "must not exceed 24 hours"));
        }
        if self.error_cooldown_cap > Duration::from_secs(24 * 3600) {
            return Err(ConfigError::invalid("error_cooldown_cap", "must not exceed 24 hours"));
        }
        let growth = [
            ("backoff_multiplier", self.backoff_multiplier),
            ("factors.forbidden", self.factors.forbidden),
            ("factors.rate_limited", self.factors.rate_limited),
            ("factors.connection_refused", self.factors.connection_refused),
        ];
        for (field, factor) in growth {
            if !factor.is_finite() || factor < 1.0 {
                return Err(ConfigError::invalid(field, format!("must be >= 1.0, got {factor}")));
            }
        }
        if !(self.success_reduction > 0.0 && self.success_reduction <= 1.0) {
            return Err(ConfigError::invalid("success_reduction", "must be within (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.decay_factor) {
            return Err(ConfigError::invalid("decay_factor", "must be within [0, 1]"));
        }
        if self.max_requests_per_minute == 0 {
            return Err(ConfigError::invalid("max_requests_per_minute", "must be greater than 0"));
        }
        if self.quota_window.is_zero() {
            return Err(ConfigError::invalid("quota_window", "must be greater than 0"));
        }
        Ok(())
    }

    /// Delay multiplier for an error of `kind`.
    pub fn factor_for(&self, kind: ErrorKind) -> f64 {
        match kind {
            ErrorKind::Forbidden => self.factors.forbidden,
            ErrorKind::RateLimited => self.factors.rate_limited,
            ErrorKind::ConnectionRefused => self.factors.connection_refused,
            _ => self.backoff_multiplier,
        }
    }

    fn clamp(&self, delay: Duration) -> Duration {
        delay.clamp(self.initial_delay, self.max_delay)
    }

    /// `delay × factor` within bounds; an unrepresentable product saturates
    /// at `max_delay`.
    fn scale(&self, delay: Duration, factor: f64) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
            .map_or(self.max_delay, |scaled| self.clamp(scaled))
    }
}

/// Builder for rate limiter configuration
#[derive(Debug, Clone, Default)]
pub struct RateLimitConfigBuilder {
    config: RateLimitConfig,
}

impl RateLimitConfigBuilder {
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.config.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.backoff_multiplier = multiplier;
        self
    }

    pub fn success_reduction(mut self, reduction: f64) -> Self {
        self.config.success_reduction = reduction;
        self
    }

    pub fn max_requests_per_minute(mut self, max: u32) -> Self {
        self.config.max_requests_per_minute = max;
        self
    }

    pub fn quota_window(mut self, window: Duration) -> Self {
        self.config.quota_window = window;
        self
    }

    pub fn max_quota_waits(mut self, waits: u32) -> Self {
        self.config.max_quota_waits = waits;
        self
    }

    pub fn factors(mut self, factors: BackoffFactors) -> Self {
        self.config.factors = factors;
        self
    }

    pub fn build(self) -> ConfigResult<RateLimitConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

//==============================================================================
// State
//==============================================================================

#[derive(Debug)]
struct EndpointRateState {
    current_delay: Duration,
    request_count: u64,
    success_count: u64,
    error_count: u64,
    consecutive_errors: u32,
    last_request: Option<Instant>,
    last_error: Option<Instant>,
    window_start: Instant,
}

impl EndpointRateState {
    fn new(initial_delay: Duration, now: Instant) -> Self {
        Self {
            current_delay: initial_delay,
            request_count: 0,
            success_count: 0,
            error_count: 0,
            consecutive_errors: 0,
            last_request: None,
            last_error: None,
            window_start: now,
        }
    }

    fn in_cooldown(&self, config: &RateLimitConfig, now: Instant) -> bool {
        let spacing = self
            .last_request
            .is_some_and(|at| now.saturating_duration_since(at) < self.current_delay);
        let erroring = self.consecutive_errors >= config.error_cooldown_threshold
            && self
                .last_error
                .is_some_and(|at| now.saturating_duration_since(at) < config.cooldown_probe_window);
        spacing || erroring
    }

    fn decay(&mut self, config: &RateLimitConfig, now: Instant) {
        if now.saturating_duration_since(self.window_start) <= config.decay_window {
            return;
        }
        let scale = |count: u64| (count as f64 * config.decay_factor).floor() as u64;
        self.window_start = now;
        self.request_count = scale(self.request_count);
        self.success_count = scale(self.success_count);
        self.error_count = scale(self.error_count);
    }

    fn snapshot(&self, endpoint: &EndpointKey, in_cooldown: bool) -> EndpointRateSnapshot {
        let finished = self.success_count + self.error_count;
        let success_rate = if finished == 0 {
            100.0
        } else {
            self.success_count as f64 / finished as f64 * 100.0
        };
        EndpointRateSnapshot {
            endpoint: endpoint.clone(),
            current_delay: self.current_delay,
            request_count: self.request_count,
            success_count: self.success_count,
            error_count: self.error_count,
            consecutive_errors: self.consecutive_errors,
            success_rate,
            in_cooldown,
        }
    }
}

/// Point-in-time view of one endpoint's rate state
#[derive(Debug, Clone, Serialize)]
pub struct EndpointRateSnapshot {
    pub endpoint: EndpointKey,
    #[serde(with = "duration_millis")]
    pub current_delay: Duration,
    pub request_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub consecutive_errors: u32,
    pub success_rate: f64,
    pub in_cooldown: bool,
}

/// Aggregated rate limiter statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct RateLimiterStats {
    pub total_endpoints: usize,
    pub endpoints_in_cooldown: usize,
    pub requests_in_window: usize,
    pub max_requests_per_minute: u32,
    pub endpoints: Vec<EndpointRateSnapshot>,
}

//==============================================================================
// Limiter
//==============================================================================

type SharedState = Arc<Mutex<EndpointRateState>>;

/// Rate limiter with adaptive per-endpoint delays and a global quota
pub struct AdaptiveRateLimiter {
    config: RwLock<RateLimitConfig>,
    endpoints: DashMap<EndpointKey, SharedState>,
    admissions: Mutex<VecDeque<Instant>>,
    classifier: Arc<dyn ErrorClassifier>,
    clock: SharedClock,
}

impl fmt::Debug for AdaptiveRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveRateLimiter")
            .field("config", &*self.config.read())
            .field("endpoints", &self.endpoints.len())
            .finish_non_exhaustive()
    }
}

impl Default for AdaptiveRateLimiter {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl AdaptiveRateLimiter {
    pub fn new(config: RateLimitConfig) -> ConfigResult<Self> {
        Self::with_parts(config, Arc::new(SystemClock), Arc::new(DefaultClassifier))
    }

    pub fn with_defaults() -> Self {
        Self {
            config: RwLock::new(RateLimitConfig::default()),
            endpoints: DashMap::new(),
            admissions: Mutex::new(VecDeque::new()),
            classifier: Arc::new(DefaultClassifier),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_parts(
        config: RateLimitConfig,
        clock: SharedClock,
        classifier: Arc<dyn ErrorClassifier>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config: RwLock::new(config),
            endpoints: DashMap::new(),
            admissions: Mutex::new(VecDeque::new()),
            classifier,
            clock,
        })
    }

    fn entry(&self, endpoint: &EndpointKey) -> SharedState {
        if let Some(existing) = self.endpoints.get(endpoint) {
            return Arc::clone(existing.value());
        }
        let initial_delay = self.config.read().initial_delay;
        let now = self.clock.now();
        Arc::clone(
            self.endpoints
                .entry(endpoint.clone())
                .or_insert_with(|| Arc::new(Mutex::new(EndpointRateState::new(initial_delay, now))))
                .value(),
        )
    }

    /// Run `operation` once the global quota and the endpoint's spacing and
    /// cooldown allow it, then adapt the endpoint delay to the outcome.
    ///
    /// The operation's error is returned unchanged after bookkeeping.
    #[instrument(skip(self, operation), fields(endpoint = %endpoint))]
    pub async fn execute_with_backoff<F, Fut, T, E>(
        &self,
        endpoint: &EndpointKey,
        operation: F,
    ) -> ResilienceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
    {
        self.acquire_quota(endpoint).await?;

        let state = self.entry(endpoint);
        let wait = self.reserve_slot(&state);
        if !wait.is_zero() {
            debug!(endpoint = %endpoint, wait_ms = wait.as_millis() as u64, "endpoint_spacing_wait");
            self.clock.sleep(wait).await;
        }

        let outcome: ResilienceResult<T> = operation().await.map_err(Into::into);
        self.complete(endpoint, &state, &outcome);
        outcome
    }

    /// Wait for a slot in the global quota.
    async fn acquire_quota(&self, endpoint: &EndpointKey) -> ResilienceResult<()> {
        let mut waits = 0_u32;
        loop {
            let (max_requests, window, max_waits) = {
                let config = self.config.read();
                (config.max_requests_per_minute, config.quota_window, config.max_quota_waits)
            };
            let wait = {
                let now = self.clock.now();
                let mut admissions = self.admissions.lock();
                while admissions
                    .front()
                    .is_some_and(|&at| now.saturating_duration_since(at) >= window)
                {
                    admissions.pop_front();
                }
                if admissions.len() < max_requests as usize {
                    admissions.push_back(now);
                    return Ok(());
                }
                admissions.front().map_or(window, |&oldest| {
                    window.saturating_sub(now.saturating_duration_since(oldest))
                })
            };

            if waits >= max_waits {
                warn!(endpoint = %endpoint, waits, "global_quota_exhausted");
                return Err(ResilienceError::QuotaExhausted { endpoint: endpoint.clone(), waits });
            }
            waits += 1;
            info!(endpoint = %endpoint, wait_ms = wait.as_millis() as u64, "global_quota_wait");
            self.clock.sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Compute spacing plus error cooldown and reserve the send slot so
    /// concurrent callers on the same endpoint queue behind each other.
    fn reserve_slot(&self, state: &SharedState) -> Duration {
        let config = self.config.read().clone();
        let now = self.clock.now();
        let mut guard = state.lock();

        let spacing = guard.last_request.map_or(Duration::ZERO, |at| {
            (at + guard.current_delay).saturating_duration_since(now)
        });

        let cooldown = if guard.consecutive_errors >= config.error_cooldown_threshold {
            let full = config
                .error_cooldown_step
                .saturating_mul(guard.consecutive_errors)
                .min(config.error_cooldown_cap);
            let since_error =
                guard.last_error.map_or(Duration::MAX, |at| now.saturating_duration_since(at));
            full.saturating_sub(since_error)
        } else {
            Duration::ZERO
        };

        let wait = spacing.saturating_add(cooldown);
        guard.last_request = Some(now + wait);
        wait
    }

    fn complete<T>(
        &self,
        endpoint: &EndpointKey,
        state: &SharedState,
        outcome: &ResilienceResult<T>,
    ) {
        let config = self.config.read().clone();
        let now = self.clock.now();
        let mut guard = state.lock();
        guard.request_count += 1;
        guard.last_request = Some(now);

        match outcome {
            Ok(_) => {
                guard.success_count += 1;
                guard.consecutive_errors = 0;
                guard.current_delay = config.scale(guard.current_delay, config.success_reduction);
            }
            Err(ResilienceError::Operation(err)) => {
                let kind = self.classifier.classify(err);
                let factor = config.factor_for(kind);
                guard.error_count += 1;
                guard.consecutive_errors = guard.consecutive_errors.saturating_add(1);
                guard.last_error = Some(now);
                guard.current_delay = config.scale(guard.current_delay, factor);
                debug!(
                    endpoint = %endpoint,
                    kind = %kind,
                    factor,
                    delay_ms = guard.current_delay.as_millis() as u64,
                    consecutive_errors = guard.consecutive_errors,
                    "endpoint_backoff_increased"
                );
            }
            Err(_) => {}
        }

        guard.decay(&config, now);
    }

    /// Whether the endpoint is still inside its spacing delay or an error
    /// cooldown.
    pub fn is_in_cooldown(&self, endpoint: &EndpointKey) -> bool {
        let Some(state) = self.endpoints.get(endpoint).map(|entry| Arc::clone(entry.value()))
        else {
            return false;
        };
        let config = self.config.read().clone();
        let now = self.clock.now();
        let guard = state.lock();
        guard.in_cooldown(&config, now)
    }

    /// Current delay for `endpoint`; unknown endpoints report `initial_delay`.
    pub fn current_delay(&self, endpoint: &EndpointKey) -> Duration {
        self.endpoints
            .get(endpoint)
            .map_or_else(|| self.config.read().initial_delay, |entry| entry.value().lock().current_delay)
    }

    pub fn endpoint_stats(&self, endpoint: &EndpointKey) -> Option<EndpointRateSnapshot> {
        let state = self.endpoints.get(endpoint).map(|entry| Arc::clone(entry.value()))?;
        let config = self.config.read().clone();
        let now = self.clock.now();
        let guard = state.lock();
        Some(guard.snapshot(endpoint, guard.in_cooldown(&config, now)))
    }

    pub fn global_stats(&self) -> RateLimiterStats {
        let config = self.config.read().clone();
        let now = self.clock.now();

        let requests_in_window = self
            .admissions
            .lock()
            .iter()
            .filter(|&&at| now.saturating_duration_since(at) < config.quota_window)
            .count();

        let mut endpoints: Vec<EndpointRateSnapshot> = self
            .endpoints
            .iter()
            .map(|entry| {
                let guard = entry.value().lock();
                guard.snapshot(entry.key(), guard.in_cooldown(&config, now))
            })
            .collect();
        endpoints.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));

        RateLimiterStats {
            total_endpoints: endpoints.len(),
            endpoints_in_cooldown: endpoints.iter().filter(|snapshot| snapshot.in_cooldown).count(),
            requests_in_window,
            max_requests_per_minute: config.max_requests_per_minute,
            endpoints,
        }
    }

    pub fn reset_endpoint(&self, endpoint: &EndpointKey) {
        self.endpoints.remove(endpoint);
    }

    /// Forget every endpoint and the global admission log.
    pub fn reset_all(&self) {
        self.endpoints.clear();
        self.admissions.lock().clear();
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config.read().clone()
    }

    /// Replace the configuration and clamp every endpoint's current delay
    /// into the new bounds.
    pub fn update_config(&self, config: RateLimitConfig) -> ConfigResult<()> {
        config.validate()?;
        for entry in &self.endpoints {
            let mut guard = entry.value().lock();
            guard.current_delay = config.clamp(guard.current_delay);
        }
        info!(
            initial_delay_ms = config.initial_delay.as_millis() as u64,
            max_delay_ms = config.max_delay.as_millis() as u64,
            max_requests_per_minute = config.max_requests_per_minute,
            "rate_limit_config_updated"
        );
        *self.config.write() = config;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for the adaptive rate limiter.

    use bulwark_common::error::OperationError;
    use bulwark_common::time::MockClock;

    use super::*;

    fn limiter(config: RateLimitConfig, clock: &MockClock) -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::with_parts(config, clock.shared(), Arc::new(DefaultClassifier))
            .expect("valid config")
    }

    async fn run(
        limiter: &AdaptiveRateLimiter,
        endpoint: &EndpointKey,
        error: Option<OperationError>,
    ) -> ResilienceResult<()> {
        limiter
            .execute_with_backoff(endpoint, || async move {
                match error {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            })
            .await
    }

    #[test]
    fn test_config_default_and_validation() {
        let config = RateLimitConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.max_requests_per_minute, 20);
        assert!(config.validate().is_ok());

        let inverted = RateLimitConfig::builder()
            .initial_delay(Duration::from_secs(10))
            .max_delay(Duration::from_secs(5))
            .build();
        assert!(inverted.is_err());

        let shrinking = RateLimitConfig::builder().backoff_multiplier(0.5).build();
        assert!(shrinking.is_err());
    }

    #[test]
    fn test_factor_for_kind() {
        let config = RateLimitConfig::default();
        assert!((config.factor_for(ErrorKind::Forbidden) - 3.0).abs() < f64::EPSILON);
        assert!((config.factor_for(ErrorKind::RateLimited) - 4.0).abs() < f64::EPSILON);
        assert!((config.factor_for(ErrorKind::ConnectionRefused) - 2.5).abs() < f64::EPSILON);
        assert!((config.factor_for(ErrorKind::Timeout) - 2.0).abs() < f64::EPSILON);
    }

    /// Validates class-specific growth and success shrinkage.
    ///
    /// Assertions:
    /// - Confirms a forbidden error triples the delay
    /// - Confirms a rate-limited error quadruples it, capped at max_delay
    /// - Confirms a success halves it but never below initial_delay
    #[tokio::test]
    async fn test_delay_adapts_to_outcomes() {
        let clock = MockClock::new();
        let limiter = limiter(RateLimitConfig::default(), &clock);
        let endpoint = EndpointKey::new("search");

        let result = run(&limiter, &endpoint, Some(OperationError::status(403, "blocked"))).await;
        assert!(matches!(&result, Err(ResilienceError::Operation(err)) if err.status_code() == Some(403)));
        assert_eq!(limiter.current_delay(&endpoint), Duration::from_secs(3));

        let _ = run(&limiter, &endpoint, Some(OperationError::status(429, "slow"))).await;
        assert_eq!(limiter.current_delay(&endpoint), Duration::from_secs(12));

        let _ = run(&limiter, &endpoint, Some(OperationError::status(429, "slow"))).await;
        assert_eq!(limiter.current_delay(&endpoint), Duration::from_secs(30));

        run(&limiter, &endpoint, None).await.expect("success");
        assert_eq!(limiter.current_delay(&endpoint), Duration::from_secs(15));

        for _ in 0..6 {
            run(&limiter, &endpoint, None).await.expect("success");
        }
        assert_eq!(limiter.current_delay(&endpoint), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_huge_factor_saturates_at_max_delay() {
        let clock = MockClock::new();
        let config = RateLimitConfig::builder()
            .factors(BackoffFactors { forbidden: 1e20, ..BackoffFactors::default() })
            .build()
            .expect("finite factors are accepted");
        let limiter = limiter(config, &clock);
        let endpoint = EndpointKey::new("search");

        let result = run(&limiter, &endpoint, Some(OperationError::status(403, "blocked"))).await;
        assert!(matches!(result, Err(ResilienceError::Operation(_))));
        assert_eq!(limiter.current_delay(&endpoint), Duration::from_secs(30));

        let _ = run(&limiter, &endpoint, Some(OperationError::status(403, "blocked"))).await;
        assert_eq!(limiter.current_delay(&endpoint), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_spacing_waits_for_current_delay() {
        let clock = MockClock::new();
        let limiter = limiter(RateLimitConfig::default(), &clock);
        let endpoint = EndpointKey::new("search");

        run(&limiter, &endpoint, None).await.expect("first call");
        assert_eq!(clock.total_slept(), Duration::ZERO, "first request is not delayed");
        assert!(limiter.is_in_cooldown(&endpoint));

        run(&limiter, &endpoint, None).await.expect("second call");
        assert_eq!(clock.total_slept(), Duration::from_secs(1));
    }

    /// Three consecutive errors add the error cooldown on top of spacing.
    #[tokio::test]
    async fn test_error_cooldown_after_consecutive_errors() {
        let clock = MockClock::new();
        let limiter = limiter(RateLimitConfig::default(), &clock);
        let endpoint = EndpointKey::new("search");

        for _ in 0..3 {
            let _ = run(&limiter, &endpoint, Some(OperationError::new("unclassified"))).await;
        }
        let slept_before = clock.total_slept();
        assert_eq!(limiter.current_delay(&endpoint), Duration::from_secs(8));

        let _ = run(&limiter, &endpoint, None).await;
        let waited = clock.total_slept() - slept_before;
        assert_eq!(waited, Duration::from_secs(8 + 15));

        let stats = limiter.endpoint_stats(&endpoint).expect("tracked endpoint");
        assert_eq!(stats.consecutive_errors, 0);
        assert_eq!(stats.error_count, 3);
    }

    #[tokio::test]
    async fn test_global_quota_waits_for_window() {
        let clock = MockClock::new();
        let config = RateLimitConfig::builder()
            .initial_delay(Duration::ZERO)
            .max_requests_per_minute(3)
            .build()
            .expect("valid config");
        let limiter = limiter(config, &clock);

        for index in 0..3 {
            let endpoint = EndpointKey::new(format!("endpoint-{index}"));
            run(&limiter, &endpoint, None).await.expect("within quota");
        }
        assert_eq!(clock.total_slept(), Duration::ZERO);

        run(&limiter, &EndpointKey::new("endpoint-4"), None).await.expect("after window");
        assert_eq!(clock.total_slept(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_quota_exhausted_after_bounded_waits() {
        let clock = MockClock::new();
        let config = RateLimitConfig::builder()
            .initial_delay(Duration::ZERO)
            .max_requests_per_minute(1)
            .max_quota_waits(0)
            .build()
            .expect("valid config");
        let limiter = limiter(config, &clock);
        let endpoint = EndpointKey::new("search");

        run(&limiter, &endpoint, None).await.expect("first admitted");
        let result = run(&limiter, &endpoint, None).await;
        assert!(matches!(result, Err(ResilienceError::QuotaExhausted { waits: 0, .. })));
    }

    #[tokio::test]
    async fn test_window_rollover_decays_counts() {
        let clock = MockClock::new();
        let config = RateLimitConfig::builder()
            .initial_delay(Duration::ZERO)
            .max_requests_per_minute(100)
            .build()
            .expect("valid config");
        let limiter = limiter(config, &clock);
        let endpoint = EndpointKey::new("search");

        for _ in 0..25 {
            run(&limiter, &endpoint, None).await.expect("success");
        }
        clock.advance(Duration::from_secs(61));
        run(&limiter, &endpoint, None).await.expect("success");

        let stats = limiter.endpoint_stats(&endpoint).expect("tracked endpoint");
        assert_eq!(stats.request_count, 2);
        assert_eq!(stats.success_count, 2);
    }

    #[tokio::test]
    async fn test_update_config_clamps_delays() {
        let clock = MockClock::new();
        let limiter = limiter(RateLimitConfig::default(), &clock);
        let endpoint = EndpointKey::new("search");
        let _ = run(&limiter, &endpoint, Some(OperationError::status(429, "slow"))).await;
        assert_eq!(limiter.current_delay(&endpoint), Duration::from_secs(4));

        let mut config = limiter.config();
        config.initial_delay = Duration::from_secs(10);
        config.max_delay = Duration::from_secs(60);
        limiter.update_config(config).expect("valid config");

        assert_eq!(limiter.current_delay(&endpoint), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_reset_and_global_stats() {
        let clock = MockClock::new();
        let limiter = limiter(RateLimitConfig::default(), &clock);
        run(&limiter, &EndpointKey::new("a"), None).await.expect("success");
        run(&limiter, &EndpointKey::new("b"), None).await.expect("success");

        let stats = limiter.global_stats();
        assert_eq!(stats.total_endpoints, 2);
        assert_eq!(stats.requests_in_window, 2);
        assert_eq!(stats.endpoints_in_cooldown, 2);

        limiter.reset_endpoint(&EndpointKey::new("a"));
        assert_eq!(limiter.global_stats().total_endpoints, 1);

        limiter.reset_all();
        let stats = limiter.global_stats();
        assert_eq!(stats.total_endpoints, 0);
        assert_eq!(stats.requests_in_window, 0);
    }
}

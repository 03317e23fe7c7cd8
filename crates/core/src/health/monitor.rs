//! Rolling success/error telemetry with alerting.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bulwark_common::collections::RingBuffer;
use bulwark_common::error::{
    ConfigError, ConfigResult, DefaultClassifier, ErrorClassifier, ErrorKind, OperationError,
};
use bulwark_common::time::{SharedClock, SystemClock};
use bulwark_common::{duration_millis, option_duration_millis};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::alerts::{Alert, AlertSink, AlertTrigger, RecommendedAction, TracingAlertSink};
use super::report::HealthReport;
use crate::context::RequestContext;
use crate::endpoint::EndpointKey;

/// Health monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Occurrences of one critical kind on one endpoint that raise an alert
    pub error_threshold: usize,
    #[serde(with = "duration_millis")]
    pub error_time_window: Duration,
    pub consecutive_error_threshold: u32,
    /// Percentage below which an alert is raised
    pub success_rate_threshold: f64,
    /// Requests required before the success rate is trusted
    pub min_sample_size: u64,
    #[serde(with = "duration_millis")]
    pub alert_cooldown: Duration,
    pub latency_window: usize,
    pub error_history: usize,
    /// Forbidden errors within the window that call for cooldown mode
    pub cooldown_forbidden_threshold: usize,
    pub rotate_consecutive_threshold: u32,
    pub reduce_load_success_rate: f64,
    pub stop_consecutive_errors: u32,
    pub stop_success_rate: f64,
    pub stop_min_samples: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            error_threshold: 3,
            error_time_window: Duration::from_secs(300),
            consecutive_error_threshold: 5,
            success_rate_threshold: 70.0,
            min_sample_size: 10,
            alert_cooldown: Duration::from_secs(900),
            latency_window: 100,
            error_history: 100,
            cooldown_forbidden_threshold: 5,
            rotate_consecutive_threshold: 5,
            reduce_load_success_rate: 50.0,
            stop_consecutive_errors: 10,
            stop_success_rate: 20.0,
            stop_min_samples: 20,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.error_threshold == 0 {
            return Err(ConfigError::invalid("error_threshold", "must be greater than 0"));
        }
        if self.consecutive_error_threshold == 0 {
            return Err(ConfigError::invalid(
                "consecutive_error_threshold",
                "must be greater than 0",
            ));
        }
        let rates = [
            ("success_rate_threshold", self.success_rate_threshold),
            ("reduce_load_success_rate", self.reduce_load_success_rate),
            ("stop_success_rate", self.stop_success_rate),
        ];
        for (field, rate) in rates {
            if !(0.0..=100.0).contains(&rate) {
                return Err(ConfigError::invalid(field, "must be a percentage within [0, 100]"));
            }
        }
        if self.latency_window == 0 || self.error_history == 0 {
            return Err(ConfigError::invalid("latency_window", "windows must hold at least one sample"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct ErrorRecord {
    kind: ErrorKind,
    endpoint: EndpointKey,
    at: Instant,
}

#[derive(Debug)]
struct MonitorState {
    total_requests: u64,
    success_count: u64,
    error_count: u64,
    rejected_requests: u64,
    errors_by_kind: BTreeMap<ErrorKind, u64>,
    consecutive_errors: u32,
    latencies: RingBuffer<Duration>,
    history: RingBuffer<ErrorRecord>,
    last_alert_at: Option<Instant>,
    alerts_sent: u64,
    alerts_suppressed: u64,
}

impl MonitorState {
    fn new(config: &MonitorConfig) -> Self {
        Self {
            total_requests: 0,
            success_count: 0,
            error_count: 0,
            rejected_requests: 0,
            errors_by_kind: BTreeMap::new(),
            consecutive_errors: 0,
            latencies: RingBuffer::new(config.latency_window),
            history: RingBuffer::new(config.error_history),
            last_alert_at: None,
            alerts_sent: 0,
            alerts_suppressed: 0,
        }
    }

    fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 100.0;
        }
        self.success_count as f64 / self.total_requests as f64 * 100.0
    }

    fn average_latency(&self) -> Duration {
        let samples = u32::try_from(self.latencies.len()).unwrap_or(u32::MAX);
        if samples == 0 {
            return Duration::ZERO;
        }
        self.latencies.iter().sum::<Duration>() / samples
    }

    fn recent(&self, kind: ErrorKind, endpoint: Option<&EndpointKey>, now: Instant, window: Duration) -> usize {
        self.history
            .iter()
            .filter(|record| record.kind == kind)
            .filter(|record| endpoint.map_or(true, |endpoint| &record.endpoint == endpoint))
            .filter(|record| now.saturating_duration_since(record.at) <= window)
            .count()
    }

    fn snapshot(&self, now: Instant) -> MonitoringSnapshot {
        MonitoringSnapshot {
            total_requests: self.total_requests,
            success_count: self.success_count,
            error_count: self.error_count,
            rejected_requests: self.rejected_requests,
            errors_by_kind: self.errors_by_kind.clone(),
            consecutive_errors: self.consecutive_errors,
            success_rate: self.success_rate(),
            average_response_time: self.average_latency(),
            latency_samples: self.latencies.len(),
            alerts_sent: self.alerts_sent,
            alerts_suppressed: self.alerts_suppressed,
            since_last_alert: self.last_alert_at.map(|at| now.saturating_duration_since(at)),
        }
    }
}

/// Point-in-time copy of the monitor's counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitoringSnapshot {
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    /// Calls rejected by an open circuit; not part of the success rate
    pub rejected_requests: u64,
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
    pub consecutive_errors: u32,
    pub success_rate: f64,
    #[serde(with = "duration_millis")]
    pub average_response_time: Duration,
    pub latency_samples: usize,
    pub alerts_sent: u64,
    pub alerts_suppressed: u64,
    #[serde(with = "option_duration_millis")]
    pub since_last_alert: Option<Duration>,
}

/// Aggregates request outcomes and recommends corrective action.
///
/// Every method is infallible; the monitor observes and never interferes
/// with the request it is told about.
pub struct HealthMonitor {
    config: RwLock<MonitorConfig>,
    state: Mutex<MonitorState>,
    sinks: Vec<Arc<dyn AlertSink>>,
    classifier: Arc<dyn ErrorClassifier>,
    clock: SharedClock,
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &*self.config.read())
            .field("sinks", &self.sinks.len())
            .finish_non_exhaustive()
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        let config = MonitorConfig::default();
        Self {
            state: Mutex::new(MonitorState::new(&config)),
            config: RwLock::new(config),
            sinks: vec![Arc::new(TracingAlertSink)],
            classifier: Arc::new(DefaultClassifier),
            clock: Arc::new(SystemClock),
        }
    }
}

impl HealthMonitor {
    /// Monitor with the system clock and the tracing sink.
    pub fn new(config: MonitorConfig) -> ConfigResult<Self> {
        Self::with_parts(
            config,
            Arc::new(SystemClock),
            Arc::new(DefaultClassifier),
            vec![Arc::new(TracingAlertSink)],
        )
    }

    pub fn with_parts(
        config: MonitorConfig,
        clock: SharedClock,
        classifier: Arc<dyn ErrorClassifier>,
        sinks: Vec<Arc<dyn AlertSink>>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(MonitorState::new(&config)),
            config: RwLock::new(config),
            sinks,
            classifier,
            clock,
        })
    }

    pub fn track_success(&self, context: &RequestContext, latency: Duration) {
        let mut state = self.state.lock();
        state.total_requests += 1;
        state.success_count += 1;
        state.consecutive_errors = 0;
        state.latencies.push(latency);
        debug!(
            endpoint = %context.endpoint,
            latency_ms = latency.as_millis() as u64,
            success_rate = state.success_rate(),
            "request_succeeded"
        );
    }

    /// Record a failed request; returns the alert if one was emitted.
    pub fn track_error(&self, error: &OperationError, context: &RequestContext) -> Option<Alert> {
        let kind = self.classifier.classify(error);
        let config = self.config.read().clone();
        let now = self.clock.now();

        let alert = {
            let mut state = self.state.lock();
            state.total_requests += 1;
            state.error_count += 1;
            state.consecutive_errors = state.consecutive_errors.saturating_add(1);
            *state.errors_by_kind.entry(kind).or_insert(0) += 1;
            state.history.push(ErrorRecord { kind, endpoint: context.endpoint.clone(), at: now });

            warn!(
                endpoint = %context.endpoint,
                kind = %kind,
                consecutive_errors = state.consecutive_errors,
                error = %error,
                "request_failed"
            );

            let trigger = Self::detect(&state, &config, kind, &context.endpoint, now)?;
            if state
                .last_alert_at
                .is_some_and(|at| now.saturating_duration_since(at) < config.alert_cooldown)
            {
                state.alerts_suppressed += 1;
                debug!(trigger = ?trigger, "alert_suppressed_by_cooldown");
                return None;
            }

            state.last_alert_at = Some(now);
            state.alerts_sent += 1;
            Alert::new(
                trigger,
                self.clock.utc_now(),
                context.endpoint.clone(),
                context.operation.clone(),
                state.snapshot(now),
            )
        };

        for sink in &self.sinks {
            sink.send(&alert);
        }
        Some(alert)
    }

    /// Record a call the circuit breaker rejected without running it.
    pub fn track_rejection(&self, context: &RequestContext) {
        self.state.lock().rejected_requests += 1;
        debug!(endpoint = %context.endpoint, "request_rejected");
    }

    fn detect(
        state: &MonitorState,
        config: &MonitorConfig,
        kind: ErrorKind,
        endpoint: &EndpointKey,
        now: Instant,
    ) -> Option<AlertTrigger> {
        if kind.is_critical() {
            let count = state.recent(kind, Some(endpoint), now, config.error_time_window);
            if count >= config.error_threshold {
                return Some(AlertTrigger::CriticalBurst { kind, count });
            }
        }
        if state.consecutive_errors >= config.consecutive_error_threshold {
            return Some(AlertTrigger::ConsecutiveErrors { count: state.consecutive_errors });
        }
        let success_rate = state.success_rate();
        if state.total_requests >= config.min_sample_size
            && success_rate < config.success_rate_threshold
        {
            return Some(AlertTrigger::LowSuccessRate { success_rate });
        }
        None
    }

    /// Remediation derived from the current counters.
    pub fn recommended_action(&self) -> RecommendedAction {
        let config = self.config.read().clone();
        let now = self.clock.now();
        let state = self.state.lock();

        let forbidden = state.recent(ErrorKind::Forbidden, None, now, config.error_time_window);
        if forbidden > config.cooldown_forbidden_threshold {
            RecommendedAction::CooldownMode
        } else if state.consecutive_errors > config.rotate_consecutive_threshold {
            RecommendedAction::RotateIdentity
        } else if state.total_requests >= config.min_sample_size
            && state.success_rate() < config.reduce_load_success_rate
        {
            RecommendedAction::ReduceLoad
        } else {
            RecommendedAction::Continue
        }
    }

    /// Kill switch for callers; never enforced by the monitor itself.
    pub fn should_stop(&self) -> bool {
        let config = self.config.read().clone();
        let state = self.state.lock();
        state.consecutive_errors >= config.stop_consecutive_errors
            || (state.total_requests > config.stop_min_samples
                && state.success_rate() < config.stop_success_rate)
    }

    pub fn stats(&self) -> MonitoringSnapshot {
        let now = self.clock.now();
        self.state.lock().snapshot(now)
    }

    pub fn health_report(&self) -> HealthReport {
        HealthReport::new(
            self.stats(),
            self.recommended_action(),
            self.should_stop(),
            self.clock.utc_now(),
        )
    }

    /// Clear every counter, window and the alert cooldown.
    pub fn reset(&self) {
        let config = self.config.read().clone();
        *self.state.lock() = MonitorState::new(&config);
    }

    pub fn config(&self) -> MonitorConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, config: MonitorConfig) -> ConfigResult<()> {
        config.validate()?;
        {
            let mut state = self.state.lock();
            state.latencies.resize(config.latency_window);
            state.history.resize(config.error_history);
        }
        *self.config.write() = config;
        Ok(())
    }
}

//! Facade wiring every resilience component together.
//!
//! The coordinator owns the circuit breaker, rate limiter, health monitor,
//! identity rotation, session cache and fallback orchestrator, and exposes
//! them through a single execution path:
//!
//! 1. Resolve the identity and its credential
//! 2. Run the operation through the circuit breaker and the rate limiter
//! 3. Report the outcome to the health monitor
//!
//! A background maintenance task evicts idle state and applies the
//! monitor's recommended action on a fixed interval.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bulwark_common::error::{DefaultClassifier, ErrorClassifier, ErrorKind, OperationError};
use bulwark_common::time::{SharedClock, SystemClock};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::circuit_breaker::{CircuitBreakerStats, EndpointCircuitBreaker};
use crate::config::ResilienceConfig;
use crate::context::{ExecutionContext, RequestContext};
use crate::endpoint::EndpointKey;
use crate::error::{ResilienceError, ResilienceResult};
use crate::fallback::{FallbackOrchestrator, FallbackOutcome, FallbackStats, Strategy};
use crate::health::{
    AlertSink, HealthMonitor, HealthReport, MonitoringSnapshot, RecommendedAction,
    TracingAlertSink,
};
use crate::identity::{IdentityProfile, IdentityRotationManager, ProfileStats};
use crate::rate_limiter::{AdaptiveRateLimiter, RateLimiterStats};
use crate::session::{CredentialSource, SessionAuthManager, SessionStats};

/// Type alias for task handle to avoid complexity warnings
type TaskHandle = Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>;

/// What one maintenance pass did.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceReport {
    pub circuits_evicted: usize,
    pub sessions_swept: usize,
    pub action: RecommendedAction,
}

/// Aggregate of every component's statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub circuit_breaker: CircuitBreakerStats,
    pub rate_limiter: RateLimiterStats,
    pub monitor: MonitoringSnapshot,
    pub identities: Vec<ProfileStats>,
    pub sessions: SessionStats,
    pub fallback: FallbackStats,
    pub current_identity: String,
    pub cooldown_active: bool,
    pub maintenance_runs: u64,
}

/// Builder for [`Coordinator`].
pub struct CoordinatorBuilder<T> {
    config: ResilienceConfig,
    clock: Option<SharedClock>,
    classifier: Option<Arc<dyn ErrorClassifier>>,
    sinks: Vec<Arc<dyn AlertSink>>,
    credential_source: Option<Arc<dyn CredentialSource>>,
    identity: Option<IdentityProfile>,
    seed: Option<u64>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for CoordinatorBuilder<T> {
    fn default() -> Self {
        Self {
            config: ResilienceConfig::default(),
            clock: None,
            classifier: None,
            sinks: Vec::new(),
            credential_source: None,
            identity: None,
            seed: None,
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> CoordinatorBuilder<T> {
    #[must_use]
    pub fn config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Add an alert sink; alerts go to `tracing` when none is added.
    #[must_use]
    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    #[must_use]
    pub fn credential_source(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.credential_source = Some(source);
        self
    }

    /// Identity used until the first rotation.
    #[must_use]
    pub fn identity(mut self, identity: IdentityProfile) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Seed for identity selection and header randomization.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> ResilienceResult<Coordinator<T>> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let classifier = self.classifier.unwrap_or_else(|| Arc::new(DefaultClassifier));
        let sinks = if self.sinks.is_empty() {
            vec![Arc::new(TracingAlertSink) as Arc<dyn AlertSink>]
        } else {
            self.sinks
        };

        let circuit = Arc::new(EndpointCircuitBreaker::with_parts(
            self.config.circuit_breaker.clone(),
            Arc::clone(&clock),
            Arc::clone(&classifier),
        )?);
        let rate = Arc::new(AdaptiveRateLimiter::with_parts(
            self.config.rate_limit.clone(),
            Arc::clone(&clock),
            Arc::clone(&classifier),
        )?);
        let monitor = Arc::new(HealthMonitor::with_parts(
            self.config.monitor.clone(),
            Arc::clone(&clock),
            Arc::clone(&classifier),
            sinks,
        )?);
        let identities = Arc::new(IdentityRotationManager::with_parts(
            self.config.identity.clone(),
            Arc::clone(&clock),
            self.seed,
        )?);
        let sessions =
            Arc::new(SessionAuthManager::with_clock(self.config.session.clone(), Arc::clone(&clock))?);
        let fallback = Arc::new(FallbackOrchestrator::with_parts(
            Arc::clone(&circuit),
            Arc::clone(&rate),
            Arc::clone(&clock),
            Arc::clone(&classifier),
        ));

        let identity = match self.identity {
            Some(identity) => Arc::new(identity),
            None => identities.next_profile(),
        };

        info!(profiles = identities.profile_count(), "coordinator_built");
        Ok(Coordinator {
            config: self.config,
            circuit,
            rate,
            monitor,
            identities,
            sessions,
            fallback,
            credential_source: self.credential_source,
            classifier,
            clock,
            current_identity: RwLock::new(identity),
            cooldown_active: AtomicBool::new(false),
            tuning: Mutex::new(()),
            maintenance_runs: AtomicU64::new(0),
            maintenance_cancel: Mutex::new(CancellationToken::new()),
            maintenance_task: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }
}

/// Entry point for resilient execution against the remote target.
///
/// `T` is the result type of the registered fallback strategies; direct
/// [`Coordinator::execute`] calls may return any type.
pub struct Coordinator<T> {
    config: ResilienceConfig,
    circuit: Arc<EndpointCircuitBreaker>,
    rate: Arc<AdaptiveRateLimiter>,
    monitor: Arc<HealthMonitor>,
    identities: Arc<IdentityRotationManager>,
    sessions: Arc<SessionAuthManager>,
    fallback: Arc<FallbackOrchestrator<T>>,
    credential_source: Option<Arc<dyn CredentialSource>>,
    classifier: Arc<dyn ErrorClassifier>,
    clock: SharedClock,
    current_identity: RwLock<Arc<IdentityProfile>>,
    cooldown_active: AtomicBool,
    /// Serializes retuning of the rate limiter and circuit breaker
    tuning: Mutex<()>,
    maintenance_runs: AtomicU64,
    maintenance_cancel: Mutex<CancellationToken>,
    maintenance_task: TaskHandle,
}

impl<T> fmt::Debug for Coordinator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("cooldown_active", &self.cooldown_active.load(Ordering::Relaxed))
            .field("maintenance_runs", &self.maintenance_runs.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Coordinator<T> {
    pub fn builder() -> CoordinatorBuilder<T> {
        CoordinatorBuilder::default()
    }

    pub fn circuit_breaker(&self) -> &Arc<EndpointCircuitBreaker> {
        &self.circuit
    }

    pub fn rate_limiter(&self) -> &Arc<AdaptiveRateLimiter> {
        &self.rate
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn identities(&self) -> &Arc<IdentityRotationManager> {
        &self.identities
    }

    pub fn sessions(&self) -> &Arc<SessionAuthManager> {
        &self.sessions
    }

    pub fn fallback(&self) -> &Arc<FallbackOrchestrator<T>> {
        &self.fallback
    }

    /// Baseline configuration the coordinator was built with.
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn current_identity(&self) -> Arc<IdentityProfile> {
        Arc::clone(&*self.current_identity.read())
    }

    //==========================================================================
    // Execution
    //==========================================================================

    /// Run `operation` against `endpoint` with every protection applied.
    ///
    /// The operation receives the identity, credential and headers to use.
    /// Authorization failures invalidate that identity's sessions.
    #[instrument(skip(self, context, operation), fields(endpoint = %endpoint))]
    pub async fn execute<R, F, Fut>(
        &self,
        endpoint: &EndpointKey,
        context: RequestContext,
        operation: F,
    ) -> ResilienceResult<R>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<R, OperationError>>,
    {
        let identity = context.identity.clone().unwrap_or_else(|| self.current_identity());
        let credential = match &self.credential_source {
            Some(source) => self.sessions.acquire(&identity, source.as_ref()).await,
            None => self.sessions.lookup(&identity),
        };
        let execution = ExecutionContext {
            endpoint: endpoint.clone(),
            headers: self.identities.generate_dynamic_headers(&identity, endpoint),
            identity: Arc::clone(&identity),
            credential,
        };

        let started = self.clock.now();
        let result = self
            .circuit
            .execute(endpoint, || self.rate.execute_with_backoff(endpoint, || operation(execution)))
            .await;
        let latency = self.clock.now().saturating_duration_since(started);

        match &result {
            Ok(_) => self.monitor.track_success(&context, latency),
            Err(ResilienceError::Operation(err)) => {
                self.monitor.track_error(err, &context);
                if self.classifier.classify(err).is_authorization_failure() {
                    self.sessions.invalidate(&identity);
                }
            }
            Err(ResilienceError::CircuitOpen { .. }) => self.monitor.track_rejection(&context),
            Err(other) => debug!(error = other.label(), "execute_failed_before_operation"),
        }
        result
    }

    /// Run the registered strategies for `operation`, registering the ones
    /// returned by `register` first if none exist yet.
    pub async fn execute_with_fallback<G, V>(
        &self,
        operation: &str,
        primary: &str,
        alternates: &[&str],
        register: G,
        validator: V,
    ) -> FallbackOutcome<T>
    where
        G: FnOnce() -> Vec<Arc<dyn Strategy<T>>>,
        V: Fn(&T) -> bool + Send + Sync,
    {
        self.execute_with_fallback_cancellable(
            operation,
            primary,
            alternates,
            register,
            validator,
            CancellationToken::new(),
        )
        .await
    }

    pub async fn execute_with_fallback_cancellable<G, V>(
        &self,
        operation: &str,
        primary: &str,
        alternates: &[&str],
        register: G,
        validator: V,
        cancel: CancellationToken,
    ) -> FallbackOutcome<T>
    where
        G: FnOnce() -> Vec<Arc<dyn Strategy<T>>>,
        V: Fn(&T) -> bool + Send + Sync,
    {
        if !self.fallback.has_strategies(operation) {
            for strategy in register() {
                self.fallback.register_strategy(operation, strategy);
            }
        }

        let outcome = self
            .fallback
            .execute_with_fallback_cancellable(operation, primary, alternates, validator, cancel)
            .await;

        let context = RequestContext::new(operation).with_operation(operation).with_query(primary);
        match &outcome.error {
            None => self.monitor.track_success(&context, outcome.total_time),
            Some(ResilienceError::Operation(err)) => {
                self.monitor.track_error(err, &context);
            }
            Some(ResilienceError::CircuitOpen { .. }) => self.monitor.track_rejection(&context),
            Some(_) => {}
        }
        outcome
    }

    /// Apply the standard response to a critical upstream error.
    ///
    /// Returns the classified kind. Only a rejected retune fails.
    pub fn handle_critical_error(
        &self,
        endpoint: &EndpointKey,
        error: &OperationError,
    ) -> ResilienceResult<ErrorKind> {
        let kind = self.classifier.classify(error);
        let critical = &self.config.critical;
        match kind {
            ErrorKind::Forbidden => {
                let blocked = self.current_identity();
                self.rotate_identity();
                self.sessions.invalidate(&blocked);
                self.circuit.force_open(endpoint);
            }
            ErrorKind::RateLimited => {
                let _tuning = self.tuning.lock();
                let mut rate = self.rate.config();
                rate.initial_delay = critical.rate_limited_initial_delay;
                rate.max_requests_per_minute = critical.rate_limited_quota;
                self.rate.update_config(rate)?;
            }
            ErrorKind::ConnectionRefused => {
                let _tuning = self.tuning.lock();
                let mut rate = self.rate.config();
                rate.max_requests_per_minute = critical.connection_refused_quota;
                self.rate.update_config(rate)?;
            }
            _ => return Ok(kind),
        }
        warn!(endpoint = %endpoint, kind = %kind, "critical_error_handled");
        Ok(kind)
    }

    //==========================================================================
    // Tuning
    //==========================================================================

    /// Switch both gates to the slow cooldown profile.
    ///
    /// Returns `false` when cooldown mode was already active.
    pub fn enable_cooldown_mode(&self) -> ResilienceResult<bool> {
        let _tuning = self.tuning.lock();
        if self.cooldown_active.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let (rate, circuit) =
            self.config.cooldown.retune(&self.rate.config(), &self.circuit.config())?;
        self.rate.update_config(rate)?;
        self.circuit.update_config(circuit)?;
        self.cooldown_active.store(true, Ordering::SeqCst);
        warn!("cooldown_mode_enabled");
        Ok(true)
    }

    /// Restore the baseline tuning. Returns `false` when not in cooldown.
    pub fn disable_cooldown_mode(&self) -> ResilienceResult<bool> {
        let _tuning = self.tuning.lock();
        if !self.cooldown_active.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.restore_baseline()?;
        self.cooldown_active.store(false, Ordering::SeqCst);
        info!("cooldown_mode_disabled");
        Ok(true)
    }

    fn restore_baseline(&self) -> ResilienceResult<()> {
        self.rate.update_config(self.config.rate_limit.clone())?;
        self.circuit.update_config(self.config.circuit_breaker.clone())?;
        Ok(())
    }

    pub fn is_cooldown_active(&self) -> bool {
        self.cooldown_active.load(Ordering::SeqCst)
    }

    /// Move to a different identity and return it.
    pub fn rotate_identity(&self) -> Arc<IdentityProfile> {
        let previous = self.current_identity().fingerprint();
        let mut next = self.identities.next_profile();
        for _ in 1..self.identities.profile_count() {
            if next.fingerprint() != previous {
                break;
            }
            next = self.identities.next_profile();
        }
        *self.current_identity.write() = Arc::clone(&next);
        info!(user_agent = %next.user_agent, "identity_rotated");
        next
    }

    //==========================================================================
    // Maintenance
    //==========================================================================

    /// One maintenance pass: evict idle circuits, sweep sessions and act on
    /// the monitor's recommendation.
    pub fn maintenance_tick(&self) -> ResilienceResult<MaintenanceReport> {
        let circuits_evicted = self.circuit.cleanup();
        let sessions_swept = self.sessions.sweep();
        let action = self.monitor.recommended_action();

        match action {
            RecommendedAction::CooldownMode => {
                self.enable_cooldown_mode()?;
            }
            RecommendedAction::ReduceLoad => {
                let _tuning = self.tuning.lock();
                if self.cooldown_active.load(Ordering::SeqCst) {
                    debug!("reduce_load_skipped_in_cooldown");
                } else {
                    let mut rate = self.rate.config();
                    rate.max_requests_per_minute = self.config.maintenance.reduce_load_quota;
                    self.rate.update_config(rate)?;
                }
            }
            RecommendedAction::RotateIdentity => {
                self.rotate_identity();
            }
            RecommendedAction::Continue => {}
        }

        self.maintenance_runs.fetch_add(1, Ordering::Relaxed);
        debug!(circuits_evicted, sessions_swept, action = %action, "maintenance_tick");
        Ok(MaintenanceReport { circuits_evicted, sessions_swept, action })
    }

    /// Spawn the periodic maintenance task.
    ///
    /// Returns `false` when maintenance is disabled or already running. The
    /// task holds only a weak reference, so dropping the coordinator ends it.
    #[instrument(skip(self))]
    pub async fn start_maintenance(self: &Arc<Self>) -> bool {
        if !self.config.maintenance.enabled {
            return false;
        }
        let mut task = self.maintenance_task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        *self.maintenance_cancel.lock() = cancel.clone();
        let interval = self.config.maintenance.interval;
        let coordinator = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("maintenance_loop_cancelled");
                        break;
                    }
                    () = tokio::time::sleep(interval) => {
                        let Some(coordinator) = coordinator.upgrade() else {
                            break;
                        };
                        if let Err(e) = coordinator.maintenance_tick() {
                            warn!(error = %e, "maintenance_tick_failed");
                        }
                    }
                }
            }
        });

        *task = Some(handle);
        info!(interval_ms = interval.as_millis() as u64, "maintenance_started");
        true
    }

    /// Cancel the maintenance task and wait for it to finish.
    ///
    /// Returns `false` when nothing was running or the task did not stop
    /// within the configured shutdown timeout.
    #[instrument(skip(self))]
    pub async fn stop_maintenance(&self) -> bool {
        self.maintenance_cancel.lock().cancel();
        let Some(handle) = self.maintenance_task.lock().await.take() else {
            return false;
        };

        let timeout = self.config.maintenance.shutdown_timeout;
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => {
                info!("maintenance_stopped");
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, "maintenance_task_panicked");
                false
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "maintenance_stop_timed_out");
                false
            }
        }
    }

    pub async fn is_maintenance_running(&self) -> bool {
        let guard = self.maintenance_task.lock().await;
        guard.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    //==========================================================================
    // Introspection
    //==========================================================================

    pub fn detailed_stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            circuit_breaker: self.circuit.stats(),
            rate_limiter: self.rate.global_stats(),
            monitor: self.monitor.stats(),
            identities: self.identities.profile_stats(),
            sessions: self.sessions.stats(),
            fallback: self.fallback.stats(),
            current_identity: self.current_identity().fingerprint(),
            cooldown_active: self.is_cooldown_active(),
            maintenance_runs: self.maintenance_runs.load(Ordering::Relaxed),
        }
    }

    pub fn health_report(&self) -> HealthReport {
        self.monitor.health_report()
    }

    /// Clear all runtime state and restore the baseline tuning.
    pub fn reset_all(&self) -> ResilienceResult<()> {
        {
            let _tuning = self.tuning.lock();
            self.restore_baseline()?;
            self.cooldown_active.store(false, Ordering::SeqCst);
        }
        self.circuit.reset_all();
        self.rate.reset_all();
        self.monitor.reset();
        self.identities.reset_all();
        self.sessions.reset_all();
        info!("coordinator_reset");
        Ok(())
    }
}

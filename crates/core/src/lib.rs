//! # Bulwark Core
//!
//! Resilient execution against an unreliable, rate-limited remote target.
//!
//! This crate contains:
//! - [`EndpointCircuitBreaker`]: per-endpoint circuit breaking
//! - [`AdaptiveRateLimiter`]: global quota plus adaptive per-endpoint spacing
//! - [`FallbackOrchestrator`]: priority-ordered strategy traversal
//! - [`HealthMonitor`]: rolling telemetry, alerts and recommendations
//! - [`IdentityRotationManager`] and [`SessionAuthManager`]: client identity
//!   and credential lifecycle
//! - [`Coordinator`]: the facade that wires them together
//!
//! ## Architecture Principles
//! - All state is in-memory and shared through `Arc`
//! - Time flows through an injected [`bulwark_common::Clock`]
//! - Upstream errors are classified by an injected
//!   [`bulwark_common::ErrorClassifier`]

pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod endpoint;
pub mod error;
pub mod fallback;
pub mod health;
pub mod identity;
pub mod rate_limiter;
pub mod session;

pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerStats, CircuitState, EndpointCircuitBreaker,
    EndpointCircuitSnapshot,
};
pub use config::{CooldownConfig, CriticalResponseConfig, MaintenanceConfig, ResilienceConfig};
pub use context::{ExecutionContext, RequestContext};
pub use coordinator::{Coordinator, CoordinatorBuilder, CoordinatorStats, MaintenanceReport};
pub use endpoint::EndpointKey;
pub use error::{ResilienceError, ResilienceResult};
pub use fallback::{
    default_strategy_profile, FallbackOrchestrator, FallbackOutcome, ProfiledStrategy, Strategy,
    StrategyTier,
};
pub use health::{
    Alert, AlertSink, HealthMonitor, HealthReport, HealthStatus, MemoryAlertSink, MonitorConfig,
    MonitoringSnapshot, RecommendedAction, TracingAlertSink,
};
pub use identity::{IdentityConfig, IdentityProfile, IdentityRotationManager, Viewport};
pub use rate_limiter::{AdaptiveRateLimiter, RateLimitConfig, RateLimiterStats};
pub use session::{Credential, CredentialSource, SessionAuthManager, SessionConfig};

//! Error type returned by the resilience components.

use std::time::Duration;

use bulwark_common::error::{
    ConfigError, ErrorClassification, ErrorKind, ErrorSeverity, OperationError,
};
use thiserror::Error;

use crate::endpoint::EndpointKey;

/// Result alias for resilience operations.
pub type ResilienceResult<T> = Result<T, ResilienceError>;

/// Failures surfaced by the rate limiter, circuit breaker, fallback
/// orchestrator and coordinator.
///
/// Upstream errors travel unchanged inside [`ResilienceError::Operation`];
/// every other variant is produced by this crate and never counted as an
/// upstream failure.
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// The endpoint's circuit rejected the call without invoking it.
    #[error("circuit open for endpoint '{endpoint}'")]
    CircuitOpen { endpoint: EndpointKey, retry_after: Option<Duration> },

    /// The wrapped operation failed.
    #[error(transparent)]
    Operation(#[from] OperationError),

    /// The global quota stayed saturated for every permitted wait round.
    #[error("global request quota exhausted for '{endpoint}' after {waits} waits")]
    QuotaExhausted { endpoint: EndpointKey, waits: u32 },

    /// No strategy is registered for the logical operation.
    #[error("no strategies registered for operation '{operation}'")]
    NoStrategies { operation: String },

    /// Every attempt was skipped or produced an invalid result.
    #[error("all {attempts} fallback attempts for '{operation}' were exhausted")]
    FallbackExhausted { operation: String, attempts: u32 },

    /// The caller cancelled the request.
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ResilienceError {
    /// Upstream error, if this wraps one.
    pub fn operation_error(&self) -> Option<&OperationError> {
        match self {
            Self::Operation(err) => Some(err),
            _ => None,
        }
    }

    /// `true` for the circuit-open rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Stable label for logs and stats.
    pub fn label(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Operation(_) => "operation",
            Self::QuotaExhausted { .. } => "quota_exhausted",
            Self::NoStrategies { .. } => "no_strategies",
            Self::FallbackExhausted { .. } => "fallback_exhausted",
            Self::Cancelled => "cancelled",
            Self::Config(_) => "config",
        }
    }

    /// Classify the error with the supplied function; crate-level variants
    /// are `Unclassified`.
    pub fn kind_with(&self, classify: impl FnOnce(&OperationError) -> ErrorKind) -> ErrorKind {
        self.operation_error().map_or(ErrorKind::Unclassified, classify)
    }
}

impl ErrorClassification for ResilienceError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::QuotaExhausted { .. } | Self::Operation(_))
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::CircuitOpen { .. } | Self::QuotaExhausted { .. } => ErrorSeverity::Warning,
            Self::Operation(_) | Self::FallbackExhausted { .. } => ErrorSeverity::Error,
            Self::NoStrategies { .. } | Self::Config(_) => ErrorSeverity::Error,
            Self::Cancelled => ErrorSeverity::Info,
        }
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_error_is_transparent() {
        let err = ResilienceError::from(OperationError::status(429, "slow down"));
        assert_eq!(err.to_string(), "slow down");
        assert_eq!(err.operation_error().and_then(OperationError::status_code), Some(429));
        assert!(!err.is_circuit_open());
    }

    #[test]
    fn test_circuit_open_classification() {
        let err = ResilienceError::CircuitOpen {
            endpoint: EndpointKey::new("search"),
            retry_after: Some(Duration::from_secs(30)),
        };

        assert!(err.is_circuit_open());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(err.severity(), ErrorSeverity::Warning);
        assert_eq!(err.kind_with(|_| ErrorKind::Forbidden), ErrorKind::Unclassified);
        assert_eq!(err.label(), "circuit_open");
    }
}

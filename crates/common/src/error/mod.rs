//! Error taxonomy shared by every Bulwark crate
//!
//! Upstream failures reach the resilience layer as [`OperationError`], a
//! small classifiable shape carrying an optional HTTP-like status code and an
//! optional transport error code. An injectable [`ErrorClassifier`] maps that
//! shape onto the tagged [`ErrorKind`] taxonomy; nothing downstream inspects
//! raw fields directly.
//!
//! ## Usage
//!
//! ```rust
//! use bulwark_common::error::{DefaultClassifier, ErrorClassifier, ErrorKind, OperationError};
//!
//! let err = OperationError::status(403, "blocked by upstream");
//! assert_eq!(DefaultClassifier.classify(&err), ErrorKind::Forbidden);
//! assert!(ErrorKind::Forbidden.is_critical());
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed error used as the optional cause of an [`OperationError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias for configuration handling.
pub type ConfigResult<T> = Result<T, ConfigError>;

//==============================================================================
// Error kinds
//==============================================================================

/// Tagged classification of an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The operation did not complete in time.
    Timeout,
    /// The remote refused or reset the connection.
    ConnectionRefused,
    /// Name resolution failed.
    DnsFailure,
    /// HTTP 429 equivalent.
    RateLimited,
    /// HTTP 403 equivalent; the client was blocked.
    Forbidden,
    /// HTTP 401 equivalent; credentials were rejected.
    Unauthorized,
    /// Anything the classifier could not place.
    Unclassified,
}

impl ErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Timeout,
        Self::ConnectionRefused,
        Self::DnsFailure,
        Self::RateLimited,
        Self::Forbidden,
        Self::Unauthorized,
        Self::Unclassified,
    ];

    /// Critical kinds open a circuit immediately regardless of failure count.
    #[must_use]
    pub const fn is_critical(self) -> bool {
        matches!(
            self,
            Self::Forbidden
                | Self::RateLimited
                | Self::ConnectionRefused
                | Self::DnsFailure
                | Self::Timeout
        )
    }

    /// Transient failures that may succeed on a later attempt.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::ConnectionRefused | Self::DnsFailure)
    }

    /// Failures that mean the current credential or identity was rejected.
    #[must_use]
    pub const fn is_authorization_failure(self) -> bool {
        matches!(self, Self::Forbidden | Self::Unauthorized)
    }

    /// Stable label for logs and stats.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ConnectionRefused => "connection_refused",
            Self::DnsFailure => "dns_failure",
            Self::RateLimited => "rate_limited",
            Self::Forbidden => "forbidden",
            Self::Unauthorized => "unauthorized",
            Self::Unclassified => "unclassified",
        }
    }

    /// Default severity used when the kind surfaces in alerts or logs.
    #[must_use]
    pub const fn severity(self) -> ErrorSeverity {
        match self {
            Self::Forbidden => ErrorSeverity::Critical,
            Self::RateLimited | Self::Unauthorized => ErrorSeverity::Error,
            Self::Timeout | Self::ConnectionRefused | Self::DnsFailure => ErrorSeverity::Warning,
            Self::Unclassified => ErrorSeverity::Info,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

//==============================================================================
// Operation error
//==============================================================================

/// Failure reported by an upstream operation.
///
/// Collaborators construct this from whatever their transport produces; the
/// resilience layer only looks at `status_code` and `error_code` (through a
/// classifier) and otherwise passes the value back unchanged.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct OperationError {
    message: String,
    status_code: Option<u16>,
    error_code: Option<String>,
    #[source]
    source: Option<BoxError>,
}

impl OperationError {
    /// Error without any classifiable shape.
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self { message: message.into(), status_code: None, error_code: None, source: None }
    }

    /// Error carrying an HTTP-like status code.
    pub fn status<S: Into<String>>(status_code: u16, message: S) -> Self {
        Self { status_code: Some(status_code), ..Self::new(message) }
    }

    /// Error carrying a transport error code such as `ECONNREFUSED`.
    pub fn code<C: Into<String>, S: Into<String>>(error_code: C, message: S) -> Self {
        Self { error_code: Some(error_code.into()), ..Self::new(message) }
    }

    /// Timeout after `after`, tagged with the `TIMEOUT` error code.
    pub fn timeout(after: Duration) -> Self {
        Self::code("TIMEOUT", format!("operation timed out after {}ms", after.as_millis()))
    }

    /// Attach the underlying cause.
    #[must_use]
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Attach a status code to an existing error.
    #[must_use]
    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// Human readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// HTTP-like status code, if the transport reported one.
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    /// Transport error code, if any.
    pub fn error_code(&self) -> Option<&str> {
        self.error_code.as_deref()
    }
}

//==============================================================================
// Classification
//==============================================================================

/// Maps an [`OperationError`] onto an [`ErrorKind`].
///
/// Implemented for any `Fn(&OperationError) -> ErrorKind`, so tests and
/// collaborators can pass a closure.
pub trait ErrorClassifier: Send + Sync {
    /// Classify a single error.
    fn classify(&self, error: &OperationError) -> ErrorKind;
}

impl<F> ErrorClassifier for F
where
    F: Fn(&OperationError) -> ErrorKind + Send + Sync,
{
    fn classify(&self, error: &OperationError) -> ErrorKind {
        self(error)
    }
}

/// Status/code based classifier used unless one is injected.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, error: &OperationError) -> ErrorKind {
        match error.status_code() {
            Some(403) => return ErrorKind::Forbidden,
            Some(401) => return ErrorKind::Unauthorized,
            Some(429) => return ErrorKind::RateLimited,
            Some(408 | 504) => return ErrorKind::Timeout,
            _ => {}
        }

        match error.error_code() {
            Some("ECONNREFUSED" | "ECONNRESET") => ErrorKind::ConnectionRefused,
            Some("ENOTFOUND" | "EAI_AGAIN") => ErrorKind::DnsFailure,
            Some("TIMEOUT" | "ETIMEDOUT") => ErrorKind::Timeout,
            _ => ErrorKind::Unclassified,
        }
    }
}

//==============================================================================
// Classification of crate-level errors
//==============================================================================

/// Error classification trait for consistent handling across modules
///
/// Drives log levels, alert severity and the decision whether a caller
/// should try again.
pub trait ErrorClassification {
    /// Check if this error is retryable
    fn is_retryable(&self) -> bool;

    /// Get the error severity level
    fn severity(&self) -> ErrorSeverity;

    /// Check if this is a critical error requiring immediate attention
    fn is_critical(&self) -> bool;

    /// Get the suggested retry delay if applicable
    ///
    /// Returns `Some(Duration)` when a specific delay is known (for example
    /// the remaining recovery time of an open circuit).
    fn retry_after(&self) -> Option<Duration>;
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Informational, typically for debugging
    Info,
    /// Warning, should be monitored but not critical
    Warning,
    /// Error, requires attention and action
    Error,
    /// Critical, immediate action required
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

//==============================================================================
// Configuration errors
//==============================================================================

/// Errors raised while building, loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field holds a value outside its allowed range.
    #[error("invalid configuration for '{field}': {message}")]
    Invalid { field: &'static str, message: String },

    /// The configuration file could not be read.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing failed.
    #[error("failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON parsing failed.
    #[error("failed to parse JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// An environment override could not be parsed.
    #[error("invalid value '{value}' for environment variable {name}")]
    Env { name: String, value: String },
}

impl ConfigError {
    /// Shorthand for [`ConfigError::Invalid`].
    pub fn invalid<S: Into<String>>(field: &'static str, message: S) -> Self {
        Self::Invalid { field, message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for error classification.

    use super::*;

    /// Validates the default status/code mapping.
    ///
    /// Assertions:
    /// - Confirms 403/401/429 map to their dedicated kinds
    /// - Confirms transport codes map to transient kinds
    /// - Confirms unknown shapes stay unclassified
    #[test]
    fn test_default_classifier_mapping() {
        let classifier = DefaultClassifier;

        assert_eq!(classifier.classify(&OperationError::status(403, "x")), ErrorKind::Forbidden);
        assert_eq!(classifier.classify(&OperationError::status(401, "x")), ErrorKind::Unauthorized);
        assert_eq!(classifier.classify(&OperationError::status(429, "x")), ErrorKind::RateLimited);
        assert_eq!(classifier.classify(&OperationError::status(504, "x")), ErrorKind::Timeout);
        assert_eq!(
            classifier.classify(&OperationError::code("ECONNREFUSED", "x")),
            ErrorKind::ConnectionRefused
        );
        assert_eq!(
            classifier.classify(&OperationError::code("ENOTFOUND", "x")),
            ErrorKind::DnsFailure
        );
        assert_eq!(
            classifier.classify(&OperationError::timeout(Duration::from_secs(1))),
            ErrorKind::Timeout
        );
        assert_eq!(classifier.classify(&OperationError::status(500, "x")), ErrorKind::Unclassified);
        assert_eq!(classifier.classify(&OperationError::new("x")), ErrorKind::Unclassified);
    }

    /// Status code wins over error code when both are present.
    #[test]
    fn test_status_takes_precedence_over_code() {
        let err = OperationError::code("ECONNREFUSED", "x").with_status(429);
        assert_eq!(DefaultClassifier.classify(&err), ErrorKind::RateLimited);
    }

    #[test]
    fn test_closure_classifier() {
        let classifier = |_: &OperationError| ErrorKind::Forbidden;
        assert_eq!(classifier.classify(&OperationError::new("anything")), ErrorKind::Forbidden);
    }

    #[test]
    fn test_kind_predicates() {
        for kind in ErrorKind::ALL {
            if kind.is_retryable() {
                assert!(kind.is_critical(), "{kind} retryable kinds are critical too");
            }
        }
        assert!(!ErrorKind::Unclassified.is_critical());
        assert!(!ErrorKind::Unauthorized.is_critical());
        assert!(ErrorKind::Unauthorized.is_authorization_failure());
        assert!(ErrorKind::Forbidden.is_authorization_failure());
        assert!(!ErrorKind::RateLimited.is_authorization_failure());
    }

    #[test]
    fn test_operation_error_source_chain() {
        let io = std::io::Error::other("socket closed");
        let err = OperationError::code("ECONNRESET", "fetch failed").with_source(io);

        assert_eq!(err.to_string(), "fetch failed");
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("socket closed"));
    }

    #[test]
    fn test_severity_display() {
        assert_eq!(ErrorSeverity::Warning.to_string(), "WARN");
        assert_eq!(ErrorSeverity::Critical.to_string(), "CRITICAL");
        assert!(ErrorSeverity::Critical > ErrorSeverity::Error);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("failure_threshold", "must be greater than 0");
        assert_eq!(
            err.to_string(),
            "invalid configuration for 'failure_threshold': must be greater than 0"
        );
    }
}

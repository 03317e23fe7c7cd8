//! Common utilities shared across Bulwark crates.
//!
//! # Feature Tiers
//!
//! Enable cargo features to opt into the tiers you need:
//! - `foundation`: error taxonomy, collections, serde helpers
//! - `runtime`: async clock abstraction and tracing subscriber setup

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

// Foundation tier
// -----------------------------------------------------------------
#[cfg(feature = "foundation")]
pub mod collections;
#[cfg(feature = "foundation")]
pub mod error;
#[cfg(feature = "foundation")]
pub mod utils;

// Runtime tier
// --------------------------------------------------------------------
#[cfg(feature = "runtime")]
pub mod observability;
#[cfg(feature = "runtime")]
pub mod time;

#[cfg(feature = "foundation")]
pub use error::{
    ConfigError, ConfigResult, DefaultClassifier, ErrorClassification, ErrorClassifier,
    ErrorKind, ErrorSeverity, OperationError,
};
#[cfg(feature = "runtime")]
pub use time::{Clock, MockClock, SharedClock, SystemClock};
#[cfg(feature = "foundation")]
pub use utils::{duration_millis, option_duration_millis};

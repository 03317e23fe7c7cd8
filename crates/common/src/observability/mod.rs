//! Tracing subscriber setup
//!
//! Library code only emits `tracing` events; binaries and test harnesses call
//! [`init_tracing`] once to install a subscriber. The filter honours
//! `RUST_LOG` and falls back to `info`.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Output format for the fmt layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable single-line output
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" | "plain" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Default directive when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber.
///
/// Returns `Ok(true)` when this call installed it and `Ok(false)` when a
/// global subscriber was already set (tests call this repeatedly).
///
/// # Errors
///
/// Returns an error string when the `RUST_LOG` directive cannot be parsed.
pub fn init_tracing(format: LogFormat) -> Result<bool, String> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directive) => EnvFilter::try_new(directive).map_err(|err| err.to_string())?,
        Err(_) => EnvFilter::new(DEFAULT_FILTER),
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_current_span(true)).try_init(),
    };

    Ok(installed.is_ok())
}

//! Root configuration and its loader.
//!
//! ## Loading Strategy
//! 1. Start from defaults, or from a TOML/JSON file when a path is given
//! 2. Apply `BULWARK_*` environment overrides
//! 3. Validate every section
//!
//! ## Environment Variables
//! - `BULWARK_CIRCUIT_FAILURE_THRESHOLD`: failures before a circuit opens
//! - `BULWARK_CIRCUIT_RECOVERY_TIMEOUT_MS`: open-circuit recovery timeout
//! - `BULWARK_CIRCUIT_SUCCESS_THRESHOLD`: half-open successes needed to close
//! - `BULWARK_RATE_INITIAL_DELAY_MS`: base per-endpoint spacing
//! - `BULWARK_RATE_MAX_DELAY_MS`: spacing ceiling
//! - `BULWARK_RATE_MAX_REQUESTS_PER_MINUTE`: global quota
//! - `BULWARK_MONITOR_ALERT_COOLDOWN_MS`: minimum gap between alerts
//! - `BULWARK_IDENTITY_MAX_USAGE`: selections before a profile cools down
//! - `BULWARK_IDENTITY_COOLDOWN_MS`: profile cooldown
//! - `BULWARK_SESSION_MAX_AGE_MS`: session lifetime
//! - `BULWARK_MAINTENANCE_INTERVAL_MS`: maintenance tick interval
//! - `BULWARK_MAINTENANCE_ENABLED`: whether `start_maintenance` spawns the task (true/false)

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use bulwark_common::duration_millis;
use bulwark_common::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::health::MonitorConfig;
use crate::identity::IdentityConfig;
use crate::rate_limiter::RateLimitConfig;
use crate::session::SessionConfig;

/// Tuning applied while cooldown mode is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub max_requests_per_minute: u32,
    pub failure_threshold: u32,
    #[serde(with = "duration_millis")]
    pub recovery_timeout: Duration,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            max_requests_per_minute: 5,
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(600),
        }
    }
}

impl CooldownConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::invalid("cooldown.initial_delay", "must not exceed max_delay"));
        }
        if self.max_requests_per_minute == 0 || self.failure_threshold == 0 {
            return Err(ConfigError::invalid("cooldown", "quota and failure threshold must be > 0"));
        }
        if self.recovery_timeout.is_zero() {
            return Err(ConfigError::invalid("cooldown.recovery_timeout", "must be greater than 0"));
        }
        Ok(())
    }

    /// Both retuned configs, validated together so neither is applied alone.
    pub fn retune(
        &self,
        rate: &RateLimitConfig,
        circuit: &CircuitBreakerConfig,
    ) -> ConfigResult<(RateLimitConfig, CircuitBreakerConfig)> {
        let rate = self.rate_limit(rate);
        let circuit = self.circuit_breaker(circuit);
        rate.validate()?;
        circuit.validate()?;
        Ok((rate, circuit))
    }

    /// `base` retuned to the cooldown profile.
    pub fn rate_limit(&self, base: &RateLimitConfig) -> RateLimitConfig {
        RateLimitConfig {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            max_requests_per_minute: self.max_requests_per_minute,
            ..base.clone()
        }
    }

    pub fn circuit_breaker(&self, base: &CircuitBreakerConfig) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: self.recovery_timeout,
            ..base.clone()
        }
    }
}

/// Adjustments made by `handle_critical_error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CriticalResponseConfig {
    #[serde(with = "duration_millis")]
    pub rate_limited_initial_delay: Duration,
    pub rate_limited_quota: u32,
    pub connection_refused_quota: u32,
}

impl Default for CriticalResponseConfig {
    fn default() -> Self {
        Self {
            rate_limited_initial_delay: Duration::from_secs(5),
            rate_limited_quota: 10,
            connection_refused_quota: 5,
        }
    }
}

impl CriticalResponseConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.rate_limited_quota == 0 || self.connection_refused_quota == 0 {
            return Err(ConfigError::invalid("critical", "quotas must be greater than 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// When false, `Coordinator::start_maintenance` does not spawn the task
    pub enabled: bool,
    #[serde(with = "duration_millis")]
    pub interval: Duration,
    /// Global quota applied when the monitor recommends reducing load
    pub reduce_load_quota: u32,
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5 * 60),
            reduce_load_quota: 10,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl MaintenanceConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.interval.is_zero() {
            return Err(ConfigError::invalid("maintenance.interval", "must be greater than 0"));
        }
        if self.reduce_load_quota == 0 {
            return Err(ConfigError::invalid("maintenance.reduce_load_quota", "must be > 0"));
        }
        Ok(())
    }
}

/// Configuration for every component owned by the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub monitor: MonitorConfig,
    pub identity: IdentityConfig,
    pub session: SessionConfig,
    pub cooldown: CooldownConfig,
    pub critical: CriticalResponseConfig,
    pub maintenance: MaintenanceConfig,
}

impl ResilienceConfig {
    pub fn from_toml_str(contents: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Parse a TOML or JSON file, chosen by extension (JSON when absent).
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        tracing::info!(path = %path.display(), "loading_configuration");
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()).unwrap_or("json") {
            "toml" => Self::from_toml_str(&contents),
            "json" => Ok(serde_json::from_str(&contents)?),
            other => Err(ConfigError::invalid(
                "path",
                format!("unsupported configuration format: {other}"),
            )),
        }
    }

    /// File (if any), then environment, then validation.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_env_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides read through `lookup` instead of the process environment.
    pub fn apply_env_overrides_from<L>(&mut self, lookup: L) -> ConfigResult<()>
    where
        L: Fn(&str) -> Option<String>,
    {
        let env = Overrides { lookup };
        env.parse("BULWARK_CIRCUIT_FAILURE_THRESHOLD", &mut self.circuit_breaker.failure_threshold)?;
        env.millis(
            "BULWARK_CIRCUIT_RECOVERY_TIMEOUT_MS",
            &mut self.circuit_breaker.recovery_timeout,
        )?;
        env.parse("BULWARK_CIRCUIT_SUCCESS_THRESHOLD", &mut self.circuit_breaker.success_threshold)?;
        env.millis("BULWARK_RATE_INITIAL_DELAY_MS", &mut self.rate_limit.initial_delay)?;
        env.millis("BULWARK_RATE_MAX_DELAY_MS", &mut self.rate_limit.max_delay)?;
        env.parse(
            "BULWARK_RATE_MAX_REQUESTS_PER_MINUTE",
            &mut self.rate_limit.max_requests_per_minute,
        )?;
        env.millis("BULWARK_MONITOR_ALERT_COOLDOWN_MS", &mut self.monitor.alert_cooldown)?;
        env.parse("BULWARK_IDENTITY_MAX_USAGE", &mut self.identity.max_usage_per_profile)?;
        env.millis("BULWARK_IDENTITY_COOLDOWN_MS", &mut self.identity.cooldown_period)?;
        env.millis("BULWARK_SESSION_MAX_AGE_MS", &mut self.session.max_session_age)?;
        env.millis("BULWARK_MAINTENANCE_INTERVAL_MS", &mut self.maintenance.interval)?;
        env.flag("BULWARK_MAINTENANCE_ENABLED", &mut self.maintenance.enabled)?;
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.circuit_breaker.validate()?;
        self.rate_limit.validate()?;
        self.monitor.validate()?;
        self.identity.validate()?;
        self.session.validate()?;
        self.cooldown.validate()?;
        self.cooldown.retune(&self.rate_limit, &self.circuit_breaker)?;
        self.critical.validate()?;
        self.maintenance.validate()
    }
}

struct Overrides<L> {
    lookup: L,
}

impl<L: Fn(&str) -> Option<String>> Overrides<L> {
    fn parse<T: FromStr>(&self, name: &str, target: &mut T) -> ConfigResult<()> {
        if let Some(value) = (self.lookup)(name) {
            *target = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Env { name: name.to_string(), value })?;
        }
        Ok(())
    }

    fn millis(&self, name: &str, target: &mut Duration) -> ConfigResult<()> {
        let mut millis = u64::try_from(target.as_millis()).unwrap_or(u64::MAX);
        self.parse(name, &mut millis)?;
        *target = Duration::from_millis(millis);
        Ok(())
    }

    /// Accepts `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off` (case-insensitive)
    fn flag(&self, name: &str, target: &mut bool) -> ConfigResult<()> {
        if let Some(value) = (self.lookup)(name) {
            *target = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(ConfigError::Env { name: name.to_string(), value }),
            };
        }
        Ok(())
    }
}

//! Usage-capped rotation over a pool of identity profiles.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bulwark_common::duration_millis;
use bulwark_common::error::{ConfigError, ConfigResult};
use bulwark_common::time::{SharedClock, SystemClock};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::profiles::{default_profiles, IdentityProfile};
use crate::endpoint::EndpointKey;

const REFERER_PROBABILITY: f64 = 0.7;

fn default_referrers() -> Vec<String> {
    [
        "https://www.google.com/",
        "https://www.bing.com/",
        "https://duckduckgo.com/",
        "https://search.yahoo.com/",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub max_usage_per_profile: u32,
    #[serde(with = "duration_millis")]
    pub cooldown_period: Duration,
    /// Custom pool; the built-in desktop profiles are used when empty
    pub profiles: Vec<IdentityProfile>,
    pub referrers: Vec<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            max_usage_per_profile: 10,
            cooldown_period: Duration::from_secs(300),
            profiles: Vec::new(),
            referrers: default_referrers(),
        }
    }
}

impl IdentityConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_usage_per_profile == 0 {
            return Err(ConfigError::invalid("max_usage_per_profile", "must be greater than 0"));
        }
        Ok(())
    }

    fn resolved_profiles(&self) -> Vec<Arc<IdentityProfile>> {
        let profiles =
            if self.profiles.is_empty() { default_profiles() } else { self.profiles.clone() };
        profiles.into_iter().map(Arc::new).collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Usage {
    count: u32,
    last_used: Option<Instant>,
}

impl Usage {
    fn cooled_down(&self, now: Instant, cooldown: Duration) -> bool {
        self.last_used.map_or(true, |at| now.saturating_duration_since(at) >= cooldown)
    }

    fn available(&self, now: Instant, config: &IdentityConfig) -> bool {
        self.count < config.max_usage_per_profile || self.cooled_down(now, config.cooldown_period)
    }
}

struct Pool {
    profiles: Vec<Arc<IdentityProfile>>,
    usage: Vec<Usage>,
    cursor: usize,
}

impl Pool {
    fn new(profiles: Vec<Arc<IdentityProfile>>) -> Self {
        let usage = vec![Usage::default(); profiles.len()];
        Self { profiles, usage, cursor: 0 }
    }

    fn reset(&mut self) {
        self.usage.iter_mut().for_each(|usage| *usage = Usage::default());
    }

    fn take(&mut self, index: usize, now: Instant, config: &IdentityConfig) -> Arc<IdentityProfile> {
        let usage = &mut self.usage[index];
        if usage.count >= config.max_usage_per_profile {
            usage.count = 0;
        }
        usage.count += 1;
        usage.last_used = Some(now);
        debug!(profile = index, usage = usage.count, "identity_selected");
        Arc::clone(&self.profiles[index])
    }
}

/// Per-profile usage snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileStats {
    pub index: usize,
    pub fingerprint: String,
    pub user_agent: String,
    pub usage_count: u32,
    pub available: bool,
    #[serde(with = "bulwark_common::option_duration_millis")]
    pub since_last_used: Option<Duration>,
}

/// Hands out identities so no single profile is overused.
///
/// A profile becomes unavailable after `max_usage_per_profile` selections
/// and returns once `cooldown_period` has passed since its last use. When
/// the whole pool is exhausted every counter is reset and selection goes on.
pub struct IdentityRotationManager {
    config: RwLock<IdentityConfig>,
    pool: Mutex<Pool>,
    rng: Mutex<StdRng>,
    clock: SharedClock,
}

impl fmt::Debug for IdentityRotationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityRotationManager")
            .field("profiles", &self.profile_count())
            .field("config", &self.config.read().max_usage_per_profile)
            .finish_non_exhaustive()
    }
}

impl IdentityRotationManager {
    pub fn new(config: IdentityConfig) -> ConfigResult<Self> {
        Self::with_parts(config, Arc::new(SystemClock), None)
    }

    /// Deterministic manager for tests and reproducible runs.
    pub fn with_seed(config: IdentityConfig, seed: u64) -> ConfigResult<Self> {
        Self::with_parts(config, Arc::new(SystemClock), Some(seed))
    }

    pub fn with_parts(
        config: IdentityConfig,
        clock: SharedClock,
        seed: Option<u64>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let rng = seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        Ok(Self {
            pool: Mutex::new(Pool::new(config.resolved_profiles())),
            config: RwLock::new(config),
            rng: Mutex::new(rng),
            clock,
        })
    }

    /// Uniformly random pick among available profiles.
    pub fn random_profile(&self) -> Arc<IdentityProfile> {
        let config = self.config.read().clone();
        let now = self.clock.now();
        let mut pool = self.pool.lock();

        let mut candidates: Vec<usize> = (0..pool.profiles.len())
            .filter(|&index| pool.usage[index].available(now, &config))
            .collect();
        if candidates.is_empty() {
            warn!(profiles = pool.profiles.len(), "identity_pool_exhausted_resetting");
            pool.reset();
            candidates = (0..pool.profiles.len()).collect();
        }

        let index = candidates.choose(&mut *self.rng.lock()).copied().unwrap_or(0);
        pool.take(index, now, &config)
    }

    /// Round-robin pick, skipping unavailable profiles.
    pub fn next_profile(&self) -> Arc<IdentityProfile> {
        let config = self.config.read().clone();
        let now = self.clock.now();
        let mut pool = self.pool.lock();
        let len = pool.profiles.len();

        let found = (0..len)
            .map(|offset| (pool.cursor + offset) % len)
            .find(|&index| pool.usage[index].available(now, &config));
        let index = match found {
            Some(index) => index,
            None => {
                warn!(profiles = len, "identity_pool_exhausted_resetting");
                pool.reset();
                pool.cursor % len
            }
        };

        pool.cursor = (index + 1) % len;
        pool.take(index, now, &config)
    }

    /// Request headers for `profile`, randomized per call.
    pub fn generate_dynamic_headers(
        &self,
        profile: &IdentityProfile,
        endpoint: &EndpointKey,
    ) -> Vec<(String, String)> {
        let referrers = self.config.read().referrers.clone();
        let mut rng = self.rng.lock();

        let mut headers: Vec<(String, String)> =
            profile.headers.iter().map(|(name, value)| (name.clone(), value.clone())).collect();
        headers.push(("User-Agent".to_string(), profile.user_agent.clone()));
        headers.push(("Accept-Language".to_string(), profile.accept_language.clone()));

        if rng.gen_bool(0.5) {
            headers.push(("X-Requested-With".to_string(), "XMLHttpRequest".to_string()));
        }

        let cache_control = if endpoint.as_str().contains("search") {
            "no-cache"
        } else if endpoint.as_str().contains("api") {
            "max-age=0"
        } else if rng.gen_bool(0.5) {
            "no-cache"
        } else {
            "max-age=0"
        };
        headers.push(("Cache-Control".to_string(), cache_control.to_string()));

        if rng.gen_bool(REFERER_PROBABILITY) {
            if let Some(referer) = referrers.choose(&mut *rng) {
                headers.push(("Referer".to_string(), referer.clone()));
            }
        }

        headers.shuffle(&mut *rng);
        headers
    }

    /// Whether the profile at `index` can be selected without a pool reset.
    pub fn is_available(&self, index: usize) -> bool {
        let config = self.config.read().clone();
        let now = self.clock.now();
        self.pool.lock().usage.get(index).is_some_and(|usage| usage.available(now, &config))
    }

    pub fn profile_stats(&self) -> Vec<ProfileStats> {
        let config = self.config.read().clone();
        let now = self.clock.now();
        let pool = self.pool.lock();
        pool.profiles
            .iter()
            .zip(&pool.usage)
            .enumerate()
            .map(|(index, (profile, usage))| ProfileStats {
                index,
                fingerprint: profile.fingerprint(),
                user_agent: profile.user_agent.clone(),
                usage_count: usage.count,
                available: usage.available(now, &config),
                since_last_used: usage.last_used.map(|at| now.saturating_duration_since(at)),
            })
            .collect()
    }

    pub fn profile_count(&self) -> usize {
        self.pool.lock().profiles.len()
    }

    pub fn reset_all(&self) {
        let mut pool = self.pool.lock();
        pool.reset();
        pool.cursor = 0;
        info!("identity_usage_reset");
    }

    pub fn config(&self) -> IdentityConfig {
        self.config.read().clone()
    }

    /// Apply a new config; a changed profile list rebuilds the pool.
    pub fn update_config(&self, config: IdentityConfig) -> ConfigResult<()> {
        config.validate()?;
        let mut current = self.config.write();
        if current.profiles != config.profiles {
            *self.pool.lock() = Pool::new(config.resolved_profiles());
        }
        *current = config;
        Ok(())
    }
}

//! Session credential cache keyed by identity and time bucket.
//!
//! Credentials are tied to the identity that obtained them. A record is
//! served until it expires or the identity hits an authorization failure,
//! after which every record of that identity is invalidated.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bulwark_common::duration_millis;
use bulwark_common::error::{ConfigError, ConfigResult, OperationError};
use bulwark_common::time::{SharedClock, SystemClock};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::identity::IdentityProfile;

/// Opaque session secret; never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

impl From<&str> for Credential {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Credential {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Hex-encoded 16-byte session key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionKey(String);

impl SessionKey {
    fn derive(fingerprint: &str, bucket: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(fingerprint.as_bytes());
        hasher.update(&bucket.to_le_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest.as_bytes()[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Obtains a fresh credential for an identity.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn acquire(&self, identity: &IdentityProfile)
        -> Result<Option<Credential>, OperationError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(with = "duration_millis")]
    pub max_session_age: Duration,
    /// Granularity of the time component in session keys
    #[serde(with = "duration_millis")]
    pub time_bucket: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_session_age: Duration::from_secs(24 * 60 * 60),
            time_bucket: Duration::from_secs(1000),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_session_age.is_zero() {
            return Err(ConfigError::invalid("max_session_age", "must be greater than 0"));
        }
        if self.time_bucket.as_millis() == 0 {
            return Err(ConfigError::invalid("time_bucket", "must be at least 1ms"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct SessionRecord {
    credential: Credential,
    identity_fingerprint: String,
    created_at: Instant,
    /// `None` when `max_session_age` reaches past the clock's range
    expires_at: Option<Instant>,
    valid: bool,
}

impl SessionRecord {
    fn usable(&self, now: Instant) -> bool {
        self.valid && self.expires_at.map_or(true, |at| now < at)
    }
}

/// A valid session borrowed from another identity.
#[derive(Debug, Clone)]
pub struct RotatedSession {
    pub key: SessionKey,
    pub identity_fingerprint: String,
    pub credential: Credential,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub valid: usize,
}

pub struct SessionAuthManager {
    config: RwLock<SessionConfig>,
    sessions: DashMap<SessionKey, SessionRecord>,
    rotation_cursor: AtomicUsize,
    clock: SharedClock,
}

impl fmt::Debug for SessionAuthManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionAuthManager")
            .field("config", &*self.config.read())
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl SessionAuthManager {
    pub fn new(config: SessionConfig) -> ConfigResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: SessionConfig, clock: SharedClock) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config: RwLock::new(config),
            sessions: DashMap::new(),
            rotation_cursor: AtomicUsize::new(0),
            clock,
        })
    }

    /// Key for `identity` in the current time bucket.
    pub fn session_key(&self, identity: &IdentityProfile) -> SessionKey {
        let bucket_ms = self.config.read().time_bucket.as_millis().max(1);
        let bucket = u128::from(self.clock.millis_since_epoch()) / bucket_ms;
        SessionKey::derive(&identity.fingerprint(), u64::try_from(bucket).unwrap_or(u64::MAX))
    }

    pub fn store(&self, identity: &IdentityProfile, credential: Credential) -> SessionKey {
        let key = self.session_key(identity);
        let now = self.clock.now();
        let max_age = self.config.read().max_session_age;
        self.sessions.insert(
            key.clone(),
            SessionRecord {
                credential,
                identity_fingerprint: identity.fingerprint(),
                created_at: now,
                expires_at: now.checked_add(max_age),
                valid: true,
            },
        );
        debug!(session = %key, "session_stored");
        key
    }

    /// Newest valid, unexpired credential for `identity`.
    pub fn lookup(&self, identity: &IdentityProfile) -> Option<Credential> {
        let now = self.clock.now();
        let key = self.session_key(identity);
        if let Some(record) = self.sessions.get(&key) {
            if record.usable(now) {
                return Some(record.credential.clone());
            }
        }

        let fingerprint = identity.fingerprint();
        self.sessions
            .iter()
            .filter(|entry| entry.identity_fingerprint == fingerprint && entry.usable(now))
            .max_by_key(|entry| entry.created_at)
            .map(|entry| entry.credential.clone())
    }

    /// Cached credential, or a fresh one from `source` which is then stored.
    ///
    /// A failing source is logged and treated as "no credential".
    pub async fn acquire(
        &self,
        identity: &IdentityProfile,
        source: &dyn CredentialSource,
    ) -> Option<Credential> {
        if let Some(credential) = self.lookup(identity) {
            return Some(credential);
        }
        match source.acquire(identity).await {
            Ok(Some(credential)) => {
                self.store(identity, credential.clone());
                Some(credential)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "credential_acquire_failed");
                None
            }
        }
    }

    /// Invalidate every record belonging to `identity`, across all buckets.
    pub fn invalidate(&self, identity: &IdentityProfile) -> usize {
        let fingerprint = identity.fingerprint();
        let mut invalidated = 0;
        for mut entry in self.sessions.iter_mut() {
            if entry.identity_fingerprint == fingerprint && entry.valid {
                entry.valid = false;
                invalidated += 1;
            }
        }
        if invalidated > 0 {
            info!(sessions = invalidated, "sessions_invalidated");
        }
        invalidated
    }

    /// Round-robin over valid sessions that do not belong to `exclude`.
    pub fn rotate(&self, exclude: &IdentityProfile) -> Option<RotatedSession> {
        let now = self.clock.now();
        let excluded = exclude.fingerprint();
        let mut candidates: Vec<RotatedSession> = self
            .sessions
            .iter()
            .filter(|entry| entry.identity_fingerprint != excluded && entry.usable(now))
            .map(|entry| RotatedSession {
                key: entry.key().clone(),
                identity_fingerprint: entry.identity_fingerprint.clone(),
                credential: entry.credential.clone(),
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| a.key.cmp(&b.key));
        let index = self.rotation_cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates.swap_remove(index))
    }

    /// Drop expired and invalidated records.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.sessions.len();
        self.sessions.retain(|_, record| record.usable(now));
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            debug!(removed, "sessions_swept");
        }
        removed
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn valid_session_count(&self) -> usize {
        let now = self.clock.now();
        self.sessions.iter().filter(|entry| entry.usable(now)).count()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats { total: self.session_count(), valid: self.valid_session_count() }
    }

    pub fn reset_all(&self) {
        self.sessions.clear();
        self.rotation_cursor.store(0, Ordering::Relaxed);
    }

    pub fn config(&self) -> SessionConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, config: SessionConfig) -> ConfigResult<()> {
        config.validate()?;
        *self.config.write() = config;
        Ok(())
    }
}

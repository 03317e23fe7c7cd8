//! Endpoint identity used as the key for per-endpoint state.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use bulwark_common::utils::shorten;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Display width used when endpoint keys appear in logs.
pub const LOG_KEY_WIDTH: usize = 50;

/// Stable, cheaply clonable key for a logical remote target.
///
/// Rate limiter and circuit breaker state are both keyed by this type, so two
/// components always agree on what "the same endpoint" means.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey(Arc<str>);

impl EndpointKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Log-friendly form, at most [`LOG_KEY_WIDTH`] characters.
    pub fn short(&self) -> String {
        shorten(&self.0, LOG_KEY_WIDTH)
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

impl fmt::Debug for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EndpointKey").field(&&*self.0).finish()
    }
}

impl Borrow<str> for EndpointKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for EndpointKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EndpointKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EndpointKey {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl From<&EndpointKey> for EndpointKey {
    fn from(value: &EndpointKey) -> Self {
        value.clone()
    }
}

impl Serialize for EndpointKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for EndpointKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

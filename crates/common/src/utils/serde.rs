//! Serialization helpers for configuration and stats types
//!
//! Durations are written as plain integer milliseconds so TOML and JSON
//! configuration stays readable (`recovery_timeout = 300000`).

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Serde result type
type SerializeResult<S> = Result<<S as Serializer>::Ok, <S as Serializer>::Error>;

/// Serialize/deserialize a [`Duration`] as milliseconds (u64)
///
/// ```rust
/// use std::time::Duration;
///
/// use bulwark_common::duration_millis;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Example {
///     #[serde(with = "duration_millis")]
///     timeout: Duration,
/// }
/// ```
pub mod duration_millis {
    use super::{Deserialize, Deserializer, Duration, SerializeResult, Serializer};

    /// Serialize a Duration as milliseconds
    pub fn serialize<S>(duration: &Duration, serializer: S) -> SerializeResult<S>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize milliseconds into a Duration
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Same as [`duration_millis`] for `Option<Duration>`; `None` serializes as
/// null.
pub mod option_duration_millis {
    use super::{Deserialize, Deserializer, Duration, SerializeResult, Serializer};

    /// Serialize an optional Duration as milliseconds
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> SerializeResult<S>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer
                .serialize_some(&u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize optional milliseconds into a Duration
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for serialization utilities

    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Window {
        #[serde(with = "duration_millis")]
        span: Duration,
        #[serde(with = "option_duration_millis", default)]
        retry_after: Option<Duration>,
    }

    /// Tests that durations are written as integer milliseconds
    #[test]
    fn test_duration_millis_serialize() {
        let window = Window { span: Duration::from_millis(1500), retry_after: None };
        let json = serde_json::to_string(&window).expect("window should serialize");
        assert_eq!(json, r#"{"span":1500,"retry_after":null}"#);
    }

    /// Tests that TOML integers deserialize into durations
    #[test]
    fn test_duration_millis_from_toml() {
        let window: Window =
            toml::from_str("span = 300000\nretry_after = 2500").expect("toml should parse");
        assert_eq!(window.span, Duration::from_secs(300));
        assert_eq!(window.retry_after, Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_missing_optional_duration_defaults_to_none() {
        let window: Window = serde_json::from_str(r#"{"span":0}"#).expect("json should parse");
        assert_eq!(window, Window { span: Duration::ZERO, retry_after: None });
    }
}

//! Common utility functions
//!
//! - **[`serde`]**: Serialization helpers for common data types
//! - **[`shorten`]**: Log-friendly truncation of long identifiers

pub mod serde;

pub use self::serde::{duration_millis, option_duration_millis};

/// Shortens `value` to at most `max_len` characters for log output.
///
/// Long values keep their head and tail around a `...` marker so both the
/// prefix (host/path) and the suffix (query) stay recognizable.
///
/// ```rust
/// use bulwark_common::utils::shorten;
///
/// let long = "a".repeat(30) + &"b".repeat(40);
/// let short = shorten(&long, 50);
/// assert_eq!(short.chars().count(), 50);
/// assert!(short.starts_with("aaaa") && short.ends_with("bbbb"));
/// ```
pub fn shorten(value: &str, max_len: usize) -> String {
    let len = value.chars().count();
    if len <= max_len || max_len <= 3 {
        return value.to_string();
    }

    let head = (max_len * 3) / 5;
    let tail = max_len - head - 3;
    let prefix: String = value.chars().take(head).collect();
    let suffix: String = value.chars().skip(len - tail).collect();
    format!("{prefix}...{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shorten_keeps_short_values() {
        assert_eq!(shorten("search", 50), "search");
    }

    #[test]
    fn test_shorten_uses_head_and_tail() {
        let value: String = ('a'..='z').cycle().take(80).collect();
        let short = shorten(&value, 50);

        assert_eq!(short.chars().count(), 50);
        assert_eq!(&short[..30], &value[..30]);
        assert_eq!(&short[33..], &value[63..]);
        assert_eq!(&short[30..33], "...");
    }
}

//! Client identity profiles presented to the remote endpoint.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Browser viewport dimensions in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// A coherent set of client characteristics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProfile {
    pub user_agent: String,
    pub platform: String,
    pub accept_language: String,
    pub viewport: Viewport,
    /// Static headers sent with every request under this identity
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl IdentityProfile {
    pub fn new(
        user_agent: impl Into<String>,
        platform: impl Into<String>,
        accept_language: impl Into<String>,
        viewport: Viewport,
    ) -> Self {
        Self {
            user_agent: user_agent.into(),
            platform: platform.into(),
            accept_language: accept_language.into(),
            viewport,
            headers: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Stable blake3 digest of the identifying fields, hex-encoded.
    ///
    /// Two profiles with the same user agent, platform, language and
    /// viewport share a fingerprint regardless of their extra headers.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.user_agent.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(self.platform.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(self.accept_language.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(&self.viewport.width.to_le_bytes());
        hasher.update(&self.viewport.height.to_le_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

fn desktop_headers(profile: IdentityProfile, sec_ch_platform: Option<&str>) -> IdentityProfile {
    let profile = profile
        .with_header(
            "Accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        )
        .with_header("Accept-Encoding", "gzip, deflate, br")
        .with_header("Upgrade-Insecure-Requests", "1");
    match sec_ch_platform {
        Some(platform) => profile
            .with_header("Sec-Ch-Ua", r#""Not_A Brand";v="8", "Chromium";v="120", "Google Chrome";v="120""#)
            .with_header("Sec-Ch-Ua-Mobile", "?0")
            .with_header("Sec-Ch-Ua-Platform", format!("\"{platform}\"")),
        None => profile,
    }
}

/// Built-in desktop pool used when no profiles are configured.
pub fn default_profiles() -> Vec<IdentityProfile> {
    vec![
        desktop_headers(
            IdentityProfile::new(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
                 Chrome/120.0.0.0 Safari/537.36",
                "Win32",
                "en-US,en;q=0.9",
                Viewport { width: 1920, height: 1080 },
            ),
            Some("Windows"),
        ),
        desktop_headers(
            IdentityProfile::new(
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like \
                 Gecko) Chrome/120.0.0.0 Safari/537.36",
                "MacIntel",
                "en-US,en;q=0.9",
                Viewport { width: 1440, height: 900 },
            ),
            Some("macOS"),
        ),
        desktop_headers(
            IdentityProfile::new(
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
                 Chrome/120.0.0.0 Safari/537.36",
                "Linux x86_64",
                "en-US,en;q=0.8",
                Viewport { width: 1366, height: 768 },
            ),
            Some("Linux"),
        ),
        desktop_headers(
            IdentityProfile::new(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
                "Win32",
                "en-US,en;q=0.5",
                Viewport { width: 1536, height: 864 },
            ),
            None,
        ),
        desktop_headers(
            IdentityProfile::new(
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 \
                 Firefox/121.0",
                "MacIntel",
                "en-GB,en;q=0.7",
                Viewport { width: 1680, height: 1050 },
            ),
            None,
        ),
    ]
}

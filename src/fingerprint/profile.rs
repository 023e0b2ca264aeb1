//! Profile catalog: built-in profiles, file loading, constrained selection.

use std::collections::BTreeMap;
use std::path::Path;

use once_cell::sync::Lazy;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Fingerprint-related errors
#[derive(Error, Debug)]
pub enum FingerprintError {
    #[error("fingerprint catalog is empty")]
    EmptyCatalog,

    #[error("no fingerprint profile matches the requested constraints")]
    NoMatch,

    #[error("failed to read profile catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse profile catalog: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Viewport dimensions in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// One spoofed browser identity.
///
/// Immutable once selected for a session. `webgl_noise_seed` drives every
/// random-looking value in the rendered payload, so the same profile always
/// produces the same injection script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintProfile {
    pub id: String,
    pub user_agent: String,
    /// navigator property name -> spoofed value, applied in order
    #[serde(default)]
    pub navigator_overrides: BTreeMap<String, serde_json::Value>,
    pub webgl_noise_seed: u64,
    pub viewport: Viewport,
    pub locale: String,
    pub timezone: String,
}

/// Optional filters for profile selection.
#[derive(Debug, Clone, Default)]
pub struct ProfileConstraints {
    pub locale: Option<String>,
    pub timezone: Option<String>,
}

impl ProfileConstraints {
    pub fn locale(locale: &str) -> Self {
        Self {
            locale: Some(locale.to_string()),
            ..Default::default()
        }
    }

    fn matches(&self, profile: &FingerprintProfile) -> bool {
        if let Some(ref locale) = self.locale {
            if &profile.locale != locale {
                return false;
            }
        }
        if let Some(ref timezone) = self.timezone {
            if &profile.timezone != timezone {
                return false;
            }
        }
        true
    }
}

fn builtin_profile(
    id: &str,
    user_agent: &str,
    platform: &str,
    cores: u32,
    viewport: (u32, u32),
    locale: &str,
    timezone: &str,
    seed: u64,
) -> FingerprintProfile {
    let mut overrides = BTreeMap::new();
    overrides.insert("platform".to_string(), serde_json::json!(platform));
    overrides.insert("hardwareConcurrency".to_string(), serde_json::json!(cores));
    overrides.insert("deviceMemory".to_string(), serde_json::json!(8));
    overrides.insert("maxTouchPoints".to_string(), serde_json::json!(0));

    FingerprintProfile {
        id: id.to_string(),
        user_agent: user_agent.to_string(),
        navigator_overrides: overrides,
        webgl_noise_seed: seed,
        viewport: Viewport {
            width: viewport.0,
            height: viewport.1,
        },
        locale: locale.to_string(),
        timezone: timezone.to_string(),
    }
}

const UA_WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const UA_MACOS: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const UA_LINUX: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Built-in profiles: common desktop resolutions crossed with a small set of
/// platform/locale variants. Seeds are fixed so rendered payloads are stable
/// across runs.
static BUILTIN_PROFILES: Lazy<Vec<FingerprintProfile>> = Lazy::new(|| {
    vec![
        builtin_profile("win-1080p-en-us", UA_WINDOWS, "Win32", 8, (1920, 1080), "en-US", "America/New_York", 0x5eed_0001),
        builtin_profile("win-768p-en-us", UA_WINDOWS, "Win32", 4, (1366, 768), "en-US", "America/Chicago", 0x5eed_0002),
        builtin_profile("win-864p-en-gb", UA_WINDOWS, "Win32", 8, (1536, 864), "en-GB", "Europe/London", 0x5eed_0003),
        builtin_profile("win-1440p-de-de", UA_WINDOWS, "Win32", 12, (2560, 1440), "de-DE", "Europe/Berlin", 0x5eed_0004),
        builtin_profile("mac-900p-en-us", UA_MACOS, "MacIntel", 8, (1440, 900), "en-US", "America/Los_Angeles", 0x5eed_0005),
        builtin_profile("mac-1080p-fr-fr", UA_MACOS, "MacIntel", 8, (1920, 1080), "fr-FR", "Europe/Paris", 0x5eed_0006),
        builtin_profile("linux-1080p-en-us", UA_LINUX, "Linux x86_64", 8, (1920, 1080), "en-US", "America/New_York", 0x5eed_0007),
        builtin_profile("linux-720p-en-gb", UA_LINUX, "Linux x86_64", 4, (1280, 720), "en-GB", "Europe/London", 0x5eed_0008),
    ]
});

/// Read-only catalog of fingerprint profiles.
pub struct ProfileCatalog {
    profiles: Vec<FingerprintProfile>,
}

impl ProfileCatalog {
    /// The built-in catalog.
    pub fn builtin() -> Self {
        Self {
            profiles: BUILTIN_PROFILES.clone(),
        }
    }

    /// Build a catalog from explicit profiles. Rejects an empty set.
    pub fn from_profiles(profiles: Vec<FingerprintProfile>) -> Result<Self, FingerprintError> {
        if profiles.is_empty() {
            return Err(FingerprintError::EmptyCatalog);
        }
        Ok(Self { profiles })
    }

    /// Load a catalog from a JSON file holding an array of profiles.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, FingerprintError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| FingerprintError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let profiles: Vec<FingerprintProfile> = serde_json::from_str(&content)?;
        info!("loaded {} fingerprint profiles from {}", profiles.len(), path.display());
        Self::from_profiles(profiles)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Pick a profile uniformly at random, optionally filtered.
    pub fn select(
        &self,
        constraints: Option<&ProfileConstraints>,
    ) -> Result<FingerprintProfile, FingerprintError> {
        if self.profiles.is_empty() {
            return Err(FingerprintError::EmptyCatalog);
        }

        let candidates: Vec<&FingerprintProfile> = match constraints {
            Some(c) => self.profiles.iter().filter(|p| c.matches(p)).collect(),
            None => self.profiles.iter().collect(),
        };

        if candidates.is_empty() {
            return Err(FingerprintError::NoMatch);
        }

        let picked = candidates[rand::thread_rng().gen_range(0..candidates.len())].clone();
        debug!(profile = %picked.id, "fingerprint profile selected");
        Ok(picked)
    }
}

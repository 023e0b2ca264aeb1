//! cloakwork
//!
//! Detection-resistant browser session orchestration. Wraps an external
//! browser-driver engine with the session-level concerns of scraping and
//! testing workloads: rotating egress proxies with health tracking,
//! fingerprint countermeasures installed before page scripts run, and
//! CAPTCHA solving delegated to external providers as a blocking step inside
//! navigation.

pub mod actions;
pub mod captcha;
pub mod driver;
pub mod fingerprint;
pub mod proxy;
pub mod session;

use std::path::PathBuf;

use tracing::{error, info, warn};

use captcha::Provider;

/// Crate configuration, loaded once at process start and immutable after.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Run browsers headless
    pub headless: bool,
    /// Ordered proxy URLs seeding the pool
    pub proxies: Vec<String>,
    /// Path to a JSON fingerprint catalog; the built-in catalog is used when
    /// unset
    pub fingerprint_profiles: Option<PathBuf>,
    /// CAPTCHA solving service
    pub captcha_provider: Provider,
    pub captcha_api_key: String,
    /// Consecutive failures before a proxy is marked dead
    pub proxy_failure_threshold: u32,
    pub navigation_timeout_secs: u64,
    pub captcha_timeout_secs: u64,
    pub captcha_poll_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            headless: true,
            proxies: vec![],
            fingerprint_profiles: None,
            captcha_provider: Provider::TwoCaptcha,
            captcha_api_key: String::new(),
            proxy_failure_threshold: proxy::DEFAULT_FAILURE_THRESHOLD,
            navigation_timeout_secs: 30,
            captcha_timeout_secs: 120,
            captcha_poll_interval_secs: 5,
        }
    }
}

impl Config {
    /// Get config file path
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("cloakwork").join("config.json"))
    }

    /// Load config from file, then apply environment overrides.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(path) = Self::config_path() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str(&content) {
                        Ok(parsed) => {
                            info!("loaded config from {:?}", path);
                            config = parsed;
                        }
                        Err(e) => warn!("failed to parse config file: {}", e),
                    },
                    Err(e) => warn!("failed to read config file: {}", e),
                }
            }
        }

        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("HEADLESS") {
            if let Some(parsed) = parse_bool(&value) {
                self.headless = parsed;
            }
        }

        if let Ok(value) = std::env::var("CAPTCHA_API_KEY") {
            if !value.is_empty() {
                self.captcha_api_key = value;
            }
        }

        if let Ok(value) = std::env::var("CAPTCHA_PROVIDER") {
            match value.trim().to_lowercase().as_str() {
                "twocaptcha" | "2captcha" => self.captcha_provider = Provider::TwoCaptcha,
                "anticaptcha" | "anti-captcha" => self.captcha_provider = Provider::AntiCaptcha,
                other => warn!("unknown CAPTCHA_PROVIDER '{}', keeping {:?}", other, self.captcha_provider),
            }
        }

        // One proxy URL per line, comments and blanks skipped
        if let Ok(path) = std::env::var("PROXY_LIST_FILE") {
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    self.proxies = content
                        .lines()
                        .map(str::trim)
                        .filter(|line| !line.is_empty() && !line.starts_with('#'))
                        .map(str::to_string)
                        .collect();
                    info!("loaded {} proxies from {}", self.proxies.len(), path);
                }
                Err(e) => warn!("failed to read PROXY_LIST_FILE {}: {}", path, e),
            }
        }
    }

    /// Save config to file
    pub fn save(&self) {
        if let Some(path) = Self::config_path() {
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("failed to create config directory: {}", e);
                    return;
                }
            }

            match serde_json::to_string_pretty(self) {
                Ok(content) => {
                    if let Err(e) = std::fs::write(&path, content) {
                        error!("failed to save config: {}", e);
                    } else {
                        info!("config saved to {:?}", path);
                    }
                }
                Err(e) => error!("failed to serialize config: {}", e),
            }
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Get log directory path (shared across modules)
pub fn log_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("cloakwork").join("logs"))
}

/// Truncate a string to at most `max_chars` characters, respecting UTF-8
/// boundaries.
pub(crate) fn safe_truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Initialize logging: console layer plus a daily-rolling file layer when a
/// log directory is available. Keep the returned guard alive for the process
/// lifetime.
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "cloakwork.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}

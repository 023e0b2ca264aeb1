//! Chrome-backed driver implementation.
//!
//! Each context is its own Chrome instance so the proxy binding is airtight:
//! Chrome has no per-tab proxy, and sharing one process across proxies leaks
//! connections through the wrong egress. Stealth flags follow the
//! undetected-chromedriver set; identity overrides (user agent, headers,
//! timezone) go through CDP so they apply at the engine level.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetTimezoneOverrideParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{Headers, SetExtraHttpHeadersParams};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat,
};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ContextSpec, Driver, DriverError, PageView};

/// Upper bound on a single Chrome launch
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(45);

/// Find a Chrome/Chromium executable on the system.
fn find_chrome() -> Option<PathBuf> {
    let candidates: Vec<PathBuf> = if cfg!(target_os = "windows") {
        let mut paths = vec![
            PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
            PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        ];
        if let Ok(local) = std::env::var("LOCALAPPDATA") {
            paths.push(PathBuf::from(format!(
                r"{}\Google\Chrome\Application\chrome.exe",
                local
            )));
        }
        paths
    } else if cfg!(target_os = "macos") {
        vec![PathBuf::from(
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        )]
    } else {
        vec![
            PathBuf::from("/usr/bin/chromium"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/google-chrome-stable"),
        ]
    };

    candidates.into_iter().find(|p| p.exists())
}

/// Classify a CDP failure during navigation.
///
/// Chrome reports network failures as net:: error codes in the message;
/// tunnel/connection/timeout codes implicate the proxy, everything else is a
/// page-level failure.
fn classify_goto_error(message: String) -> DriverError {
    const PROXY_CODES: [&str; 5] = [
        "ERR_PROXY",
        "ERR_TUNNEL",
        "ERR_CONNECTION",
        "ERR_TIMED_OUT",
        "ERR_EMPTY_RESPONSE",
    ];
    if PROXY_CODES.iter().any(|code| message.contains(code)) {
        DriverError::ConnectionFailed(message)
    } else {
        DriverError::NavigationFailed(message)
    }
}

/// One launched Chrome instance bound to one proxy.
pub struct ChromiumContext {
    id: String,
    browser: Browser,
    handler_task: tokio::task::JoinHandle<()>,
    spec: ContextSpec,
}

/// A page inside a [`ChromiumContext`].
pub struct ChromiumPage {
    page: Page,
}

/// Driver implementation backed by `chromiumoxide`.
pub struct ChromiumDriver {
    chrome_path: Option<PathBuf>,
}

impl ChromiumDriver {
    /// Create a driver, auto-detecting the Chrome executable.
    pub fn new() -> Self {
        Self {
            chrome_path: find_chrome(),
        }
    }

    /// Use a specific Chrome executable.
    pub fn with_chrome_path(path: PathBuf) -> Self {
        Self {
            chrome_path: Some(path),
        }
    }
}

impl Default for ChromiumDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for ChromiumDriver {
    type Context = ChromiumContext;
    type Page = ChromiumPage;

    async fn launch_context(&self, spec: &ContextSpec) -> Result<ChromiumContext, DriverError> {
        let context_id = Uuid::new_v4().to_string();

        let mut builder = BrowserConfig::builder();

        if !spec.headless {
            builder = builder.with_head();
        }

        if let Some(ref path) = self.chrome_path {
            builder = builder.chrome_executable(path);
        } else {
            return Err(DriverError::LaunchFailed(
                "Chrome/Chromium executable not found".to_string(),
            ));
        }

        // Isolated profile directory per context
        let user_data_dir = std::env::temp_dir()
            .join("cloakwork")
            .join("browser_data")
            .join(&context_id);
        let _ = std::fs::create_dir_all(&user_data_dir);
        builder = builder.user_data_dir(&user_data_dir);

        // Stealth flags (undetected-chromedriver style)
        builder = builder
            .args(vec![
                "--disable-blink-features=AutomationControlled",
                "--disable-infobars",
                "--no-default-browser-check",
                "--disable-features=TranslateUI,AutomationControlled,IsolateOrigins,site-per-process",
                "--disable-session-crashed-bubble",
                "--disable-site-isolation-trials",
                "--disable-notifications",
                "--disable-domain-reliability",
                "--disable-component-update",
                // Required when running as root (Docker, VPS)
                "--no-sandbox",
                // WebRTC IP leak prevention
                "--force-webrtc-ip-handling-policy=disable_non_proxied_udp",
                "--enforce-webrtc-ip-permission-check",
            ])
            .arg(format!("--lang={}", spec.locale))
            .window_size(spec.viewport.width, spec.viewport.height);

        if let Some(ref proxy) = spec.proxy {
            // Chrome takes scheme://host:port only; credentialed upstreams
            // authenticate at the HTTP layer, not in this flag.
            builder = builder.arg(format!("--proxy-server={}", proxy.server_url()));
        }

        let config = builder
            .build()
            .map_err(DriverError::LaunchFailed)?;

        let (browser, mut handler) = tokio::time::timeout(LAUNCH_TIMEOUT, Browser::launch(config))
            .await
            .map_err(|_| DriverError::Timeout("browser launch timed out".to_string()))?
            .map_err(|e| DriverError::LaunchFailed(e.to_string()))?;

        // Drain CDP events; when this stream ends, Chrome is gone.
        let handler_context = context_id.clone();
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
            warn!(context = %handler_context, "browser disconnected (event handler ended)");
        });

        info!(context = %context_id, headless = spec.headless, "browser context launched");

        Ok(ChromiumContext {
            id: context_id,
            browser,
            handler_task,
            spec: spec.clone(),
        })
    }

    async fn new_page(&self, context: &ChromiumContext) -> Result<ChromiumPage, DriverError> {
        let page = context
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| DriverError::LaunchFailed(e.to_string()))?;

        let spec = &context.spec;

        let accept_language = spec
            .extra_headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("accept-language"))
            .map(|(_, value)| value.clone());

        // Engine-level identity overrides; invisible to in-page inspection.
        if let Some(ref user_agent) = spec.user_agent {
            let ua_params = SetUserAgentOverrideParams {
                user_agent: user_agent.clone(),
                accept_language: accept_language.clone(),
                platform: None,
                user_agent_metadata: None,
            };
            page.execute(ua_params)
                .await
                .map_err(|e| DriverError::LaunchFailed(format!("user agent override: {}", e)))?;
        }

        page.execute(SetTimezoneOverrideParams::new(spec.timezone.clone()))
            .await
            .map_err(|e| DriverError::LaunchFailed(format!("timezone override: {}", e)))?;

        if !spec.extra_headers.is_empty() {
            let mut headers = serde_json::Map::new();
            for (name, value) in &spec.extra_headers {
                headers.insert(name.clone(), serde_json::Value::String(value.clone()));
            }
            page.execute(SetExtraHttpHeadersParams::new(Headers::new(
                serde_json::Value::Object(headers),
            )))
            .await
            .map_err(|e| DriverError::LaunchFailed(format!("extra headers: {}", e)))?;
        }

        debug!(context = %context.id, "page created");
        Ok(ChromiumPage { page })
    }

    async fn install_script(&self, page: &ChromiumPage, script: &str) -> Result<(), DriverError> {
        page.page
            .execute(AddScriptToEvaluateOnNewDocumentParams::new(script))
            .await
            .map_err(|e| DriverError::Script(e.to_string()))?;
        Ok(())
    }

    async fn goto(&self, page: &ChromiumPage, url: &str) -> Result<PageView, DriverError> {
        page.page
            .goto(url)
            .await
            .map_err(|e| classify_goto_error(e.to_string()))?;
        page.page
            .wait_for_navigation()
            .await
            .map_err(|e| classify_goto_error(e.to_string()))?;

        let content = page
            .page
            .content()
            .await
            .map_err(|e| DriverError::ConnectionLost(e.to_string()))?;
        let landed = page
            .page
            .url()
            .await
            .map_err(|e| DriverError::ConnectionLost(e.to_string()))?
            .unwrap_or_else(|| url.to_string());

        Ok(PageView {
            url: landed,
            content,
        })
    }

    async fn eval(
        &self,
        page: &ChromiumPage,
        script: &str,
    ) -> Result<serde_json::Value, DriverError> {
        let result = page
            .page
            .evaluate(script)
            .await
            .map_err(|e| DriverError::Script(e.to_string()))?;
        Ok(result.into_value().unwrap_or(serde_json::Value::Null))
    }

    async fn screenshot(&self, page: &ChromiumPage) -> Result<Vec<u8>, DriverError> {
        page.page
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .full_page(false)
                    .build(),
            )
            .await
            .map_err(|e| DriverError::ConnectionLost(e.to_string()))
    }

    async fn close_context(&self, mut context: ChromiumContext) -> Result<(), DriverError> {
        // Graceful close first, then force kill so no Chrome tree outlives us.
        let _ = context.browser.close().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = context.browser.kill().await;
        context.handler_task.abort();

        info!(context = %context.id, "browser context closed");
        Ok(())
    }
}

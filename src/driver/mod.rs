//! Narrow interface to the external browser-driver engine.
//!
//! The orchestrator only ever sequences the operations below; everything the
//! engine does internally (process management, CDP transport, rendering) is
//! behind this seam. The production implementation drives Chrome through
//! `chromiumoxide`; tests substitute scripted stand-ins.

mod chromium;

use async_trait::async_trait;
use thiserror::Error;

pub use chromium::ChromiumDriver;

use crate::fingerprint::{extra_headers, FingerprintProfile, Viewport};
use crate::proxy::ProxyEndpoint;

/// Driver-level errors
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("failed to launch browser context: {0}")]
    LaunchFailed(String),

    #[error("proxy connection failed: {0}")]
    ConnectionFailed(String),

    #[error("navigation failed: {0}")]
    NavigationFailed(String),

    #[error("script evaluation failed: {0}")]
    Script(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("browser connection lost: {0}")]
    ConnectionLost(String),
}

impl DriverError {
    /// Whether the failure is attributable to the egress proxy rather than
    /// the target page. Drives proxy health reporting: connection and
    /// timeout failures count against the proxy, DNS and page errors do not.
    pub fn is_proxy_attributable(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::Timeout(_))
    }
}

/// Parameters for a new browser context.
#[derive(Debug, Clone)]
pub struct ContextSpec {
    pub headless: bool,
    pub proxy: Option<ProxyEndpoint>,
    pub user_agent: Option<String>,
    pub extra_headers: Vec<(String, String)>,
    pub viewport: Viewport,
    pub locale: String,
    pub timezone: String,
}

impl ContextSpec {
    /// Compose a context spec from a fingerprint profile and an egress proxy.
    pub fn for_profile(
        profile: &FingerprintProfile,
        proxy: Option<ProxyEndpoint>,
        headless: bool,
    ) -> Self {
        Self {
            headless,
            proxy,
            user_agent: Some(profile.user_agent.clone()),
            extra_headers: extra_headers(profile),
            viewport: profile.viewport,
            locale: profile.locale.clone(),
            timezone: profile.timezone.clone(),
        }
    }
}

/// The result of a completed navigation.
#[derive(Debug, Clone)]
pub struct PageView {
    /// URL the page landed on (after redirects)
    pub url: String,
    /// Serialized page content
    pub content: String,
}

/// Operations the session layer consumes from the browser engine.
///
/// One context maps to one isolated browser instance bound to one proxy;
/// pages belong to their context. Implementations must be safe to share
/// across session tasks (`&self` methods only).
#[async_trait]
pub trait Driver: Send + Sync {
    type Context: Send + Sync;
    type Page: Send + Sync;

    /// Launch an isolated browser context parameterized by proxy and
    /// fingerprint-derived settings.
    async fn launch_context(&self, spec: &ContextSpec) -> Result<Self::Context, DriverError>;

    /// Open a page in the context.
    async fn new_page(&self, context: &Self::Context) -> Result<Self::Page, DriverError>;

    /// Install a script that runs in every new document before any page
    /// script executes.
    async fn install_script(&self, page: &Self::Page, script: &str) -> Result<(), DriverError>;

    /// Navigate the page and return what it landed on.
    async fn goto(&self, page: &Self::Page, url: &str) -> Result<PageView, DriverError>;

    /// Evaluate a script in the page, returning its JSON result.
    async fn eval(&self, page: &Self::Page, script: &str)
        -> Result<serde_json::Value, DriverError>;

    /// Capture a screenshot of the page.
    async fn screenshot(&self, page: &Self::Page) -> Result<Vec<u8>, DriverError>;

    /// Tear the context down, releasing the underlying browser resources.
    async fn close_context(&self, context: Self::Context) -> Result<(), DriverError>;
}

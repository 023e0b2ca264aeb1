//! Challenge detection from page content.
//!
//! The orchestrator hands navigation results through here to decide whether a
//! page is gated by a CAPTCHA and, separately, whether an error page points at
//! the egress proxy rather than the target site.

use tracing::debug;

use super::types::{CaptchaChallenge, ChallengeKind};
use chrono::Utc;

/// Scan page content for a CAPTCHA gate.
///
/// hCaptcha is checked before reCAPTCHA because hCaptcha pages often ship a
/// reCAPTCHA compatibility shim. A detected challenge may lack a site key
/// (e.g. an interstitial that hides the widget markup); the solve then fails
/// with a missing-key error instead of being skipped silently.
pub fn detect_challenge(content: &str, page_url: &str) -> Option<CaptchaChallenge> {
    let kind = if has_hcaptcha_marker(content) {
        ChallengeKind::HCaptcha
    } else if has_recaptcha_marker(content, page_url) {
        ChallengeKind::Recaptcha
    } else {
        return None;
    };

    let site_key = extract_site_key(content);
    debug!(?kind, site_key = site_key.as_deref().unwrap_or("<none>"), "CAPTCHA marker found");

    Some(CaptchaChallenge {
        kind,
        site_key,
        image_payload: None,
        page_url: page_url.to_string(),
        created_at: Utc::now(),
    })
}

fn has_hcaptcha_marker(content: &str) -> bool {
    content.contains("hcaptcha.com") || content.contains("h-captcha")
}

fn has_recaptcha_marker(content: &str, page_url: &str) -> bool {
    // Google's /sorry/ interstitial wraps a reCAPTCHA even when the page body
    // only talks about unusual traffic.
    page_url.contains("/sorry/")
        || content.contains("g-recaptcha")
        || content.contains("www.google.com/recaptcha")
        || content.contains("grecaptcha")
        || content.contains("unusual traffic")
        || content.contains("automated queries")
}

/// Pull the widget site key out of page markup.
///
/// Looks for `data-sitekey` attributes (both quote styles), then falls back
/// to the `k=` query parameter of an embedded reCAPTCHA iframe.
pub fn extract_site_key(content: &str) -> Option<String> {
    for pattern in ["data-sitekey=\"", "data-sitekey='"] {
        if let Some(start) = content.find(pattern) {
            let rest = &content[start + pattern.len()..];
            let terminator = pattern.chars().last().unwrap_or('"');
            if let Some(end) = rest.find(terminator) {
                let key = &rest[..end];
                if !key.is_empty() {
                    return Some(key.to_string());
                }
            }
        }
    }

    if let Some(start) = content.find("/recaptcha/api2/anchor?") {
        let rest = &content[start..];
        if let Some(k) = rest.find("k=") {
            let key: String = rest[k + 2..]
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
                .collect();
            if !key.is_empty() {
                return Some(key);
            }
        }
    }

    None
}

/// Whether an error page points at the egress proxy rather than the target.
///
/// These are the Chrome error-page signatures for tunnel/connection problems
/// plus the upstream 407 case; they feed the proxy health loop while DNS and
/// page-level errors do not.
pub fn looks_like_proxy_failure(content: &str) -> bool {
    const SIGNATURES: [&str; 6] = [
        "ERR_PROXY_CONNECTION_FAILED",
        "ERR_TUNNEL_CONNECTION_FAILED",
        "ERR_PROXY",
        "ERR_CONNECTION",
        "ERR_TIMED_OUT",
        "Proxy Authentication Required",
    ];
    SIGNATURES.iter().any(|sig| content.contains(sig))
}

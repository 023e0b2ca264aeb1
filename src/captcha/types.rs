//! Challenge/solution model and provider API wire types.
//!
//! 2Captcha's v2 JSON API is wire-compatible with Anti-Captcha's, so both
//! providers share one set of request/response models; only the base URL
//! differs.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Supported CAPTCHA solving providers. Closed set; dispatch is static.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    TwoCaptcha,
    AntiCaptcha,
}

impl Provider {
    /// Base URL of the provider's task API.
    pub fn api_base(&self) -> &'static str {
        match self {
            Self::TwoCaptcha => "https://api.2captcha.com",
            Self::AntiCaptcha => "https://api.anti-captcha.com",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::TwoCaptcha => "2captcha",
            Self::AntiCaptcha => "anti-captcha",
        }
    }
}

/// Kinds of challenge the system can hand to a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Image,
    Recaptcha,
    HCaptcha,
}

/// A detected anti-automation challenge. Lives only for the solve attempt.
#[derive(Debug, Clone)]
pub struct CaptchaChallenge {
    pub kind: ChallengeKind,
    /// Site key for widget CAPTCHAs (reCAPTCHA, hCaptcha)
    pub site_key: Option<String>,
    /// Base64 image body for image CAPTCHAs
    pub image_payload: Option<String>,
    pub page_url: String,
    pub created_at: DateTime<Utc>,
}

impl CaptchaChallenge {
    pub fn recaptcha(site_key: &str, page_url: &str) -> Self {
        Self {
            kind: ChallengeKind::Recaptcha,
            site_key: Some(site_key.to_string()),
            image_payload: None,
            page_url: page_url.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn hcaptcha(site_key: &str, page_url: &str) -> Self {
        Self {
            kind: ChallengeKind::HCaptcha,
            site_key: Some(site_key.to_string()),
            image_payload: None,
            page_url: page_url.to_string(),
            created_at: Utc::now(),
        }
    }

    /// Build an image challenge from raw image bytes.
    pub fn image(image: &[u8], page_url: &str) -> Self {
        Self {
            kind: ChallengeKind::Image,
            site_key: None,
            image_payload: Some(base64::engine::general_purpose::STANDARD.encode(image)),
            page_url: page_url.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// A provider-produced solution. Consumed once by the caller.
#[derive(Debug, Clone)]
pub struct CaptchaSolution {
    pub token: String,
    pub solved_at: DateTime<Utc>,
    pub provider: Provider,
}

/// CAPTCHA error types
#[derive(Debug, thiserror::Error)]
pub enum CaptchaError {
    #[error("CAPTCHA API key not configured")]
    ApiKeyMissing,

    #[error("solve timed out after {0}s")]
    SolveTimeout(u64),

    #[error("{provider} rejected the task: {message}")]
    Provider {
        provider: &'static str,
        message: String,
    },

    #[error("network error talking to {provider}: {message}")]
    Network {
        provider: &'static str,
        message: String,
    },

    #[error("invalid response from {provider}: {message}")]
    InvalidResponse {
        provider: &'static str,
        message: String,
    },

    #[error("challenge is missing a site key")]
    MissingSiteKey,

    #[error("challenge is missing an image payload")]
    MissingImagePayload,
}

impl CaptchaError {
    /// Distinguishes deadline expiry from provider-side failure, so callers
    /// can decide between retrying elsewhere and giving up.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::SolveTimeout(_))
    }
}

// ========== Provider API wire models ==========

/// createTask request envelope
#[derive(Debug, Serialize)]
pub(crate) struct CreateTaskRequest {
    #[serde(rename = "clientKey")]
    pub client_key: String,
    pub task: ProviderTask,
}

/// Task payloads, tagged the way both provider APIs expect.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub(crate) enum ProviderTask {
    #[serde(rename = "RecaptchaV2TaskProxyless")]
    RecaptchaV2Proxyless {
        #[serde(rename = "websiteURL")]
        website_url: String,
        #[serde(rename = "websiteKey")]
        website_key: String,
    },

    #[serde(rename = "HCaptchaTaskProxyless")]
    HCaptchaProxyless {
        #[serde(rename = "websiteURL")]
        website_url: String,
        #[serde(rename = "websiteKey")]
        website_key: String,
    },

    #[serde(rename = "ImageToTextTask")]
    ImageToText { body: String },
}

impl ProviderTask {
    pub fn from_challenge(challenge: &CaptchaChallenge) -> Result<Self, CaptchaError> {
        match challenge.kind {
            ChallengeKind::Recaptcha => Ok(Self::RecaptchaV2Proxyless {
                website_url: challenge.page_url.clone(),
                website_key: challenge
                    .site_key
                    .clone()
                    .ok_or(CaptchaError::MissingSiteKey)?,
            }),
            ChallengeKind::HCaptcha => Ok(Self::HCaptchaProxyless {
                website_url: challenge.page_url.clone(),
                website_key: challenge
                    .site_key
                    .clone()
                    .ok_or(CaptchaError::MissingSiteKey)?,
            }),
            ChallengeKind::Image => Ok(Self::ImageToText {
                body: challenge
                    .image_payload
                    .clone()
                    .ok_or(CaptchaError::MissingImagePayload)?,
            }),
        }
    }
}

/// createTask response
#[derive(Debug, Deserialize)]
pub(crate) struct CreateTaskResponse {
    #[serde(rename = "errorId")]
    pub error_id: i32,
    #[serde(rename = "errorCode")]
    pub error_code: Option<String>,
    #[serde(rename = "errorDescription")]
    pub error_description: Option<String>,
    #[serde(rename = "taskId")]
    pub task_id: Option<i64>,
}

/// getTaskResult request
#[derive(Debug, Serialize)]
pub(crate) struct GetTaskResultRequest {
    #[serde(rename = "clientKey")]
    pub client_key: String,
    #[serde(rename = "taskId")]
    pub task_id: i64,
}

/// getTaskResult response
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub(crate) struct TaskResultResponse {
    #[serde(rename = "errorId")]
    pub error_id: i32,
    #[serde(rename = "errorCode")]
    pub error_code: Option<String>,
    #[serde(rename = "errorDescription")]
    pub error_description: Option<String>,
    pub status: Option<String>,
    pub solution: Option<ProviderSolution>,
}

impl TaskResultResponse {
    pub fn is_ready(&self) -> bool {
        self.status.as_deref() == Some("ready")
    }

    pub fn token(&self) -> Option<&str> {
        self.solution.as_ref().and_then(|s| {
            s.g_recaptcha_response
                .as_deref()
                .or(s.token.as_deref())
                .or(s.text.as_deref())
        })
    }
}

/// Solution payload; field population varies by challenge kind.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub(crate) struct ProviderSolution {
    #[serde(rename = "gRecaptchaResponse")]
    pub g_recaptcha_response: Option<String>,
    pub token: Option<String>,
    pub text: Option<String>,
}

/// getBalance response
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub(crate) struct BalanceResponse {
    #[serde(rename = "errorId")]
    pub error_id: i32,
    #[serde(rename = "errorDescription")]
    pub error_description: Option<String>,
    pub balance: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recaptcha_task_serializes_with_provider_field_names() {
        let challenge = CaptchaChallenge::recaptcha("site-key-1", "https://example.com/login");
        let task = ProviderTask::from_challenge(&challenge).unwrap();
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "RecaptchaV2TaskProxyless");
        assert_eq!(json["websiteURL"], "https://example.com/login");
        assert_eq!(json["websiteKey"], "site-key-1");
    }

    #[test]
    fn image_task_carries_base64_body() {
        let challenge = CaptchaChallenge::image(b"\x89PNG", "https://example.com");
        let task = ProviderTask::from_challenge(&challenge).unwrap();
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "ImageToTextTask");
        assert_eq!(json["body"], "iVBORw==");
    }

    #[test]
    fn widget_challenge_without_site_key_is_rejected() {
        let mut challenge = CaptchaChallenge::recaptcha("k", "https://example.com");
        challenge.site_key = None;
        assert!(matches!(
            ProviderTask::from_challenge(&challenge),
            Err(CaptchaError::MissingSiteKey)
        ));
    }

    #[test]
    fn task_result_prefers_grecaptcha_response_field() {
        let body = r#"{"errorId":0,"status":"ready","solution":{"gRecaptchaResponse":"tok-a","text":"tok-b"}}"#;
        let parsed: TaskResultResponse = serde_json::from_str(body).unwrap();
        assert!(parsed.is_ready());
        assert_eq!(parsed.token(), Some("tok-a"));
    }

    #[test]
    fn provider_enum_matches_config_spelling() {
        assert_eq!(
            serde_json::to_string(&Provider::TwoCaptcha).unwrap(),
            "\"twocaptcha\""
        );
        let parsed: Provider = serde_json::from_str("\"anticaptcha\"").unwrap();
        assert_eq!(parsed, Provider::AntiCaptcha);
    }
}

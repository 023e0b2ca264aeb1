//! Provider client: submit, poll, deadline enforcement.

use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::Client;
use tracing::{debug, info, warn};

use super::types::*;

/// Default delay between result polls
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Per-request HTTP timeout against the provider API
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for external CAPTCHA solving services.
///
/// One instance serves any number of concurrent solves; each `solve` call is
/// an independent submit-then-poll loop that suspends between polls and never
/// outlives its deadline. The client does not retry provider errors — that
/// policy belongs to the caller.
pub struct CaptchaSolverClient {
    api_key: String,
    client: Client,
    poll_interval: Duration,
    api_base_override: Option<String>,
}

impl CaptchaSolverClient {
    /// Create a new solver client.
    pub fn new(api_key: &str) -> Result<Self, CaptchaError> {
        if api_key.is_empty() {
            return Err(CaptchaError::ApiKeyMissing);
        }

        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| CaptchaError::Network {
                provider: "client",
                message: e.to_string(),
            })?;

        Ok(Self {
            api_key: api_key.to_string(),
            client,
            poll_interval: DEFAULT_POLL_INTERVAL,
            api_base_override: None,
        })
    }

    /// Set poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Override the provider API base URL (loopback stubs, regional mirrors).
    pub fn with_api_base(mut self, base: &str) -> Self {
        self.api_base_override = Some(base.trim_end_matches('/').to_string());
        self
    }

    fn api_base(&self, provider: Provider) -> String {
        self.api_base_override
            .clone()
            .unwrap_or_else(|| provider.api_base().to_string())
    }

    /// Solve a challenge: submit to the provider, then poll until a token
    /// arrives, the provider reports an error, or `timeout` elapses.
    pub async fn solve(
        &self,
        challenge: &CaptchaChallenge,
        provider: Provider,
        timeout: Duration,
    ) -> Result<CaptchaSolution, CaptchaError> {
        let started = Instant::now();
        let deadline = started + timeout;

        info!(
            kind = ?challenge.kind,
            provider = provider.name(),
            url = %challenge.page_url,
            "submitting CAPTCHA challenge"
        );

        let task_id = self.submit(challenge, provider).await?;
        debug!(provider = provider.name(), task_id, "task created");

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
            if Instant::now() >= deadline {
                break;
            }

            match self.poll(task_id, provider).await? {
                Some(token) => {
                    info!(
                        provider = provider.name(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "CAPTCHA solved"
                    );
                    return Ok(CaptchaSolution {
                        token,
                        solved_at: Utc::now(),
                        provider,
                    });
                }
                None => debug!(task_id, "task still processing"),
            }
        }

        warn!(
            provider = provider.name(),
            timeout_secs = timeout.as_secs(),
            "CAPTCHA solve timed out"
        );
        Err(CaptchaError::SolveTimeout(timeout.as_secs()))
    }

    /// Query the account balance at a provider.
    pub async fn balance(&self, provider: Provider) -> Result<f64, CaptchaError> {
        let url = format!("{}/getBalance", self.api_base(provider));
        let body = serde_json::json!({ "clientKey": self.api_key });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CaptchaError::Network {
                provider: provider.name(),
                message: e.to_string(),
            })?;

        let parsed: BalanceResponse =
            response.json().await.map_err(|e| CaptchaError::InvalidResponse {
                provider: provider.name(),
                message: e.to_string(),
            })?;

        if parsed.error_id != 0 {
            return Err(CaptchaError::Provider {
                provider: provider.name(),
                message: parsed
                    .error_description
                    .unwrap_or_else(|| format!("errorId={}", parsed.error_id)),
            });
        }

        parsed.balance.ok_or_else(|| CaptchaError::InvalidResponse {
            provider: provider.name(),
            message: "no balance in response".to_string(),
        })
    }

    /// Create a task at the provider. Returns the provider task id.
    async fn submit(
        &self,
        challenge: &CaptchaChallenge,
        provider: Provider,
    ) -> Result<i64, CaptchaError> {
        let url = format!("{}/createTask", self.api_base(provider));
        let request = CreateTaskRequest {
            client_key: self.api_key.clone(),
            task: ProviderTask::from_challenge(challenge)?,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| CaptchaError::Network {
                provider: provider.name(),
                message: e.to_string(),
            })?;

        let text = response.text().await.map_err(|e| CaptchaError::Network {
            provider: provider.name(),
            message: e.to_string(),
        })?;

        let parsed: CreateTaskResponse =
            serde_json::from_str(&text).map_err(|e| CaptchaError::InvalidResponse {
                provider: provider.name(),
                message: format!("{}: {}", e, crate::safe_truncate(&text, 200)),
            })?;

        if parsed.error_id != 0 {
            return Err(CaptchaError::Provider {
                provider: provider.name(),
                message: format!(
                    "{} ({})",
                    parsed.error_description.as_deref().unwrap_or("unknown error"),
                    parsed.error_code.as_deref().unwrap_or("no code")
                ),
            });
        }

        parsed.task_id.ok_or_else(|| CaptchaError::InvalidResponse {
            provider: provider.name(),
            message: "no task id in response".to_string(),
        })
    }

    /// Poll one task. `Ok(None)` means still processing.
    async fn poll(&self, task_id: i64, provider: Provider) -> Result<Option<String>, CaptchaError> {
        let url = format!("{}/getTaskResult", self.api_base(provider));
        let request = GetTaskResultRequest {
            client_key: self.api_key.clone(),
            task_id,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| CaptchaError::Network {
                provider: provider.name(),
                message: e.to_string(),
            })?;

        let parsed: TaskResultResponse =
            response.json().await.map_err(|e| CaptchaError::InvalidResponse {
                provider: provider.name(),
                message: e.to_string(),
            })?;

        if parsed.error_id != 0 {
            return Err(CaptchaError::Provider {
                provider: provider.name(),
                message: parsed
                    .error_description
                    .or(parsed.error_code)
                    .unwrap_or_else(|| format!("errorId={}", parsed.error_id)),
            });
        }

        if parsed.is_ready() {
            return match parsed.token() {
                Some(token) => Ok(Some(token.to_string())),
                None => Err(CaptchaError::InvalidResponse {
                    provider: provider.name(),
                    message: "ready task without a token".to_string(),
                }),
            };
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};

    /// Serve a stub provider API on a loopback port, returning its base URL.
    async fn spawn_stub(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn challenge() -> CaptchaChallenge {
        CaptchaChallenge::recaptcha("test-site-key", "https://example.com/login")
    }

    #[test]
    fn empty_api_key_is_rejected() {
        assert!(matches!(
            CaptchaSolverClient::new(""),
            Err(CaptchaError::ApiKeyMissing)
        ));
    }

    #[tokio::test]
    async fn solve_times_out_against_provider_that_never_resolves() {
        let app = Router::new()
            .route(
                "/createTask",
                post(|| async { Json(serde_json::json!({"errorId": 0, "taskId": 7})) }),
            )
            .route(
                "/getTaskResult",
                post(|| async { Json(serde_json::json!({"errorId": 0, "status": "processing"})) }),
            );
        let base = spawn_stub(app).await;

        let solver = CaptchaSolverClient::new("key")
            .unwrap()
            .with_api_base(&base)
            .with_poll_interval(Duration::from_millis(25));

        let started = Instant::now();
        let result = solver
            .solve(&challenge(), Provider::TwoCaptcha, Duration::from_millis(300))
            .await;

        let err = result.unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn solve_returns_token_when_provider_resolves() {
        let app = Router::new()
            .route(
                "/createTask",
                post(|| async { Json(serde_json::json!({"errorId": 0, "taskId": 11})) }),
            )
            .route(
                "/getTaskResult",
                post(|| async {
                    Json(serde_json::json!({
                        "errorId": 0,
                        "status": "ready",
                        "solution": {"gRecaptchaResponse": "tok-42"}
                    }))
                }),
            );
        let base = spawn_stub(app).await;

        let solver = CaptchaSolverClient::new("key")
            .unwrap()
            .with_api_base(&base)
            .with_poll_interval(Duration::from_millis(10));

        let solution = solver
            .solve(&challenge(), Provider::AntiCaptcha, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(solution.token, "tok-42");
        assert_eq!(solution.provider, Provider::AntiCaptcha);
    }

    #[tokio::test]
    async fn provider_rejection_is_not_a_timeout() {
        let app = Router::new().route(
            "/createTask",
            post(|| async {
                Json(serde_json::json!({
                    "errorId": 1,
                    "errorCode": "ERROR_KEY_DOES_NOT_EXIST",
                    "errorDescription": "Account authorization key not found"
                }))
            }),
        );
        let base = spawn_stub(app).await;

        let solver = CaptchaSolverClient::new("bad-key")
            .unwrap()
            .with_api_base(&base)
            .with_poll_interval(Duration::from_millis(10));

        let err = solver
            .solve(&challenge(), Provider::TwoCaptcha, Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(!err.is_timeout());
        match err {
            CaptchaError::Provider { message, .. } => {
                assert!(message.contains("ERROR_KEY_DOES_NOT_EXIST"));
            }
            other => panic!("expected provider error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn poll_error_surfaces_as_provider_error() {
        let app = Router::new()
            .route(
                "/createTask",
                post(|| async { Json(serde_json::json!({"errorId": 0, "taskId": 3})) }),
            )
            .route(
                "/getTaskResult",
                post(|| async {
                    Json(serde_json::json!({
                        "errorId": 12,
                        "errorDescription": "ERROR_ZERO_BALANCE"
                    }))
                }),
            );
        let base = spawn_stub(app).await;

        let solver = CaptchaSolverClient::new("key")
            .unwrap()
            .with_api_base(&base)
            .with_poll_interval(Duration::from_millis(10));

        let err = solver
            .solve(&challenge(), Provider::TwoCaptcha, Duration::from_secs(5))
            .await
            .unwrap_err();

        match err {
            CaptchaError::Provider { message, .. } => assert!(message.contains("ZERO_BALANCE")),
            other => panic!("expected provider error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn balance_query_parses_amount() {
        let app = Router::new().route(
            "/getBalance",
            post(|| async { Json(serde_json::json!({"errorId": 0, "balance": 12.5})) }),
        );
        let base = spawn_stub(app).await;

        let solver = CaptchaSolverClient::new("key").unwrap().with_api_base(&base);
        let balance = solver.balance(Provider::TwoCaptcha).await.unwrap();
        assert!((balance - 12.5).abs() < f64::EPSILON);
    }
}

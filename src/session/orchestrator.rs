//! Orchestrator: proxy + profile assignment, navigation, CAPTCHA handling.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::captcha::{
    detect_challenge, looks_like_proxy_failure, CaptchaChallenge, CaptchaSolution,
    CaptchaSolverClient, ChallengeKind, Provider,
};
use crate::driver::{ContextSpec, Driver, DriverError, PageView};
use crate::fingerprint::{render_injection_payload, ProfileCatalog, ProfileConstraints};
use crate::proxy::ProxyPool;

use super::{Session, SessionError, SessionState};

/// Upper bound on releasing a driver context
const CLOSE_TIMEOUT: Duration = Duration::from_secs(15);

/// Orchestrator-level settings, fixed at construction.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub headless: bool,
    pub navigation_timeout: Duration,
    pub captcha_timeout: Duration,
    pub captcha_provider: Provider,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            headless: true,
            navigation_timeout: Duration::from_secs(30),
            captcha_timeout: Duration::from_secs(120),
            captcha_provider: Provider::TwoCaptcha,
        }
    }
}

impl From<&crate::Config> for OrchestratorConfig {
    fn from(config: &crate::Config) -> Self {
        Self {
            headless: config.headless,
            navigation_timeout: Duration::from_secs(config.navigation_timeout_secs),
            captcha_timeout: Duration::from_secs(config.captcha_timeout_secs),
            captcha_provider: config.captcha_provider,
        }
    }
}

/// Composes the proxy pool, profile catalog, solver client and driver into
/// the per-session lifecycle: open, navigate (with inline CAPTCHA solving),
/// close. One orchestrator serves any number of concurrent session tasks;
/// it holds no per-session state of its own.
pub struct SessionOrchestrator<D: Driver> {
    driver: D,
    proxies: Arc<ProxyPool>,
    profiles: Arc<ProfileCatalog>,
    solver: Arc<CaptchaSolverClient>,
    config: OrchestratorConfig,
}

impl<D: Driver> SessionOrchestrator<D> {
    pub fn new(
        driver: D,
        proxies: Arc<ProxyPool>,
        profiles: Arc<ProfileCatalog>,
        solver: Arc<CaptchaSolverClient>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            driver,
            proxies,
            profiles,
            solver,
            config,
        }
    }

    /// Shared proxy pool, for observability and dynamic edits.
    pub fn proxies(&self) -> &Arc<ProxyPool> {
        &self.proxies
    }

    /// Open a session with any profile from the catalog.
    pub async fn open_session(&self) -> Result<Session<D>, SessionError> {
        self.open_session_with(None).await
    }

    /// Open a session with a profile matching the given constraints.
    ///
    /// Acquires a proxy, selects a profile, launches a browser context bound
    /// to both, and installs the fingerprint payload so it runs before any
    /// page script. A context-launch failure is reported against the proxy
    /// and acquisition is retried once with another endpoint before the open
    /// fails.
    pub async fn open_session_with(
        &self,
        constraints: Option<&ProfileConstraints>,
    ) -> Result<Session<D>, SessionError> {
        let session_id = format!("session-{}", &Uuid::new_v4().to_string()[..8]);
        let profile = self.profiles.select(constraints)?;
        let payload = render_injection_payload(&profile);

        let mut proxy = self.proxies.acquire()?;
        info!(
            session = %session_id,
            proxy = %proxy,
            profile = %profile.id,
            "opening session"
        );

        let spec = ContextSpec::for_profile(&profile, Some(proxy.clone()), self.config.headless);
        let context = match self.driver.launch_context(&spec).await {
            Ok(context) => context,
            Err(first) => {
                warn!(session = %session_id, proxy = %proxy, error = %first, "context launch failed, retrying with another proxy");
                self.proxies.report_outcome(&proxy, false);

                proxy = self.proxies.acquire()?;
                let spec =
                    ContextSpec::for_profile(&profile, Some(proxy.clone()), self.config.headless);
                match self.driver.launch_context(&spec).await {
                    Ok(context) => context,
                    Err(second) => {
                        warn!(session = %session_id, proxy = %proxy, error = %second, "context launch failed again, giving up");
                        self.proxies.report_outcome(&proxy, false);
                        return Err(SessionError::Open { source: second });
                    }
                }
            }
        };

        let page = match self.driver.new_page(&context).await {
            Ok(page) => page,
            Err(e) => {
                let _ = self.driver.close_context(context).await;
                return Err(SessionError::Open { source: e });
            }
        };

        if let Err(e) = self.driver.install_script(&page, &payload).await {
            let _ = self.driver.close_context(context).await;
            return Err(SessionError::Open { source: e });
        }

        let session = Session::new(session_id, proxy, profile, context, page);
        session.transition(SessionState::Ready);
        info!(session = %session.id(), "session ready");
        Ok(session)
    }

    /// Navigate the session to a URL.
    ///
    /// The outcome feeds proxy health: success and proxy-attributable
    /// failures are reported, page-level failures are not. A CAPTCHA gate on
    /// the landed page is solved inline (one retry with the same provider),
    /// the token injected, and the navigation re-submitted before this
    /// returns.
    pub async fn navigate(
        &self,
        session: &mut Session<D>,
        url: &str,
    ) -> Result<PageView, SessionError> {
        session.try_begin_navigation()?;

        let view = match self.goto_with_timeout(session, url).await {
            Ok(view) => view,
            Err(e) => {
                return Err(self.fail_navigation(session, SessionState::Navigating, e));
            }
        };

        // A successful load can still be a proxy error page.
        if looks_like_proxy_failure(&view.content) {
            let e = DriverError::ConnectionFailed(format!("proxy error page at {}", view.url));
            return Err(self.fail_navigation(session, SessionState::Navigating, e));
        }

        self.proxies.report_outcome(session.proxy(), true);

        match detect_challenge(&view.content, &view.url) {
            None => {
                session.transition(SessionState::Ready);
                Ok(view)
            }
            Some(challenge) => self.handle_challenge(session, url, challenge).await,
        }
    }

    /// Solve a detected CAPTCHA gate and re-submit the navigation.
    async fn handle_challenge(
        &self,
        session: &mut Session<D>,
        url: &str,
        challenge: CaptchaChallenge,
    ) -> Result<PageView, SessionError> {
        session.transition(SessionState::SolvingCaptcha);
        info!(
            session = %session.id(),
            kind = ?challenge.kind,
            page = %challenge.page_url,
            "CAPTCHA gate detected"
        );

        let provider = self.config.captcha_provider;
        let solution = match self.solve_once(session, &challenge, provider).await {
            Ok(solution) => solution,
            Err(closed @ SessionError::Closed { .. }) => return Err(closed),
            Err(first) => {
                warn!(session = %session.id(), error = %first, "solve attempt failed, retrying once");
                match self.solve_once(session, &challenge, provider).await {
                    Ok(solution) => solution,
                    Err(closed @ SessionError::Closed { .. }) => return Err(closed),
                    Err(second) => {
                        session.transition(SessionState::Failed);
                        return Err(second);
                    }
                }
            }
        };

        let inject = inject_solution_script(&challenge, &solution);
        if let Some(page) = session.page() {
            if let Err(e) = self.driver.eval(page, &inject).await {
                session.transition(SessionState::Failed);
                return Err(SessionError::Navigation {
                    session_id: session.id().to_string(),
                    state: SessionState::SolvingCaptcha,
                    source: e,
                });
            }
        } else {
            return Err(SessionError::Closed {
                session_id: session.id().to_string(),
            });
        }

        // Re-submit and make sure the gate is actually gone.
        let view = match self.goto_with_timeout(session, url).await {
            Ok(view) => view,
            Err(e) => {
                return Err(self.fail_navigation(session, SessionState::SolvingCaptcha, e));
            }
        };

        if detect_challenge(&view.content, &view.url).is_some() {
            warn!(session = %session.id(), "CAPTCHA still present after token injection");
            session.transition(SessionState::Failed);
            return Err(SessionError::SolutionRejected {
                session_id: session.id().to_string(),
            });
        }

        session.transition(SessionState::Ready);
        info!(session = %session.id(), "CAPTCHA cleared");
        Ok(view)
    }

    /// One solve attempt, aborted early if the session is closed while the
    /// provider is working. Closing wins immediately; the provider task is
    /// simply abandoned.
    async fn solve_once(
        &self,
        session: &Session<D>,
        challenge: &CaptchaChallenge,
        provider: Provider,
    ) -> Result<CaptchaSolution, SessionError> {
        tokio::select! {
            _ = session.wait_closed() => Err(SessionError::Closed {
                session_id: session.id().to_string(),
            }),
            result = self.solver.solve(challenge, provider, self.config.captcha_timeout) => {
                result.map_err(|e| SessionError::Captcha {
                    session_id: session.id().to_string(),
                    state: SessionState::SolvingCaptcha,
                    source: e,
                })
            }
        }
    }

    async fn goto_with_timeout(
        &self,
        session: &Session<D>,
        url: &str,
    ) -> Result<PageView, DriverError> {
        let page = session
            .page()
            .ok_or_else(|| DriverError::ConnectionLost("no active page".to_string()))?;

        tokio::time::timeout(self.config.navigation_timeout, self.driver.goto(page, url))
            .await
            .map_err(|_| DriverError::Timeout(format!("navigation to {} timed out", url)))?
    }

    /// Classify a navigation failure, feed proxy health, settle session state.
    ///
    /// Proxy-attributable failures poison the session (Failed); page-level
    /// failures leave it Ready so the caller can navigate elsewhere.
    fn fail_navigation(
        &self,
        session: &Session<D>,
        state: SessionState,
        source: DriverError,
    ) -> SessionError {
        if source.is_proxy_attributable() {
            self.proxies.report_outcome(session.proxy(), false);
            session.transition(SessionState::Failed);
        } else {
            session.transition(SessionState::Ready);
        }
        SessionError::Navigation {
            session_id: session.id().to_string(),
            state,
            source,
        }
    }

    /// Capture a screenshot of the session's page.
    pub async fn screenshot(&self, session: &Session<D>) -> Result<Vec<u8>, SessionError> {
        let page = session.page().ok_or_else(|| SessionError::Closed {
            session_id: session.id().to_string(),
        })?;
        self.driver.screenshot(page).await.map_err(|e| SessionError::Navigation {
            session_id: session.id().to_string(),
            state: session.state(),
            source: e,
        })
    }

    /// Close the session and release its browser context.
    ///
    /// Safe to call from any state, including after a failed navigate; the
    /// context release is bounded and close problems are logged rather than
    /// surfaced, since the session is gone either way.
    pub async fn close_session(&self, session: &mut Session<D>) {
        session.mark_closed();

        if let Some(context) = session.take_context() {
            match tokio::time::timeout(CLOSE_TIMEOUT, self.driver.close_context(context)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(session = %session.id(), error = %e, "context close failed"),
                Err(_) => warn!(session = %session.id(), "context close timed out"),
            }
        }

        info!(session = %session.id(), "session closed");
    }
}

/// Script that hands a provider token to the page.
///
/// Widget CAPTCHAs expect the token in their hidden response textarea before
/// the form is re-submitted; image CAPTCHAs get the text into the visible
/// input.
fn inject_solution_script(challenge: &CaptchaChallenge, solution: &CaptchaSolution) -> String {
    let token = serde_json::to_string(&solution.token).unwrap_or_else(|_| "\"\"".to_string());

    let field = match challenge.kind {
        ChallengeKind::Recaptcha => "g-recaptcha-response",
        ChallengeKind::HCaptcha => "h-captcha-response",
        ChallengeKind::Image => {
            return format!(
                "(() => {{\n\
                 const input = document.querySelector('input[name=\"captcha\"], #captcha');\n\
                 if (input) {{ input.value = {token}; }}\n\
                 }})();"
            );
        }
    };

    format!(
        "(() => {{\n\
         const field = document.querySelector('textarea[name=\"{field}\"], #{field}');\n\
         if (field) {{\n\
             field.style.display = 'block';\n\
             field.value = {token};\n\
             field.dispatchEvent(new Event('change', {{ bubbles: true }}));\n\
         }}\n\
         }})();"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use async_trait::async_trait;
    use axum::routing::post;
    use axum::{Json, Router};
    use parking_lot::Mutex;

    use crate::proxy::{ProxyEndpoint, ProxyError, ProxyHealth};

    const CLEAN_PAGE: &str = "<html><body><h1>Welcome</h1></body></html>";
    const CAPTCHA_PAGE: &str =
        r#"<html><div class="g-recaptcha" data-sitekey="stub-site-key"></div></html>"#;

    #[derive(Default)]
    struct StubInner {
        launch_failures: AtomicUsize,
        launched: AtomicUsize,
        closed: AtomicUsize,
        goto_queue: Mutex<VecDeque<Result<String, DriverError>>>,
        installed: Mutex<Vec<String>>,
        evaluated: Mutex<Vec<String>>,
    }

    #[derive(Clone, Default)]
    struct StubDriver {
        inner: Arc<StubInner>,
    }

    impl StubDriver {
        fn failing_launches(self, count: usize) -> Self {
            self.inner.launch_failures.store(count, Ordering::SeqCst);
            self
        }

        fn queue_goto(&self, result: Result<&str, DriverError>) {
            self.inner
                .goto_queue
                .lock()
                .push_back(result.map(|s| s.to_string()));
        }
    }

    struct StubContext;
    struct StubPage;

    #[async_trait]
    impl Driver for StubDriver {
        type Context = StubContext;
        type Page = StubPage;

        async fn launch_context(&self, _spec: &ContextSpec) -> Result<StubContext, DriverError> {
            self.inner.launched.fetch_add(1, Ordering::SeqCst);
            let remaining = self.inner.launch_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.inner.launch_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(DriverError::ConnectionFailed(
                    "stub: tunnel to proxy failed".to_string(),
                ));
            }
            Ok(StubContext)
        }

        async fn new_page(&self, _context: &StubContext) -> Result<StubPage, DriverError> {
            Ok(StubPage)
        }

        async fn install_script(&self, _page: &StubPage, script: &str) -> Result<(), DriverError> {
            self.inner.installed.lock().push(script.to_string());
            Ok(())
        }

        async fn goto(&self, _page: &StubPage, url: &str) -> Result<PageView, DriverError> {
            let next = self.inner.goto_queue.lock().pop_front();
            match next {
                Some(Ok(content)) => Ok(PageView {
                    url: url.to_string(),
                    content,
                }),
                Some(Err(e)) => Err(e),
                None => Ok(PageView {
                    url: url.to_string(),
                    content: CLEAN_PAGE.to_string(),
                }),
            }
        }

        async fn eval(
            &self,
            _page: &StubPage,
            script: &str,
        ) -> Result<serde_json::Value, DriverError> {
            self.inner.evaluated.lock().push(script.to_string());
            Ok(serde_json::Value::Null)
        }

        async fn screenshot(&self, _page: &StubPage) -> Result<Vec<u8>, DriverError> {
            Ok(vec![1, 2, 3])
        }

        async fn close_context(&self, _context: StubContext) -> Result<(), DriverError> {
            self.inner.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn spawn_stub(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /// Provider stub that solves every task with the given token.
    fn solving_provider(token: &'static str) -> Router {
        Router::new()
            .route(
                "/createTask",
                post(|| async { Json(serde_json::json!({"errorId": 0, "taskId": 1})) }),
            )
            .route(
                "/getTaskResult",
                post(move || async move {
                    Json(serde_json::json!({
                        "errorId": 0,
                        "status": "ready",
                        "solution": {"gRecaptchaResponse": token}
                    }))
                }),
            )
    }

    /// Provider stub that never resolves.
    fn stalling_provider() -> Router {
        Router::new()
            .route(
                "/createTask",
                post(|| async { Json(serde_json::json!({"errorId": 0, "taskId": 2})) }),
            )
            .route(
                "/getTaskResult",
                post(|| async { Json(serde_json::json!({"errorId": 0, "status": "processing"})) }),
            )
    }

    /// Provider stub that rejects task creation, counting attempts.
    fn rejecting_provider(hits: Arc<AtomicUsize>) -> Router {
        Router::new().route(
            "/createTask",
            post(move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({
                        "errorId": 1,
                        "errorCode": "ERROR_NO_SLOT_AVAILABLE",
                        "errorDescription": "no workers available"
                    }))
                }
            }),
        )
    }

    fn pool(urls: &[&str]) -> Arc<ProxyPool> {
        Arc::new(ProxyPool::from_urls(urls, 3).unwrap())
    }

    fn solver(api_base: Option<&str>) -> Arc<CaptchaSolverClient> {
        let mut client = CaptchaSolverClient::new("test-api-key")
            .unwrap()
            .with_poll_interval(Duration::from_millis(10));
        if let Some(base) = api_base {
            client = client.with_api_base(base);
        }
        Arc::new(client)
    }

    fn orchestrator(
        driver: StubDriver,
        proxies: Arc<ProxyPool>,
        solver: Arc<CaptchaSolverClient>,
        captcha_timeout: Duration,
    ) -> SessionOrchestrator<StubDriver> {
        SessionOrchestrator::new(
            driver,
            proxies,
            Arc::new(ProfileCatalog::builtin()),
            solver,
            OrchestratorConfig {
                headless: true,
                navigation_timeout: Duration::from_secs(5),
                captcha_timeout,
                captcha_provider: Provider::TwoCaptcha,
            },
        )
    }

    fn health_of(pool: &ProxyPool, endpoint: &ProxyEndpoint) -> (ProxyHealth, u32) {
        pool.snapshot()
            .into_iter()
            .find(|s| s.endpoint == *endpoint)
            .map(|s| (s.health, s.consecutive_failures))
            .unwrap()
    }

    #[tokio::test]
    async fn open_session_installs_payload_and_becomes_ready() {
        let driver = StubDriver::default();
        let orch = orchestrator(driver.clone(), pool(&["http://a:8080"]), solver(None), Duration::from_secs(1));

        let session = orch.open_session().await.unwrap();

        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(driver.inner.launched.load(Ordering::SeqCst), 1);
        let installed = driver.inner.installed.lock();
        assert_eq!(installed.len(), 1);
        assert!(installed[0].contains("'webdriver'"));
    }

    #[tokio::test]
    async fn open_session_retries_once_with_alternate_proxy() {
        let driver = StubDriver::default().failing_launches(1);
        let proxies = pool(&["http://a:8080", "http://b:8080"]);
        let orch = orchestrator(driver.clone(), proxies.clone(), solver(None), Duration::from_secs(1));

        let session = orch.open_session().await.unwrap();

        assert_eq!(session.proxy().address, "b:8080");
        assert_eq!(driver.inner.launched.load(Ordering::SeqCst), 2);

        let a = ProxyEndpoint::parse("http://a:8080").unwrap();
        assert_eq!(health_of(&proxies, &a), (ProxyHealth::Degraded, 1));
    }

    #[tokio::test]
    async fn open_session_gives_up_after_second_launch_failure() {
        let driver = StubDriver::default().failing_launches(2);
        let proxies = pool(&["http://a:8080", "http://b:8080"]);
        let orch = orchestrator(driver.clone(), proxies.clone(), solver(None), Duration::from_secs(1));

        let err = orch.open_session().await.unwrap_err();
        assert!(matches!(err, SessionError::Open { .. }));

        let b = ProxyEndpoint::parse("http://b:8080").unwrap();
        assert_eq!(health_of(&proxies, &b), (ProxyHealth::Degraded, 1));
    }

    #[tokio::test]
    async fn open_session_fails_on_exhausted_pool() {
        let orch = orchestrator(
            StubDriver::default(),
            pool(&[]),
            solver(None),
            Duration::from_secs(1),
        );
        let err = orch.open_session().await.unwrap_err();
        assert!(matches!(err, SessionError::Proxy(ProxyError::PoolExhausted)));
    }

    #[tokio::test]
    async fn successful_navigation_reports_proxy_success() {
        let driver = StubDriver::default();
        let proxies = pool(&["http://a:8080"]);
        let orch = orchestrator(driver, proxies.clone(), solver(None), Duration::from_secs(1));

        let mut session = orch.open_session().await.unwrap();
        let view = orch.navigate(&mut session, "https://example.com").await.unwrap();

        assert_eq!(view.content, CLEAN_PAGE);
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(health_of(&proxies, session.proxy()), (ProxyHealth::Healthy, 0));
    }

    #[tokio::test]
    async fn proxy_attributable_failure_feeds_health_and_fails_session() {
        let driver = StubDriver::default();
        let proxies = pool(&["http://a:8080"]);
        let orch = orchestrator(driver.clone(), proxies.clone(), solver(None), Duration::from_secs(1));

        let mut session = orch.open_session().await.unwrap();
        driver.queue_goto(Err(DriverError::ConnectionFailed(
            "net::ERR_TUNNEL_CONNECTION_FAILED".to_string(),
        )));

        let err = orch.navigate(&mut session, "https://example.com").await.unwrap_err();
        assert!(matches!(err, SessionError::Navigation { .. }));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(health_of(&proxies, session.proxy()), (ProxyHealth::Degraded, 1));
    }

    #[tokio::test]
    async fn page_level_failure_leaves_session_ready_and_proxy_untouched() {
        let driver = StubDriver::default();
        let proxies = pool(&["http://a:8080"]);
        let orch = orchestrator(driver.clone(), proxies.clone(), solver(None), Duration::from_secs(1));

        let mut session = orch.open_session().await.unwrap();
        driver.queue_goto(Err(DriverError::NavigationFailed(
            "net::ERR_NAME_NOT_RESOLVED".to_string(),
        )));

        let err = orch.navigate(&mut session, "https://nxdomain.example").await.unwrap_err();
        assert!(matches!(err, SessionError::Navigation { .. }));
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(health_of(&proxies, session.proxy()), (ProxyHealth::Untested, 0));
    }

    #[tokio::test]
    async fn proxy_error_page_counts_as_proxy_failure() {
        let driver = StubDriver::default();
        let proxies = pool(&["http://a:8080"]);
        let orch = orchestrator(driver.clone(), proxies.clone(), solver(None), Duration::from_secs(1));

        let mut session = orch.open_session().await.unwrap();
        driver.queue_goto(Ok(
            "<html><body>This site can't be reached ERR_PROXY_CONNECTION_FAILED</body></html>",
        ));

        let err = orch.navigate(&mut session, "https://example.com").await.unwrap_err();
        assert!(matches!(err, SessionError::Navigation { .. }));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(health_of(&proxies, session.proxy()), (ProxyHealth::Degraded, 1));
    }

    #[tokio::test]
    async fn captcha_gate_is_solved_and_navigation_resubmitted() {
        let base = spawn_stub(solving_provider("tok-99")).await;
        let driver = StubDriver::default();
        let proxies = pool(&["http://a:8080"]);
        let orch = orchestrator(
            driver.clone(),
            proxies.clone(),
            solver(Some(&base)),
            Duration::from_secs(5),
        );

        let mut session = orch.open_session().await.unwrap();
        driver.queue_goto(Ok(CAPTCHA_PAGE));
        driver.queue_goto(Ok(CLEAN_PAGE));

        let view = orch.navigate(&mut session, "https://example.com/login").await.unwrap();

        assert_eq!(view.content, CLEAN_PAGE);
        assert_eq!(session.state(), SessionState::Ready);

        let evaluated = driver.inner.evaluated.lock();
        assert_eq!(evaluated.len(), 1);
        assert!(evaluated[0].contains("tok-99"));
        assert!(evaluated[0].contains("g-recaptcha-response"));
    }

    #[tokio::test]
    async fn solver_rejection_retries_once_then_fails_session() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = spawn_stub(rejecting_provider(hits.clone())).await;
        let driver = StubDriver::default();
        let orch = orchestrator(
            driver.clone(),
            pool(&["http://a:8080"]),
            solver(Some(&base)),
            Duration::from_secs(5),
        );

        let mut session = orch.open_session().await.unwrap();
        driver.queue_goto(Ok(CAPTCHA_PAGE));

        let err = orch.navigate(&mut session, "https://example.com").await.unwrap_err();
        match err {
            SessionError::Captcha { source, .. } => assert!(!source.is_timeout()),
            other => panic!("expected captcha error, got {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(hits.load(Ordering::SeqCst), 2, "exactly one retry");
    }

    #[tokio::test]
    async fn rejected_token_fails_the_session() {
        let base = spawn_stub(solving_provider("tok-1")).await;
        let driver = StubDriver::default();
        let orch = orchestrator(
            driver.clone(),
            pool(&["http://a:8080"]),
            solver(Some(&base)),
            Duration::from_secs(5),
        );

        let mut session = orch.open_session().await.unwrap();
        driver.queue_goto(Ok(CAPTCHA_PAGE));
        driver.queue_goto(Ok(CAPTCHA_PAGE));

        let err = orch.navigate(&mut session, "https://example.com").await.unwrap_err();
        assert!(matches!(err, SessionError::SolutionRejected { .. }));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn closing_mid_solve_reaches_closed_without_waiting() {
        let base = spawn_stub(stalling_provider()).await;
        let driver = StubDriver::default();
        // Long solve deadline: only cancellation can end this quickly.
        let orch = Arc::new(orchestrator(
            driver.clone(),
            pool(&["http://a:8080"]),
            solver(Some(&base)),
            Duration::from_secs(60),
        ));

        let mut session = orch.open_session().await.unwrap();
        driver.queue_goto(Ok(CAPTCHA_PAGE));
        let handle = session.cancel_handle();

        let orch_task = orch.clone();
        let task = tokio::spawn(async move {
            let result = orch_task.navigate(&mut session, "https://example.com").await;
            (result, session)
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        handle.close();

        let (result, mut session) = task.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(result, Err(SessionError::Closed { .. })));
        assert_eq!(session.state(), SessionState::Closed);

        // Driver resources are still released by the normal close path.
        orch.close_session(&mut session).await;
        assert_eq!(driver.inner.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_session_releases_context_even_after_failed_navigation() {
        let driver = StubDriver::default();
        let orch = orchestrator(driver.clone(), pool(&["http://a:8080"]), solver(None), Duration::from_secs(1));

        let mut session = orch.open_session().await.unwrap();
        driver.queue_goto(Err(DriverError::NavigationFailed("boom".to_string())));
        let _ = orch.navigate(&mut session, "https://example.com").await;

        orch.close_session(&mut session).await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(driver.inner.closed.load(Ordering::SeqCst), 1);

        let err = orch.navigate(&mut session, "https://example.com").await.unwrap_err();
        assert!(matches!(err, SessionError::Closed { .. }));
    }

    #[tokio::test]
    async fn screenshot_passes_driver_bytes_through() {
        let driver = StubDriver::default();
        let orch = orchestrator(driver, pool(&["http://a:8080"]), solver(None), Duration::from_secs(1));

        let session = orch.open_session().await.unwrap();
        let bytes = orch.screenshot(&session).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[test]
    fn solution_script_targets_the_right_field() {
        let challenge = CaptchaChallenge::recaptcha("key", "https://example.com");
        let solution = CaptchaSolution {
            token: "tok\"quoted".to_string(),
            solved_at: chrono::Utc::now(),
            provider: Provider::TwoCaptcha,
        };
        let script = inject_solution_script(&challenge, &solution);
        assert!(script.contains("g-recaptcha-response"));
        assert!(script.contains("tok\\\"quoted"), "token must be JS-escaped");

        let challenge = CaptchaChallenge::hcaptcha("key", "https://example.com");
        let script = inject_solution_script(&challenge, &solution);
        assert!(script.contains("h-captcha-response"));
    }
}

//! CAPTCHA solving subsystem.
//!
//! Detects challenges in page content, and delegates solving to an external
//! provider (2Captcha or Anti-Captcha) over their shared createTask/
//! getTaskResult JSON protocol. Each solve is submit-then-poll with a hard
//! deadline; provider failures and timeouts are distinct error kinds so the
//! caller can pick a recovery strategy.

mod detect;
mod solver;
mod types;

pub use detect::{detect_challenge, extract_site_key, looks_like_proxy_failure};
pub use solver::CaptchaSolverClient;
pub use types::{
    CaptchaChallenge, CaptchaError, CaptchaSolution, ChallengeKind, Provider,
};

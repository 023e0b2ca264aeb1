//! Session orchestration.
//!
//! A session is one browser context bound to one proxy and one fingerprint
//! profile for its whole lifetime. The orchestrator owns the policy around
//! it: which proxy and profile a new session gets, how navigation outcomes
//! feed proxy health, and how a CAPTCHA gate is solved inline before a
//! navigation is considered complete.

mod errors;
mod orchestrator;
mod session;

pub use errors::SessionError;
pub use orchestrator::{OrchestratorConfig, SessionOrchestrator};
pub use session::{Session, SessionCancelHandle, SessionState};

//! Session-level error types.
//!
//! Errors carry the session id and the state the failure happened in, so a
//! caller holding many sessions can decide which one to rebuild without
//! cross-referencing logs.

use thiserror::Error;

use crate::captcha::CaptchaError;
use crate::driver::DriverError;
use crate::fingerprint::FingerprintError;
use crate::proxy::ProxyError;

use super::SessionState;

/// Errors surfaced by the session orchestrator
#[derive(Error, Debug)]
pub enum SessionError {
    /// No usable proxy endpoint. Fatal for the open that hit it, not for
    /// the pool itself.
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    /// The driver could not create a context, even after one retry with an
    /// alternate proxy.
    #[error("failed to open session: {source}")]
    Open {
        #[source]
        source: DriverError,
    },

    #[error("session {session_id} navigation failed in state {state:?}: {source}")]
    Navigation {
        session_id: String,
        state: SessionState,
        #[source]
        source: DriverError,
    },

    #[error("session {session_id} CAPTCHA handling failed in state {state:?}: {source}")]
    Captcha {
        session_id: String,
        state: SessionState,
        #[source]
        source: CaptchaError,
    },

    /// The page still shows a CAPTCHA gate after the solution token was
    /// injected and the navigation re-submitted.
    #[error("session {session_id}: CAPTCHA token was rejected by the page")]
    SolutionRejected { session_id: String },

    /// A second request raced an operation already running on this session,
    /// or the session is not in a state that accepts new operations.
    #[error("session {session_id} cannot start a new operation in state {state:?}")]
    Busy {
        session_id: String,
        state: SessionState,
    },

    #[error("session {session_id} is closed")]
    Closed { session_id: String },
}

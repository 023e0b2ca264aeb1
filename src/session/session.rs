//! Session state machine and cancellation.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::driver::Driver;
use crate::fingerprint::FingerprintProfile;
use crate::proxy::ProxyEndpoint;

use super::SessionError;

/// Lifecycle states of a session.
///
/// `Closed` is terminal. `Navigating` and `SolvingCaptcha` are busy states:
/// a second request against the session is rejected while one is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Ready,
    Navigating,
    SolvingCaptcha,
    Closed,
    Failed,
}

/// State shared between a session and its cancel handles.
struct Shared {
    state: Mutex<SessionState>,
    closed_tx: watch::Sender<bool>,
}

/// One browser context bound to one proxy and one fingerprint profile.
///
/// Exclusively owned by the task driving it; the driver context handle is
/// held here and released through the orchestrator's close path. Cheap
/// cross-task interaction goes through [`SessionCancelHandle`].
pub struct Session<D: Driver> {
    id: String,
    proxy: ProxyEndpoint,
    profile: FingerprintProfile,
    context: Option<D::Context>,
    page: Option<D::Page>,
    shared: Arc<Shared>,
}

impl<D: Driver> Session<D> {
    pub(crate) fn new(
        id: String,
        proxy: ProxyEndpoint,
        profile: FingerprintProfile,
        context: D::Context,
        page: D::Page,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            id,
            proxy,
            profile,
            context: Some(context),
            page: Some(page),
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::Initializing),
                closed_tx,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The proxy this session is bound to for its lifetime.
    pub fn proxy(&self) -> &ProxyEndpoint {
        &self.proxy
    }

    /// The fingerprint profile this session presents.
    pub fn profile(&self) -> &FingerprintProfile {
        &self.profile
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed_tx.borrow()
    }

    /// A cloneable handle that can close this session from another task.
    pub fn cancel_handle(&self) -> SessionCancelHandle {
        SessionCancelHandle {
            id: self.id.clone(),
            shared: self.shared.clone(),
        }
    }

    pub(crate) fn page(&self) -> Option<&D::Page> {
        self.page.as_ref()
    }

    pub(crate) fn take_context(&mut self) -> Option<D::Context> {
        self.page = None;
        self.context.take()
    }

    /// Move to a new state. Once the close flag is set, only `Closed` is
    /// accepted, so a concurrent close cannot be overwritten by an in-flight
    /// operation finishing late.
    pub(crate) fn transition(&self, to: SessionState) {
        let mut state = self.shared.state.lock();
        if *self.shared.closed_tx.borrow() && to != SessionState::Closed {
            debug!(session = %self.id, ?to, "transition ignored, session closing");
            return;
        }
        debug!(session = %self.id, from = ?*state, ?to, "session state change");
        *state = to;
    }

    /// Ready -> Navigating, rejecting anything else.
    pub(crate) fn try_begin_navigation(&self) -> Result<(), SessionError> {
        let mut state = self.shared.state.lock();
        match *state {
            SessionState::Ready => {
                *state = SessionState::Navigating;
                Ok(())
            }
            SessionState::Closed => Err(SessionError::Closed {
                session_id: self.id.clone(),
            }),
            other => Err(SessionError::Busy {
                session_id: self.id.clone(),
                state: other,
            }),
        }
    }

    /// Flag the session closed and move the state machine to `Closed`.
    pub(crate) fn mark_closed(&self) {
        *self.shared.state.lock() = SessionState::Closed;
        // send_replace stores the flag even with no subscribed waiters
        let _ = self.shared.closed_tx.send_replace(true);
    }

    /// Resolve when the session is closed from anywhere.
    pub(crate) async fn wait_closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Cloneable handle for closing a session from outside the driving task.
///
/// Closing flips the session to `Closed` immediately and wakes any operation
/// suspended on external work (a CAPTCHA solve in flight, most importantly).
/// Driver resources are released by the orchestrator's close path afterwards.
#[derive(Clone)]
pub struct SessionCancelHandle {
    id: String,
    shared: Arc<Shared>,
}

impl SessionCancelHandle {
    pub fn close(&self) {
        info!(session = %self.id, "session close requested");
        *self.shared.state.lock() = SessionState::Closed;
        let _ = self.shared.closed_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed_tx.borrow()
    }

    pub fn session_id(&self) -> &str {
        &self.id
    }
}

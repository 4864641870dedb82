//! ForwardInputUseCase: sends locally captured input to the focused client.
//!
//! The server captures keyboard and mouse input through the platform
//! [`InputCapture`] collaborator and pushes every event onto the outbound
//! queue of exactly one session, the *focus target*:
//!
//! - the session chosen with [`InputForwarder::set_focus`], while it is alive;
//! - otherwise the most recently established session.
//!
//! Pushing respects the queue's drop policy: pointer moves may be coalesced,
//! and a key or click waits for space rather than being dropped.

use std::sync::{Arc, Mutex, PoisonError};

use kvm_core::input::{InputCapture, PushError, PushOutcome};
use kvm_core::{InputEvent, SessionError, SessionId};
use tracing::{debug, info, trace};

use crate::application::manage_sessions::SessionManager;

pub struct InputForwarder {
    manager: Arc<SessionManager>,
    focus: Mutex<Option<SessionId>>,
}

impl InputForwarder {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            focus: Mutex::new(None),
        }
    }

    /// Pins forwarding to one session, or clears the pin with `None`.
    ///
    /// # Errors
    ///
    /// [`SessionError::SessionNotFound`] if `session_id` is not live.
    pub fn set_focus(&self, session_id: Option<SessionId>) -> Result<(), SessionError> {
        if let Some(id) = session_id {
            if self.manager.lookup(id).is_none() {
                return Err(SessionError::SessionNotFound(id));
            }
        }
        *self.focus.lock().unwrap_or_else(PoisonError::into_inner) = session_id;
        Ok(())
    }

    /// The session that currently receives forwarded input.
    pub fn target(&self) -> Option<SessionId> {
        let pinned = *self.focus.lock().unwrap_or_else(PoisonError::into_inner);
        match pinned {
            Some(id) if self.manager.lookup(id).is_some() => Some(id),
            _ => self.manager.newest(),
        }
    }

    /// Forwards one event to `session_id`.
    ///
    /// # Errors
    ///
    /// [`SessionError::SessionNotFound`] if the session is gone or closing.
    pub async fn send_to(&self, session_id: SessionId, event: InputEvent) -> Result<PushOutcome, SessionError> {
        let control = self
            .manager
            .control(session_id)
            .ok_or(SessionError::SessionNotFound(session_id))?;
        control.outbound.push(event).await.map_err(|e| match e {
            PushError::Full(_) | PushError::Closed(_) => SessionError::SessionNotFound(session_id),
        })
    }

    /// Forwards one event to the focus target.
    ///
    /// Returns `Ok(None)` when no session is connected.
    ///
    /// # Errors
    ///
    /// [`SessionError::SessionNotFound`] if the target closed meanwhile.
    pub async fn forward(&self, event: InputEvent) -> Result<Option<PushOutcome>, SessionError> {
        match self.target() {
            Some(id) => self.send_to(id, event).await.map(Some),
            None => {
                trace!("no session to receive {event:?}");
                Ok(None)
            }
        }
    }

    /// Pumps `capture` until it stops. Returns the number of events queued.
    pub async fn run(&self, capture: &mut dyn InputCapture) -> u64 {
        let mut forwarded = 0u64;
        while let Some(event) = capture.next_captured_event().await {
            match self.forward(event).await {
                Ok(Some(_)) => forwarded += 1,
                Ok(None) => {}
                Err(e) => debug!("input not forwarded: {e}"),
            }
        }
        info!("input capture stopped after {forwarded} forwarded events");
        forwarded
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

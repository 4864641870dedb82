//! Input event routing for one session.
//!
//! Outbound, captured events go onto the session's [`InputQueue`] and the
//! session worker writes them to the link, where they receive their sequence
//! numbers. Inbound, the link has already discarded duplicates and stale
//! sequence numbers, so the router hands events to the [`InputInjector`] in
//! arrival order.
//!
//! Platform capture and injection are external collaborators; this module
//! only defines the seams.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{trace, warn};

use crate::input::queue::InputQueue;
use crate::protocol::{InputEvent, SessionId};

/// Injection into the local OS failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("input injection failed: {0}")]
pub struct InjectError(pub String);

/// Replays received events on the local machine.
pub trait InputInjector: Send + Sync {
    fn inject(&self, event: &InputEvent) -> Result<(), InjectError>;
}

/// Produces locally captured events.
#[async_trait]
pub trait InputCapture: Send {
    /// Next captured event, or `None` when capture has stopped.
    async fn next_captured_event(&mut self) -> Option<InputEvent>;
}

pub struct InputRouter {
    session_id: SessionId,
    outbound: Arc<InputQueue>,
    injector: Arc<dyn InputInjector>,
    delivered: u64,
    failed: u64,
}

impl InputRouter {
    pub fn new(session_id: SessionId, outbound: Arc<InputQueue>, injector: Arc<dyn InputInjector>) -> Self {
        Self {
            session_id,
            outbound,
            injector,
            delivered: 0,
            failed: 0,
        }
    }

    /// Next event to put on the wire. Cancel-safe.
    pub async fn next_outbound(&self) -> Option<InputEvent> {
        self.outbound.pop().await
    }

    pub fn outbound_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Hands a received event to the injector. A failed injection is logged
    /// and does not affect the session.
    pub fn deliver(&mut self, event: &InputEvent) {
        match self.injector.inject(event) {
            Ok(()) => {
                self.delivered += 1;
                trace!("session {}: injected {:?}", self.session_id, event);
            }
            Err(e) => {
                self.failed += 1;
                warn!("session {}: {e}", self.session_id);
            }
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Closes the outbound queue without flushing it.
    /// Returns the number of discarded events.
    pub fn shutdown(&self) -> usize {
        self.outbound.close()
    }
}

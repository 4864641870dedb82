//! Input injection adapters for the client.
//!
//! The client is the machine being *controlled*: every input event the
//! server forwards is handed to an [`InputInjector`], which replays it on the
//! local desktop. The OS backends (`SendInput`, XTest, CoreGraphics) are
//! external collaborators plugged in behind that trait.
//!
//! [`LoggingInjector`] is the default when no backend is attached: it counts
//! what arrived and writes it to the trace log, which is enough to watch a
//! session work end to end.

use std::sync::atomic::{AtomicU64, Ordering};

use kvm_core::input::{InjectError, InputInjector};
use kvm_core::InputEvent;
use tracing::trace;

pub mod mock;

/// Injector that only logs and counts received events.
#[derive(Debug, Default)]
pub struct LoggingInjector {
    keys: AtomicU64,
    pointer: AtomicU64,
}

impl LoggingInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keyboard events received so far.
    pub fn key_events(&self) -> u64 {
        self.keys.load(Ordering::Relaxed)
    }

    /// Pointer events (moves, buttons, wheel) received so far.
    pub fn pointer_events(&self) -> u64 {
        self.pointer.load(Ordering::Relaxed)
    }
}

impl InputInjector for LoggingInjector {
    fn inject(&self, event: &InputEvent) -> Result<(), InjectError> {
        let counter = match event {
            InputEvent::Keyboard(_) => &self.keys,
            InputEvent::Mouse(_) => &self.pointer,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        trace!("inject {event:?}");
        Ok(())
    }
}

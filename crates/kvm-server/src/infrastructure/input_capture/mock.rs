//! Recording injector for tests.
//!
//! Collects every event a session delivers so tests can assert on order and
//! content without a real OS injection backend.

use std::sync::{Mutex, PoisonError};

use kvm_core::input::{InjectError, InputInjector};
use kvm_core::InputEvent;

/// An [`InputInjector`] that stores events instead of injecting them.
#[derive(Debug, Default)]
pub struct RecordingInjector {
    events: Mutex<Vec<InputEvent>>,
}

impl RecordingInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events delivered so far, in delivery order.
    pub fn events(&self) -> Vec<InputEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl InputInjector for RecordingInjector {
    fn inject(&self, event: &InputEvent) -> Result<(), InjectError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_core::protocol::ModifierFlags;

    #[test]
    fn test_recording_injector_keeps_delivery_order() {
        // Arrange
        let injector = RecordingInjector::new();

        // Act
        injector.inject(&InputEvent::mouse_move(5, 5, 0)).unwrap();
        injector
            .inject(&InputEvent::key(4, true, ModifierFlags::default(), 1))
            .unwrap();

        // Assert
        let events = injector.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], InputEvent::mouse_move(5, 5, 0));
    }
}

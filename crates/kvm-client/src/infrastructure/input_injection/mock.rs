//! Recording injector for tests.
//!
//! Collects every event a session delivers, in order, so tests can assert on
//! exactly what the server forwarded. Setting `should_fail` makes every call
//! fail, which exercises the "log and keep the session" path.

use std::sync::{Mutex, PoisonError};

use kvm_core::input::{InjectError, InputInjector};
use kvm_core::InputEvent;

/// An [`InputInjector`] that stores events instead of injecting them.
#[derive(Debug, Default)]
pub struct RecordingInjector {
    events: Mutex<Vec<InputEvent>>,
    /// When `true`, every call returns an [`InjectError`] and records nothing.
    pub should_fail: bool,
}

impl RecordingInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            should_fail: true,
            ..Self::default()
        }
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
        if self.should_fail {
            return Err(InjectError("simulated platform failure".to_string()));
        }
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

    #[test]
    fn test_failing_injector_records_nothing() {
        // Arrange
        let injector = RecordingInjector::failing();

        // Act
        let result = injector.inject(&InputEvent::mouse_move(1, 1, 0));

        // Assert
        assert!(result.is_err());
        assert!(injector.events().is_empty());
    }
}

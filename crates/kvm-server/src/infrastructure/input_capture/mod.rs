//! Input capture adapters for the server.
//!
//! Platform hooks (low-level keyboard/mouse hooks, evdev readers, event taps)
//! are external collaborators. They feed the session layer through the
//! [`InputCapture`] trait; [`ChannelInputCapture`] is the adapter they plug
//! into: a hook thread holds the sending half of a channel and the forwarding
//! task reads the receiving half.
//!
//! # Testability
//!
//! Tests drive the same channel by hand, and [`mock::RecordingInjector`]
//! records what a session delivered instead of touching the OS.

use async_trait::async_trait;
use kvm_core::input::{InjectError, InputCapture, InputInjector};
use kvm_core::InputEvent;
use tokio::sync::mpsc;
use tracing::debug;

pub mod mock;

/// [`InputCapture`] backed by a bounded channel.
pub struct ChannelInputCapture {
    events: mpsc::Receiver<InputEvent>,
}

impl ChannelInputCapture {
    /// Returns the sender for the capture source and the capture itself.
    pub fn new(buffer: usize) -> (mpsc::Sender<InputEvent>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self { events: rx })
    }
}

#[async_trait]
impl InputCapture for ChannelInputCapture {
    async fn next_captured_event(&mut self) -> Option<InputEvent> {
        self.events.recv().await
    }
}

/// Injector for input arriving *at* the server.
///
/// The server is the input source; events a client sends back are only
/// logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyInjector;

impl InputInjector for LogOnlyInjector {
    fn inject(&self, event: &InputEvent) -> Result<(), InjectError> {
        debug!("client input ignored: {event:?}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_core::protocol::ModifierFlags;

    #[tokio::test]
    async fn test_channel_capture_yields_events_in_order() {
        // Arrange
        let (tx, mut capture) = ChannelInputCapture::new(4);

        // Act
        tx.send(InputEvent::mouse_move(1, 2, 0)).await.unwrap();
        tx.send(InputEvent::key(4, true, ModifierFlags::default(), 1))
            .await
            .unwrap();

        // Assert
        assert_eq!(capture.next_captured_event().await, Some(InputEvent::mouse_move(1, 2, 0)));
        assert!(matches!(
            capture.next_captured_event().await,
            Some(InputEvent::Keyboard(_))
        ));
    }

    #[tokio::test]
    async fn test_channel_capture_ends_when_sender_dropped() {
        let (tx, mut capture) = ChannelInputCapture::new(1);
        drop(tx);
        assert_eq!(capture.next_captured_event().await, None);
    }

    #[test]
    fn test_log_only_injector_accepts_everything() {
        let injector = LogOnlyInjector;
        assert!(injector.inject(&InputEvent::mouse_move(0, 0, 0)).is_ok());
    }
}

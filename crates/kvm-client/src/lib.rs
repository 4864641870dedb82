//! kvm-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does kvm-client do? (for beginners)
//!
//! The *client* is the remote computer whose keyboard and mouse are being
//! *controlled* by the server.  The client application:
//!
//! 1. Resolves the server's address and opens a secure stream to it.
//! 2. Completes the Hello / Auth handshake, proving knowledge of the shared
//!    secret, and receives a session id.
//! 3. Exchanges heartbeats so that both sides notice a dead connection within
//!    two heartbeat intervals.
//! 4. Hands every forwarded `InputEvent` to the local injector, in order and
//!    exactly once.
//! 5. When the connection is lost, waits with exponential backoff and starts
//!    again from step 1.

/// Application layer: use cases for the client.
pub mod application;

/// Infrastructure layer: network, input injection, configuration and the
/// command console.
pub mod infrastructure;

pub use application::reconnect::{BackoffPolicy, ReconnectEvent, ReconnectOutcome};
pub use infrastructure::network::client::{ClientSettings, ConnectionStatus, KvmClient};

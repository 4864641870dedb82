//! # kvm-core
//!
//! Session protocol shared by the KVM-Over-IP server and client.
//!
//! The protocol runs on top of a byte stream that is already encrypted and
//! authenticated by an external security layer. This crate adds everything
//! above that: framing, the message codec, the handshake, heartbeat liveness
//! and the low-latency input event transport.
//!
//! # Architecture overview (for beginners)
//!
//! Components, from the wire up:
//!
//! - **`transport`** – Splits the byte stream into length-prefixed frames and
//!   enforces the maximum frame size.
//!
//! - **`protocol`** – Turns frames into typed [`protocol::Message`]s inside an
//!   envelope carrying the version, session token and sequence number.
//!
//! - **`session`** – The handshake state machine (Hello, Auth, AuthResult),
//!   the heartbeat monitor and the loop that runs an established session.
//!
//! - **`input`** – The bounded outbound queue (mouse moves may be coalesced,
//!   keys and clicks never dropped) and the router that hands received events
//!   to the local injector.
//!
//! The session registry and the reconnection policy live in the server and
//! client crates respectively.

pub mod config;
pub mod error;
pub mod input;
pub mod monitoring;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-export the most-used types at the crate root so callers can write
// `kvm_core::SessionError` instead of `kvm_core::error::SessionError`.
pub use config::ProtocolConfig;
pub use error::SessionError;
pub use input::{InputCapture, InputInjector, InputQueue, PushOutcome};
pub use monitoring::{MetricsSink, NoopMetrics, TracingMetrics};
pub use protocol::{CloseReason, InputEvent, Message, ProtocolVersion, SessionId, PROTOCOL_VERSION};
pub use session::{ConnectionStats, HandshakeState, PeerIdentity, Session};
pub use transport::{SecureAcceptor, SecureConnector, SecureStream, TrafficCounters};

//! Session layer: handshake, liveness and the established-session loop.

pub mod auth;
pub mod handshake;
pub mod heartbeat;
pub mod link;
pub mod model;
pub mod worker;

pub use auth::{Authenticator, CredentialSource, SharedSecret};
pub use handshake::{
    accept_handshake, initiate_handshake, Established, Handshake, HandshakeAction, LocalHello,
    SessionAdmission,
};
pub use heartbeat::{HeartbeatAction, HeartbeatMonitor};
pub use link::MessageLink;
pub use model::{ConnectionStats, HandshakeState, LinkSnapshot, PeerIdentity, Session};
pub use worker::{
    run_session, CloseInitiator, IgnoreProgress, SessionCommand, SessionContext, SessionEnd,
    SessionObserver,
};

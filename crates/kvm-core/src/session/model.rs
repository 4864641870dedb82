//! Session data model.
//!
//! # Lifecycle (for beginners)
//!
//! ```text
//! Connected ──► HelloExchanged ──► AuthPending ──► Established
//!     │               │                 │               │
//!     └───────────────┴─────────────────┴───────────────┴──► Closing ──► Closed
//! ```
//!
//! A [`Session`] record only exists from `Established` onwards; the earlier
//! states belong to the handshake machine of a connection that has not earned
//! a session yet.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{HelloMessage, ProtocolVersion, SessionId};

/// Handshake/session state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeState {
    Connected,
    HelloExchanged,
    AuthPending,
    Established,
    Closing,
    /// Terminal. Further transitions are ignored.
    Closed,
}

impl HandshakeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeState::Closing | HandshakeState::Closed)
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Who is on the other end, as announced in its Hello.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub node_id: Uuid,
    pub name: String,
    pub capabilities: u32,
}

impl From<&HelloMessage> for PeerIdentity {
    fn from(hello: &HelloMessage) -> Self {
        Self {
            node_id: hello.node_id,
            name: hello.name.clone(),
            capabilities: hello.capabilities,
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.node_id)
    }
}

/// One established session as tracked by the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: SessionId,
    pub peer_identity: PeerIdentity,
    pub state: HandshakeState,
    pub established_at: Instant,
    pub last_heartbeat_at: Instant,
    pub negotiated_version: ProtocolVersion,
    /// Last sequence number sent on this session.
    pub outbound_seq: u32,
    /// Last sequence number accepted from the peer.
    pub inbound_seq: u32,
    /// Round-trip time of the latest heartbeat.
    pub last_rtt: Option<Duration>,
}

/// Progress report published by a running session.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSnapshot {
    pub session_id: SessionId,
    pub at: Instant,
    pub rtt: Option<Duration>,
    pub outbound_seq: u32,
    pub inbound_seq: u32,
}

impl Session {
    /// Folds a worker snapshot into the record.
    pub fn apply(&mut self, snapshot: &LinkSnapshot) {
        self.last_heartbeat_at = snapshot.at;
        self.outbound_seq = snapshot.outbound_seq;
        self.inbound_seq = snapshot.inbound_seq;
        if snapshot.rtt.is_some() {
            self.last_rtt = snapshot.rtt;
        }
    }
}

/// Read-only aggregate for status surfaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub active_session_count: u32,
    pub last_rtt_ms: Option<u64>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

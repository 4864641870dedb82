//! Session error taxonomy.
//!
//! Every failure that reaches a caller of the session layer is a
//! [`SessionError`]. Transport and codec errors are converted at the boundary,
//! so upper layers never see raw I/O errors.
//!
//! | Variant               | Fatal | Retried by the client controller |
//! |-----------------------|-------|----------------------------------|
//! | `VersionMismatch`     | yes   | no                               |
//! | `AuthFailed`          | yes   | no                               |
//! | `CapacityExceeded`    | yes   | no                               |
//! | `MessageTooLarge`     | yes   | no                               |
//! | `MalformedMessage`    | yes   | no                               |
//! | `UnknownMessageType`  | no    | n/a (frame skipped)              |
//! | `ProtocolTimeout`     | yes   | no                               |
//! | `ConnectionLost`      | yes   | yes                              |

use thiserror::Error;

use crate::protocol::{ErrorCode, ErrorMessage, ProtocolError, ProtocolVersion, SessionId};
use crate::transport::TransportError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Peers disagree on the protocol major version.
    #[error(
        "protocol version mismatch: local {local}, remote {}",
        .remote.map_or_else(|| "unknown".to_string(), |v| v.to_string())
    )]
    VersionMismatch {
        local: ProtocolVersion,
        /// `None` when the mismatch was reported by the peer rather than
        /// detected locally.
        remote: Option<ProtocolVersion>,
    },

    /// The credential offered during the handshake was rejected.
    #[error("authentication failed")]
    AuthFailed,

    /// The server already hosts its configured maximum number of sessions.
    #[error("server is at capacity")]
    CapacityExceeded,

    /// A frame exceeded the configured maximum size.
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    /// A frame of a known type could not be parsed, or arrived out of place.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The type byte is unassigned. Only ever logged.
    #[error("unknown message type 0x{0:02X}")]
    UnknownMessageType(u8),

    /// The handshake did not finish within its budget.
    #[error("handshake did not complete within {budget_ms} ms")]
    ProtocolTimeout { budget_ms: u64 },

    /// The transport failed or the peer went silent.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// No live session has this id.
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
}

impl SessionError {
    /// Whether this error ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SessionError::UnknownMessageType(_) | SessionError::SessionNotFound(_)
        )
    }

    /// Whether the client reconnection policy applies.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::ConnectionLost(_))
    }

    /// Wire code used to report this error to the peer before closing.
    ///
    /// Returns `None` for conditions the peer cannot act on (a dead
    /// connection, a skipped frame, a local lookup miss).
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            SessionError::VersionMismatch { .. } => Some(ErrorCode::VersionMismatch),
            SessionError::AuthFailed => Some(ErrorCode::AuthFailed),
            SessionError::CapacityExceeded => Some(ErrorCode::CapacityExceeded),
            SessionError::MessageTooLarge { .. } => Some(ErrorCode::MessageTooLarge),
            SessionError::MalformedMessage(_) => Some(ErrorCode::MalformedMessage),
            SessionError::ProtocolTimeout { .. } => Some(ErrorCode::ProtocolTimeout),
            SessionError::UnknownMessageType(_)
            | SessionError::ConnectionLost(_)
            | SessionError::SessionNotFound(_) => None,
        }
    }

    /// Maps an ERROR message received from the peer back into the taxonomy.
    pub fn from_remote(report: &ErrorMessage, local: ProtocolVersion) -> Self {
        match report.code {
            ErrorCode::VersionMismatch => SessionError::VersionMismatch {
                local,
                remote: None,
            },
            ErrorCode::AuthFailed => SessionError::AuthFailed,
            ErrorCode::CapacityExceeded => SessionError::CapacityExceeded,
            ErrorCode::MessageTooLarge => SessionError::MalformedMessage(format!(
                "peer rejected an oversized frame: {}",
                report.description
            )),
            ErrorCode::MalformedMessage => SessionError::MalformedMessage(format!(
                "peer rejected a frame: {}",
                report.description
            )),
            ErrorCode::ProtocolTimeout => SessionError::ProtocolTimeout { budget_ms: 0 },
            ErrorCode::Internal => {
                SessionError::ConnectionLost(format!("peer failed: {}", report.description))
            }
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::MessageTooLarge { size, limit } => {
                SessionError::MessageTooLarge { size, limit }
            }
            TransportError::Closed => SessionError::ConnectionLost("stream closed by peer".to_string()),
            TransportError::Io(io) => SessionError::ConnectionLost(io.to_string()),
        }
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::UnknownMessageType(t) => SessionError::UnknownMessageType(t),
            ProtocolError::MalformedMessage(detail) => SessionError::MalformedMessage(detail),
        }
    }
}

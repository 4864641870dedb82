//! Session protocol message types.
//!
//! Every message travels inside an [`Envelope`] carrying the sender's protocol
//! major version, the message type, the session token (absent until the
//! handshake has established a session) and a per-direction sequence number.
//!
//! # Message flow (for beginners)
//!
//! ```text
//!  client                                server
//!    │ ── Hello ──────────────────────────► │   version check
//!    │ ◄────────────────────────── Hello ── │
//!    │ ◄──────────────── Auth(Challenge) ── │   capacity check happened first
//!    │ ── Auth(Response) ─────────────────► │   credential check
//!    │ ◄────────────────────── AuthResult ── │   session token issued
//!    │                                      │
//!    │ ◄──── Heartbeat / HeartbeatAck ────► │   both directions
//!    │ ◄──────────── InputEvent ──────────► │
//!    │ ◄─────────── SessionClose ─────────► │
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Protocol version implemented by this crate.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

/// Size of the fixed part of the envelope: version, type, flags and sequence.
pub const ENVELOPE_BASE_SIZE: usize = 7;

/// Size of the session token carried by established-session envelopes.
pub const SESSION_ID_SIZE: usize = 16;

/// Length of the random challenge issued by the server.
pub const CHALLENGE_NONCE_SIZE: usize = 32;

/// Envelope flag: a session token follows the flags byte.
pub const FLAG_HAS_SESSION: u8 = 0x01;

/// Capability bitmask flags advertised in [`HelloMessage::capabilities`].
pub mod capabilities {
    pub const KEYBOARD: u32 = 1 << 0;
    pub const MOUSE: u32 = 1 << 1;
    /// Reserved; clipboard sync is not part of the session protocol yet.
    pub const CLIPBOARD: u32 = 1 << 2;

    /// What a default node advertises.
    pub const DEFAULT: u32 = KEYBOARD | MOUSE;
}

// ── Versions and identifiers ──────────────────────────────────────────────────

/// Protocol version as `major.minor`.
///
/// Peers with a different major version cannot talk to each other. Minor
/// versions are backwards compatible; the session runs at the lower minor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Returns `true` when both peers share the same major version.
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }

    /// Version both peers run once the handshake succeeds.
    pub fn negotiate(&self, other: &ProtocolVersion) -> Option<ProtocolVersion> {
        self.is_compatible_with(other).then(|| ProtocolVersion {
            major: self.major,
            minor: self.minor.min(other.minor),
        })
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Opaque 16-byte token naming one established session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generates a fresh random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; SESSION_ID_SIZE]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_ID_SIZE] {
        self.0.as_bytes()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(SessionId)
    }
}

// ── Message type codes ────────────────────────────────────────────────────────

/// Wire type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    Auth = 0x02,
    AuthResult = 0x03,
    Heartbeat = 0x04,
    HeartbeatAck = 0x05,
    SessionClose = 0x06,
    Error = 0x07,
    InputEvent = 0x10,
}

impl TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(MessageType::Hello),
            0x02 => Ok(MessageType::Auth),
            0x03 => Ok(MessageType::AuthResult),
            0x04 => Ok(MessageType::Heartbeat),
            0x05 => Ok(MessageType::HeartbeatAck),
            0x06 => Ok(MessageType::SessionClose),
            0x07 => Ok(MessageType::Error),
            0x10 => Ok(MessageType::InputEvent),
            _ => Err(()),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// A decoded frame: header fields plus the typed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Major protocol version of the sender.
    pub version: u8,
    /// `None` until the session is established.
    pub session_id: Option<SessionId>,
    /// Strictly increasing per direction; starts at 1.
    pub seq: u32,
    pub message: Message,
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// HELLO (0x01): identity and version announcement, sent by both peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMessage {
    pub protocol_version: ProtocolVersion,
    /// Stable identifier of the sending node.
    pub node_id: Uuid,
    /// Human-readable host or display name.
    pub name: String,
    pub capabilities: u32,
}

/// AUTH (0x02): one leg of the challenge/response exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMessage {
    /// Server → client: random nonce to prove knowledge of the credential.
    Challenge { nonce: [u8; CHALLENGE_NONCE_SIZE] },
    /// Client → server: proof computed over the nonce.
    Response { credential: Vec<u8> },
}

/// AUTH_RESULT (0x03): verdict on the credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResultMessage {
    pub accepted: bool,
    /// Present if and only if `accepted`.
    pub session_id: Option<SessionId>,
}

/// Why a session is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CloseReason {
    UserInitiated = 0x01,
    ServerShutdown = 0x02,
    ProtocolError = 0x03,
    HeartbeatTimeout = 0x04,
}

impl TryFrom<u8> for CloseReason {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(CloseReason::UserInitiated),
            0x02 => Ok(CloseReason::ServerShutdown),
            0x03 => Ok(CloseReason::ProtocolError),
            0x04 => Ok(CloseReason::HeartbeatTimeout),
            _ => Err(()),
        }
    }
}

/// Error codes carried by ERROR (0x07) messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    VersionMismatch = 0x01,
    AuthFailed = 0x02,
    CapacityExceeded = 0x03,
    MessageTooLarge = 0x04,
    MalformedMessage = 0x05,
    ProtocolTimeout = 0x06,
    Internal = 0xFF,
}

impl TryFrom<u8> for ErrorCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(ErrorCode::VersionMismatch),
            0x02 => Ok(ErrorCode::AuthFailed),
            0x03 => Ok(ErrorCode::CapacityExceeded),
            0x04 => Ok(ErrorCode::MessageTooLarge),
            0x05 => Ok(ErrorCode::MalformedMessage),
            0x06 => Ok(ErrorCode::ProtocolTimeout),
            0xFF => Ok(ErrorCode::Internal),
            _ => Err(()),
        }
    }
}

/// ERROR (0x07): fatal condition reported to the peer before closing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub description: String,
}

// ── Input events ──────────────────────────────────────────────────────────────

/// Modifier key bitmask attached to keyboard events.
///
/// Bit layout: Ctrl, Shift, Alt, Meta (Windows/Command/Super) from bit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModifierFlags(pub u8);

impl ModifierFlags {
    pub const CTRL: u8 = 1 << 0;
    pub const SHIFT: u8 = 1 << 1;
    pub const ALT: u8 = 1 << 2;
    pub const META: u8 = 1 << 3;

    pub fn ctrl(&self) -> bool {
        self.0 & Self::CTRL != 0
    }

    pub fn shift(&self) -> bool {
        self.0 & Self::SHIFT != 0
    }

    pub fn alt(&self) -> bool {
        self.0 & Self::ALT != 0
    }

    pub fn meta(&self) -> bool {
        self.0 & Self::META != 0
    }
}

/// Mouse button identifier. `0` on the wire means "no button".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MouseButton {
    Left = 0x01,
    Right = 0x02,
    Middle = 0x03,
    Back = 0x04,
    Forward = 0x05,
}

impl TryFrom<u8> for MouseButton {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MouseButton::Left),
            0x02 => Ok(MouseButton::Right),
            0x03 => Ok(MouseButton::Middle),
            0x04 => Ok(MouseButton::Back),
            0x05 => Ok(MouseButton::Forward),
            _ => Err(()),
        }
    }
}

/// Key press or release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyboardEvent {
    /// Platform-neutral key code (USB HID usage on the keyboard page).
    pub key_code: u16,
    pub pressed: bool,
    pub modifiers: ModifierFlags,
    /// Monotonic capture time in microseconds. Informational only.
    pub timestamp_us: u64,
}

/// Pointer position, optionally with a button edge or a wheel step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MouseEvent {
    pub x: i32,
    pub y: i32,
    /// Button whose state changed, if any.
    pub button: Option<MouseButton>,
    pub pressed: bool,
    /// Wheel movement in 1/120 notch units; 0 when the wheel did not move.
    pub wheel_delta: i16,
    pub timestamp_us: u64,
}

/// INPUT_EVENT (0x10) payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputEvent {
    Keyboard(KeyboardEvent),
    Mouse(MouseEvent),
}

impl InputEvent {
    /// Convenience constructor for a plain pointer move.
    pub fn mouse_move(x: i32, y: i32, timestamp_us: u64) -> Self {
        InputEvent::Mouse(MouseEvent {
            x,
            y,
            button: None,
            pressed: false,
            wheel_delta: 0,
            timestamp_us,
        })
    }

    /// Convenience constructor for a button press or release at `(x, y)`.
    pub fn mouse_button(x: i32, y: i32, button: MouseButton, pressed: bool, timestamp_us: u64) -> Self {
        InputEvent::Mouse(MouseEvent {
            x,
            y,
            button: Some(button),
            pressed,
            wheel_delta: 0,
            timestamp_us,
        })
    }

    /// Convenience constructor for a key press or release.
    pub fn key(key_code: u16, pressed: bool, modifiers: ModifierFlags, timestamp_us: u64) -> Self {
        InputEvent::Keyboard(KeyboardEvent {
            key_code,
            pressed,
            modifiers,
            timestamp_us,
        })
    }

    /// A pure pointer move with no button edge and no wheel step.
    ///
    /// Only these events may be coalesced or dropped under pressure.
    pub fn is_pointer_move(&self) -> bool {
        matches!(self, InputEvent::Mouse(m) if m.button.is_none() && m.wheel_delta == 0)
    }

    pub fn timestamp_us(&self) -> u64 {
        match self {
            InputEvent::Keyboard(k) => k.timestamp_us,
            InputEvent::Mouse(m) => m.timestamp_us,
        }
    }
}

// ── Top-level message enum ────────────────────────────────────────────────────

/// Every message the session protocol exchanges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Hello(HelloMessage),
    Auth(AuthMessage),
    AuthResult(AuthResultMessage),
    /// Liveness probe; the token is echoed back in the ack.
    Heartbeat { token: u64 },
    HeartbeatAck { token: u64 },
    InputEvent(InputEvent),
    SessionClose { reason: CloseReason },
    Error(ErrorMessage),
}

impl Message {
    /// Returns the [`MessageType`] code for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::Auth(_) => MessageType::Auth,
            Message::AuthResult(_) => MessageType::AuthResult,
            Message::Heartbeat { .. } => MessageType::Heartbeat,
            Message::HeartbeatAck { .. } => MessageType::HeartbeatAck,
            Message::InputEvent(_) => MessageType::InputEvent,
            Message::SessionClose { .. } => MessageType::SessionClose,
            Message::Error(_) => MessageType::Error,
        }
    }

    /// Builds the error report sent to a peer before closing.
    pub fn error(code: ErrorCode, description: impl Into<String>) -> Self {
        Message::Error(ErrorMessage {
            code,
            description: description.into(),
        })
    }
}

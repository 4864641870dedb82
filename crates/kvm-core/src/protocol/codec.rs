//! Binary codec for session protocol envelopes.
//!
//! Wire format of one envelope (the transport adds the u32 length prefix):
//! ```text
//! [version:1][type:1][flags:1][session_id:16 if flags&0x01][seq:4][payload:N]
//! ```
//! All multi-byte integers are big-endian. The payload runs to the end of the
//! frame; bytes left over after a complete payload are ignored so that later
//! minor versions can append fields.

use thiserror::Error;
use uuid::Uuid;

use crate::protocol::messages::{
    AuthMessage, AuthResultMessage, CloseReason, Envelope, ErrorCode, ErrorMessage, HelloMessage,
    InputEvent, KeyboardEvent, Message, MessageType, ModifierFlags, MouseButton, MouseEvent,
    ProtocolVersion, SessionId, CHALLENGE_NONCE_SIZE, ENVELOPE_BASE_SIZE, FLAG_HAS_SESSION,
    SESSION_ID_SIZE,
};

/// Errors that can occur while encoding or decoding an envelope.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The type byte is not one this build understands. Not fatal: the
    /// receiver logs and skips the frame.
    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// The frame is too short, or a field holds a value outside its domain.
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes `message` into a complete envelope.
///
/// `session_id` is `None` for handshake traffic. The sequence number is owned
/// by the caller's [`crate::protocol::SequenceCounter`].
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedMessage`] if a variable-length field does
/// not fit its length prefix.
///
/// # Examples
///
/// ```rust
/// use kvm_core::protocol::{decode_envelope, encode_envelope, Message};
///
/// let bytes = encode_envelope(1, None, 7, &Message::Heartbeat { token: 42 }).unwrap();
/// let envelope = decode_envelope(&bytes).unwrap();
/// assert_eq!(envelope.seq, 7);
/// assert_eq!(envelope.message, Message::Heartbeat { token: 42 });
/// ```
pub fn encode_envelope(
    version: u8,
    session_id: Option<SessionId>,
    seq: u32,
    message: &Message,
) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(ENVELOPE_BASE_SIZE + SESSION_ID_SIZE + 32);

    buf.push(version);
    buf.push(message.message_type() as u8);
    match session_id {
        Some(id) => {
            buf.push(FLAG_HAS_SESSION);
            buf.extend_from_slice(id.as_bytes());
        }
        None => buf.push(0x00),
    }
    buf.extend_from_slice(&seq.to_be_bytes());

    encode_payload(&mut buf, message)?;
    Ok(buf)
}

/// Decodes one complete envelope (the bytes of exactly one frame).
///
/// # Errors
///
/// - [`ProtocolError::UnknownMessageType`] if the type byte is unassigned.
/// - [`ProtocolError::MalformedMessage`] if the header or the payload of a
///   known type cannot be parsed.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, ProtocolError> {
    require_len(bytes, ENVELOPE_BASE_SIZE, "envelope header")?;

    let version = bytes[0];
    let type_byte = bytes[1];
    let flags = bytes[2];
    if flags & !FLAG_HAS_SESSION != 0 {
        return Err(ProtocolError::MalformedMessage(format!(
            "unknown envelope flags 0x{flags:02X}"
        )));
    }

    let mut offset = 3;
    let session_id = if flags & FLAG_HAS_SESSION != 0 {
        let id = SessionId(read_uuid(bytes, offset)?);
        offset += SESSION_ID_SIZE;
        Some(id)
    } else {
        None
    };
    let seq = read_u32(bytes, offset)?;
    offset += 4;

    let message_type =
        MessageType::try_from(type_byte).map_err(|_| ProtocolError::UnknownMessageType(type_byte))?;
    let message = decode_payload(message_type, &bytes[offset..])?;

    Ok(Envelope {
        version,
        session_id,
        seq,
        message,
    })
}

// ── Payload encoding ──────────────────────────────────────────────────────────

fn encode_payload(buf: &mut Vec<u8>, message: &Message) -> Result<(), ProtocolError> {
    match message {
        Message::Hello(m) => encode_hello(buf, m)?,
        Message::Auth(m) => encode_auth(buf, m)?,
        Message::AuthResult(m) => encode_auth_result(buf, m),
        Message::Heartbeat { token } | Message::HeartbeatAck { token } => {
            buf.extend_from_slice(&token.to_be_bytes());
        }
        Message::InputEvent(event) => encode_input_event(buf, event),
        Message::SessionClose { reason } => buf.push(*reason as u8),
        Message::Error(m) => encode_error(buf, m)?,
    }
    Ok(())
}

fn encode_hello(buf: &mut Vec<u8>, m: &HelloMessage) -> Result<(), ProtocolError> {
    buf.push(m.protocol_version.major);
    buf.push(m.protocol_version.minor);
    buf.extend_from_slice(&m.capabilities.to_be_bytes());
    buf.extend_from_slice(m.node_id.as_bytes());
    write_length_prefixed(buf, m.name.as_bytes(), "hello name")
}

fn encode_auth(buf: &mut Vec<u8>, m: &AuthMessage) -> Result<(), ProtocolError> {
    match m {
        AuthMessage::Challenge { nonce } => {
            buf.push(AUTH_CHALLENGE);
            buf.extend_from_slice(nonce);
        }
        AuthMessage::Response { credential } => {
            buf.push(AUTH_RESPONSE);
            write_length_prefixed(buf, credential, "auth credential")?;
        }
    }
    Ok(())
}

fn encode_auth_result(buf: &mut Vec<u8>, m: &AuthResultMessage) {
    buf.push(m.accepted as u8);
    match m.session_id {
        Some(id) => {
            buf.push(0x01);
            buf.extend_from_slice(id.as_bytes());
        }
        None => buf.push(0x00),
    }
}

fn encode_input_event(buf: &mut Vec<u8>, event: &InputEvent) {
    match event {
        InputEvent::Keyboard(k) => {
            buf.push(INPUT_KEYBOARD);
            buf.extend_from_slice(&k.key_code.to_be_bytes());
            buf.push(k.pressed as u8);
            buf.push(k.modifiers.0);
            buf.extend_from_slice(&k.timestamp_us.to_be_bytes());
        }
        InputEvent::Mouse(m) => {
            buf.push(INPUT_MOUSE);
            buf.extend_from_slice(&m.x.to_be_bytes());
            buf.extend_from_slice(&m.y.to_be_bytes());
            buf.push(m.button.map(|b| b as u8).unwrap_or(0));
            buf.push(m.pressed as u8);
            buf.extend_from_slice(&m.wheel_delta.to_be_bytes());
            buf.extend_from_slice(&m.timestamp_us.to_be_bytes());
        }
    }
}

fn encode_error(buf: &mut Vec<u8>, m: &ErrorMessage) -> Result<(), ProtocolError> {
    buf.push(m.code as u8);
    write_length_prefixed(buf, m.description.as_bytes(), "error description")
}

// ── Payload decoding ──────────────────────────────────────────────────────────

const AUTH_CHALLENGE: u8 = 0x01;
const AUTH_RESPONSE: u8 = 0x02;
const INPUT_KEYBOARD: u8 = 0x01;
const INPUT_MOUSE: u8 = 0x02;

fn decode_payload(message_type: MessageType, p: &[u8]) -> Result<Message, ProtocolError> {
    match message_type {
        MessageType::Hello => Ok(Message::Hello(decode_hello(p)?)),
        MessageType::Auth => Ok(Message::Auth(decode_auth(p)?)),
        MessageType::AuthResult => Ok(Message::AuthResult(decode_auth_result(p)?)),
        MessageType::Heartbeat => Ok(Message::Heartbeat {
            token: read_u64(p, 0)?,
        }),
        MessageType::HeartbeatAck => Ok(Message::HeartbeatAck {
            token: read_u64(p, 0)?,
        }),
        MessageType::InputEvent => Ok(Message::InputEvent(decode_input_event(p)?)),
        MessageType::SessionClose => {
            require_len(p, 1, "session close")?;
            let reason = CloseReason::try_from(p[0]).map_err(|_| {
                ProtocolError::MalformedMessage(format!("unknown close reason 0x{:02X}", p[0]))
            })?;
            Ok(Message::SessionClose { reason })
        }
        MessageType::Error => Ok(Message::Error(decode_error(p)?)),
    }
}

fn decode_hello(p: &[u8]) -> Result<HelloMessage, ProtocolError> {
    // major(1) + minor(1) + capabilities(4) + node_id(16) + name_len(2)
    require_len(p, 24, "hello")?;
    let protocol_version = ProtocolVersion::new(p[0], p[1]);
    let capabilities = read_u32(p, 2)?;
    let node_id = read_uuid(p, 6)?;
    let (name_bytes, _) = read_length_prefixed(p, 22)?;
    let name = String::from_utf8(name_bytes.to_vec())
        .map_err(|e| ProtocolError::MalformedMessage(format!("hello name is not UTF-8: {e}")))?;
    Ok(HelloMessage {
        protocol_version,
        node_id,
        name,
        capabilities,
    })
}

fn decode_auth(p: &[u8]) -> Result<AuthMessage, ProtocolError> {
    require_len(p, 1, "auth")?;
    match p[0] {
        AUTH_CHALLENGE => {
            require_len(p, 1 + CHALLENGE_NONCE_SIZE, "auth challenge")?;
            let mut nonce = [0u8; CHALLENGE_NONCE_SIZE];
            nonce.copy_from_slice(&p[1..1 + CHALLENGE_NONCE_SIZE]);
            Ok(AuthMessage::Challenge { nonce })
        }
        AUTH_RESPONSE => {
            let (credential, _) = read_length_prefixed(p, 1)?;
            Ok(AuthMessage::Response {
                credential: credential.to_vec(),
            })
        }
        other => Err(ProtocolError::MalformedMessage(format!(
            "unknown auth kind 0x{other:02X}"
        ))),
    }
}

fn decode_auth_result(p: &[u8]) -> Result<AuthResultMessage, ProtocolError> {
    require_len(p, 2, "auth result")?;
    let accepted = read_bool(p[0], "auth result accepted")?;
    let session_id = if read_bool(p[1], "auth result session flag")? {
        Some(SessionId(read_uuid(p, 2)?))
    } else {
        None
    };
    if accepted != session_id.is_some() {
        return Err(ProtocolError::MalformedMessage(
            "auth result must carry a session token exactly when accepted".to_string(),
        ));
    }
    Ok(AuthResultMessage {
        accepted,
        session_id,
    })
}

fn decode_input_event(p: &[u8]) -> Result<InputEvent, ProtocolError> {
    require_len(p, 1, "input event")?;
    match p[0] {
        INPUT_KEYBOARD => {
            // kind(1) + key_code(2) + pressed(1) + modifiers(1) + ts(8)
            require_len(p, 13, "keyboard event")?;
            Ok(InputEvent::Keyboard(KeyboardEvent {
                key_code: u16::from_be_bytes([p[1], p[2]]),
                pressed: read_bool(p[3], "keyboard pressed")?,
                modifiers: ModifierFlags(p[4]),
                timestamp_us: read_u64(p, 5)?,
            }))
        }
        INPUT_MOUSE => {
            // kind(1) + x(4) + y(4) + button(1) + pressed(1) + wheel(2) + ts(8)
            require_len(p, 21, "mouse event")?;
            let button = match p[9] {
                0 => None,
                b => Some(MouseButton::try_from(b).map_err(|_| {
                    ProtocolError::MalformedMessage(format!("unknown mouse button 0x{b:02X}"))
                })?),
            };
            Ok(InputEvent::Mouse(MouseEvent {
                x: read_u32(p, 1)? as i32,
                y: read_u32(p, 5)? as i32,
                button,
                pressed: read_bool(p[10], "mouse pressed")?,
                wheel_delta: i16::from_be_bytes([p[11], p[12]]),
                timestamp_us: read_u64(p, 13)?,
            }))
        }
        other => Err(ProtocolError::MalformedMessage(format!(
            "unknown input event kind 0x{other:02X}"
        ))),
    }
}

fn decode_error(p: &[u8]) -> Result<ErrorMessage, ProtocolError> {
    require_len(p, 3, "error")?;
    let code = ErrorCode::try_from(p[0])
        .map_err(|_| ProtocolError::MalformedMessage(format!("unknown error code 0x{:02X}", p[0])))?;
    let (text, _) = read_length_prefixed(p, 1)?;
    Ok(ErrorMessage {
        code,
        // A garbled description should not hide the code itself.
        description: String::from_utf8_lossy(text).into_owned(),
    })
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn require_len(buf: &[u8], needed: usize, context: &str) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        Err(ProtocolError::MalformedMessage(format!(
            "{context}: need {needed} bytes, got {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

fn read_bool(byte: u8, context: &str) -> Result<bool, ProtocolError> {
    match byte {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ProtocolError::MalformedMessage(format!(
            "{context}: expected 0 or 1, got {other}"
        ))),
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32, ProtocolError> {
    let bytes = buf
        .get(offset..offset + 4)
        .ok_or_else(|| ProtocolError::MalformedMessage(format!("need 4 bytes at offset {offset}")))?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u64(buf: &[u8], offset: usize) -> Result<u64, ProtocolError> {
    let bytes = buf
        .get(offset..offset + 8)
        .ok_or_else(|| ProtocolError::MalformedMessage(format!("need 8 bytes at offset {offset}")))?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(raw))
}

fn read_uuid(buf: &[u8], offset: usize) -> Result<Uuid, ProtocolError> {
    let bytes = buf.get(offset..offset + 16).ok_or_else(|| {
        ProtocolError::MalformedMessage(format!(
            "need 16 bytes for UUID at offset {offset}, got {}",
            buf.len().saturating_sub(offset)
        ))
    })?;
    let mut raw = [0u8; 16];
    raw.copy_from_slice(bytes);
    Ok(Uuid::from_bytes(raw))
}

/// Writes a 2-byte length prefix followed by `bytes`.
fn write_length_prefixed(buf: &mut Vec<u8>, bytes: &[u8], context: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(bytes.len()).map_err(|_| {
        ProtocolError::MalformedMessage(format!(
            "{context}: {} bytes exceeds the u16 length prefix",
            bytes.len()
        ))
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Reads a 2-byte length prefix and that many bytes.
/// Returns the bytes and the offset just past them.
fn read_length_prefixed(buf: &[u8], offset: usize) -> Result<(&[u8], usize), ProtocolError> {
    let prefix = buf.get(offset..offset + 2).ok_or_else(|| {
        ProtocolError::MalformedMessage(format!("need 2 bytes for length at offset {offset}"))
    })?;
    let len = u16::from_be_bytes([prefix[0], prefix[1]]) as usize;
    let start = offset + 2;
    let data = buf.get(start..start + len).ok_or_else(|| {
        ProtocolError::MalformedMessage(format!(
            "field of length {len} at offset {start} exceeds buffer"
        ))
    })?;
    Ok((data, start + len))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

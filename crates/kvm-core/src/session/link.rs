//! Message-level view of one connection.
//!
//! A [`MessageLink`] owns the framed transport together with the two
//! per-direction sequence states, so every message of a connection (handshake
//! and established traffic alike) is numbered from one counter and checked
//! against one replay guard.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::SessionError;
use crate::protocol::{
    decode_envelope, encode_envelope, Message, ReplayGuard, SequenceCounter, SessionId,
};
use crate::transport::{FramedTransport, SecureStream, TrafficCounters};

pub struct MessageLink<S> {
    transport: FramedTransport<S>,
    version: u8,
    session_id: Option<SessionId>,
    outbound: SequenceCounter,
    inbound: ReplayGuard,
}

impl<S: SecureStream> MessageLink<S> {
    /// Wraps `stream`. `version` is the local protocol major stamped on every
    /// outgoing envelope.
    pub fn new(stream: S, version: u8, max_frame_size: usize, counters: Arc<TrafficCounters>) -> Self {
        Self {
            transport: FramedTransport::new(stream, max_frame_size, counters),
            version,
            session_id: None,
            outbound: SequenceCounter::new(),
            inbound: ReplayGuard::new(),
        }
    }

    /// Attaches the session token once the handshake has issued one.
    /// From here on it is stamped on every outgoing envelope and required on
    /// every incoming one.
    pub fn bind(&mut self, session_id: SessionId) {
        self.session_id = Some(session_id);
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    /// Last sequence number sent.
    pub fn outbound_seq(&self) -> u32 {
        self.outbound.last()
    }

    /// Last sequence number accepted.
    pub fn inbound_seq(&self) -> u32 {
        self.inbound.last_seen()
    }

    /// Numbers, encodes and writes one message. Returns its sequence number.
    ///
    /// # Errors
    ///
    /// - [`SessionError::ConnectionLost`] when the transport fails or the
    ///   outbound sequence space is exhausted.
    /// - [`SessionError::MessageTooLarge`] when the encoded frame is over the
    ///   limit.
    /// - [`SessionError::MalformedMessage`] when a field cannot be encoded.
    pub async fn send(&mut self, message: &Message) -> Result<u32, SessionError> {
        let seq = self.outbound.next().ok_or_else(|| {
            SessionError::ConnectionLost("outbound sequence space exhausted".to_string())
        })?;
        let bytes = encode_envelope(self.version, self.session_id, seq, message)?;
        self.transport.send(&bytes).await?;
        Ok(seq)
    }

    /// Reads the next frame.
    ///
    /// Returns `Ok(None)` for frames that were dropped: unknown types,
    /// duplicate or out-of-order sequence numbers, and envelopes addressed to
    /// another session. Cancel-safe.
    ///
    /// # Errors
    ///
    /// Fatal transport and decode errors, already mapped into
    /// [`SessionError`].
    pub async fn recv(&mut self) -> Result<Option<Message>, SessionError> {
        let frame = self.transport.receive().await?;
        let envelope = match decode_envelope(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                let error = SessionError::from(e);
                if error.is_fatal() {
                    return Err(error);
                }
                warn!("skipping frame: {error}");
                return Ok(None);
            }
        };

        if let Some(expected) = self.session_id {
            if envelope.session_id != Some(expected) {
                warn!(
                    "dropping {} addressed to {:?} on session {expected}",
                    envelope.message.message_type(),
                    envelope.session_id
                );
                return Ok(None);
            }
        }

        if !self.inbound.accept(envelope.seq) {
            debug!(
                "dropping {} with stale seq {} (last accepted {})",
                envelope.message.message_type(),
                envelope.seq,
                self.inbound.last_seen()
            );
            return Ok(None);
        }

        Ok(Some(envelope.message))
    }

    /// Shuts down the write direction. Errors are ignored: the connection is
    /// being abandoned either way.
    pub async fn close(&mut self) {
        if let Err(e) = self.transport.close().await {
            debug!("error while closing transport: {e}");
        }
    }
}

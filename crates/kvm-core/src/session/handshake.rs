//! Handshake state machine and its async drivers.
//!
//! [`Handshake`] is pure: it never touches a socket or a clock. Each input
//! (a received message, an admission verdict, a registration) returns the
//! list of [`HandshakeAction`]s the caller must carry out. The drivers
//! [`accept_handshake`] and [`initiate_handshake`] execute those actions over
//! a [`MessageLink`] under a deadline.
//!
//! Server sequence:
//!
//! ```text
//! Connected      ── Hello ──►  reply Hello, check version   ──► HelloExchanged
//! HelloExchanged ── Admit ──►  registry slot reserved?      ──► AuthPending (challenge sent)
//! AuthPending    ── Auth  ──►  credential valid? Register   ──► Established (AuthResult sent)
//! ```
//!
//! A major version mismatch is detected in `Connected`, before any credential
//! is exchanged. Every failure goes to `Closing`; exactly one credential
//! attempt is allowed per connection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SessionError;
use crate::protocol::{
    AuthMessage, AuthResultMessage, HelloMessage, Message, ProtocolVersion, SessionId,
    CHALLENGE_NONCE_SIZE,
};
use crate::session::auth::{Authenticator, CredentialSource};
use crate::session::link::MessageLink;
use crate::session::model::{HandshakeState, PeerIdentity};
use crate::transport::SecureStream;

/// Upper bound for the Error report sent after the deadline has passed.
const FAREWELL_BUDGET: Duration = Duration::from_millis(100);

/// What this node announces in its Hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalHello {
    pub version: ProtocolVersion,
    pub identity: PeerIdentity,
}

impl LocalHello {
    pub fn new(version: ProtocolVersion, name: impl Into<String>, capabilities: u32) -> Self {
        Self {
            version,
            identity: PeerIdentity {
                node_id: Uuid::new_v4(),
                name: name.into(),
                capabilities,
            },
        }
    }

    fn to_message(&self) -> Message {
        Message::Hello(HelloMessage {
            protocol_version: self.version,
            node_id: self.identity.node_id,
            name: self.identity.name.clone(),
            capabilities: self.identity.capabilities,
        })
    }
}

/// Which side of the handshake this machine plays.
#[derive(Clone)]
pub enum Role {
    Client(Arc<dyn CredentialSource>),
    Server(Arc<dyn Authenticator>),
}

/// Work requested by the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeAction {
    Send(Message),
    /// Server: reserve a registry slot, then call [`Handshake::admitted`] or
    /// [`Handshake::fail`].
    Admit,
    /// Server: credential accepted; register the session and call
    /// [`Handshake::registered`].
    Register,
    /// The session is up. Bind the link to this token.
    Established(SessionId),
    /// Close the connection; the handshake failed with this error.
    Close(SessionError),
}

/// Result of a completed handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct Established {
    pub session_id: SessionId,
    pub peer: PeerIdentity,
    pub version: ProtocolVersion,
}

pub struct Handshake {
    role: Role,
    local: LocalHello,
    state: HandshakeState,
    peer: Option<PeerIdentity>,
    negotiated: Option<ProtocolVersion>,
    nonce: Option<[u8; CHALLENGE_NONCE_SIZE]>,
    session_id: Option<SessionId>,
    failure: Option<SessionError>,
}

impl Handshake {
    pub fn client(local: LocalHello, credentials: Arc<dyn CredentialSource>) -> Self {
        Self::new(Role::Client(credentials), local)
    }

    pub fn server(local: LocalHello, authenticator: Arc<dyn Authenticator>) -> Self {
        Self::new(Role::Server(authenticator), local)
    }

    fn new(role: Role, local: LocalHello) -> Self {
        Self {
            role,
            local,
            state: HandshakeState::Connected,
            peer: None,
            negotiated: None,
            nonce: None,
            session_id: None,
            failure: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn peer(&self) -> Option<&PeerIdentity> {
        self.peer.as_ref()
    }

    pub fn negotiated_version(&self) -> Option<ProtocolVersion> {
        self.negotiated
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    /// The error that sent the machine to `Closing`, if any.
    pub fn failure(&self) -> Option<&SessionError> {
        self.failure.as_ref()
    }

    fn is_server(&self) -> bool {
        matches!(self.role, Role::Server(_))
    }

    /// Opening move. The client speaks first.
    pub fn start(&mut self) -> Vec<HandshakeAction> {
        if self.state == HandshakeState::Connected && !self.is_server() {
            vec![HandshakeAction::Send(self.local.to_message())]
        } else {
            Vec::new()
        }
    }

    /// Feeds one received message into the machine.
    pub fn on_message(&mut self, message: Message) -> Vec<HandshakeAction> {
        if self.state.is_terminal() {
            return Vec::new();
        }

        match message {
            Message::Error(report) => {
                let error = SessionError::from_remote(&report, self.local.version);
                warn!("peer reported {:?} during handshake: {}", report.code, report.description);
                self.abort(error)
            }
            Message::SessionClose { reason } => self.abort(SessionError::ConnectionLost(format!(
                "peer closed during handshake ({reason:?})"
            ))),
            other => {
                if self.is_server() {
                    self.server_step(other)
                } else {
                    self.client_step(other)
                }
            }
        }
    }

    fn server_step(&mut self, message: Message) -> Vec<HandshakeAction> {
        match (self.state, message) {
            (HandshakeState::Connected, Message::Hello(hello)) => {
                let mut actions = vec![HandshakeAction::Send(self.local.to_message())];
                self.peer = Some(PeerIdentity::from(&hello));
                match self.local.version.negotiate(&hello.protocol_version) {
                    Some(version) => {
                        self.negotiated = Some(version);
                        self.state = HandshakeState::HelloExchanged;
                        actions.push(HandshakeAction::Admit);
                    }
                    None => actions.extend(self.fail(SessionError::VersionMismatch {
                        local: self.local.version,
                        remote: Some(hello.protocol_version),
                    })),
                }
                actions
            }
            (HandshakeState::AuthPending, Message::Auth(AuthMessage::Response { credential })) => {
                let verdict = match (&self.role, &self.nonce, &self.peer) {
                    (Role::Server(authenticator), Some(nonce), Some(peer)) => {
                        authenticator.verify(nonce, &credential, peer)
                    }
                    _ => false,
                };
                // One attempt per connection: the nonce is spent either way.
                self.nonce = None;
                if verdict {
                    vec![HandshakeAction::Register]
                } else {
                    let mut actions = vec![HandshakeAction::Send(Message::AuthResult(
                        AuthResultMessage {
                            accepted: false,
                            session_id: None,
                        },
                    ))];
                    actions.extend(self.abort(SessionError::AuthFailed));
                    actions
                }
            }
            (state, other) => self.unexpected(state, &other),
        }
    }

    fn client_step(&mut self, message: Message) -> Vec<HandshakeAction> {
        match (self.state, message) {
            (HandshakeState::Connected, Message::Hello(hello)) => {
                self.peer = Some(PeerIdentity::from(&hello));
                match self.local.version.negotiate(&hello.protocol_version) {
                    Some(version) => {
                        self.negotiated = Some(version);
                        self.state = HandshakeState::HelloExchanged;
                        Vec::new()
                    }
                    None => self.fail(SessionError::VersionMismatch {
                        local: self.local.version,
                        remote: Some(hello.protocol_version),
                    }),
                }
            }
            (HandshakeState::HelloExchanged, Message::Auth(AuthMessage::Challenge { nonce })) => {
                let credential = match &self.role {
                    Role::Client(source) => source.respond(&nonce, &self.local.identity),
                    Role::Server(_) => Vec::new(),
                };
                self.state = HandshakeState::AuthPending;
                vec![HandshakeAction::Send(Message::Auth(AuthMessage::Response {
                    credential,
                }))]
            }
            (HandshakeState::AuthPending, Message::AuthResult(result)) => match result.session_id {
                Some(id) if result.accepted => {
                    self.session_id = Some(id);
                    self.state = HandshakeState::Established;
                    vec![HandshakeAction::Established(id)]
                }
                _ => self.abort(SessionError::AuthFailed),
            },
            (state, other) => self.unexpected(state, &other),
        }
    }

    fn unexpected(&mut self, state: HandshakeState, message: &Message) -> Vec<HandshakeAction> {
        self.fail(SessionError::MalformedMessage(format!(
            "unexpected {} while {state}",
            message.message_type()
        )))
    }

    /// Server: the registry reserved a slot; issue the challenge.
    pub fn admitted(&mut self, nonce: [u8; CHALLENGE_NONCE_SIZE]) -> Vec<HandshakeAction> {
        if !self.is_server() || self.state != HandshakeState::HelloExchanged {
            return Vec::new();
        }
        self.nonce = Some(nonce);
        self.state = HandshakeState::AuthPending;
        vec![HandshakeAction::Send(Message::Auth(AuthMessage::Challenge {
            nonce,
        }))]
    }

    /// Server: the registry created the session; confirm it to the client.
    pub fn registered(&mut self, session_id: SessionId) -> Vec<HandshakeAction> {
        if !self.is_server() || self.state != HandshakeState::AuthPending {
            return Vec::new();
        }
        self.session_id = Some(session_id);
        self.state = HandshakeState::Established;
        vec![
            HandshakeAction::Send(Message::AuthResult(AuthResultMessage {
                accepted: true,
                session_id: Some(session_id),
            })),
            HandshakeAction::Established(session_id),
        ]
    }

    /// Moves to `Closing`, reporting `error` to the peer when it has a wire
    /// code. No-op once closing.
    pub fn fail(&mut self, error: SessionError) -> Vec<HandshakeAction> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        let mut actions = Vec::with_capacity(2);
        if let Some(code) = error.code() {
            actions.push(HandshakeAction::Send(Message::error(code, error.to_string())));
        }
        actions.extend(self.abort(error));
        actions
    }

    /// Moves to `Closing` without telling the peer anything.
    pub fn abort(&mut self, error: SessionError) -> Vec<HandshakeAction> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        self.state = HandshakeState::Closing;
        self.failure = Some(error.clone());
        vec![HandshakeAction::Close(error)]
    }

    /// Marks the connection as gone. Idempotent.
    pub fn finish(&mut self) {
        self.state = HandshakeState::Closed;
    }

    fn outcome(&self) -> Option<Established> {
        Some(Established {
            session_id: self.session_id?,
            peer: self.peer.clone()?,
            version: self.negotiated?,
        })
    }
}

// ── Drivers ───────────────────────────────────────────────────────────────────

/// Registry hooks the server-side driver needs.
pub trait SessionAdmission: Send {
    /// Called once the peer's Hello is accepted, before any credential is
    /// exchanged.
    fn admit(&mut self) -> Result<(), SessionError>;

    /// Called after the credential has been accepted.
    fn register(&mut self, peer: &PeerIdentity, version: ProtocolVersion) -> Result<SessionId, SessionError>;
}

/// Runs the server side of the handshake within `budget`.
///
/// # Errors
///
/// Any handshake failure; the link has been closed when this returns `Err`.
pub async fn accept_handshake<S: SecureStream>(
    link: &mut MessageLink<S>,
    handshake: &mut Handshake,
    admission: &mut dyn SessionAdmission,
    budget: Duration,
) -> Result<Established, SessionError> {
    run_with_deadline(link, handshake, Some(admission), budget).await
}

/// Runs the client side of the handshake within `budget`.
///
/// # Errors
///
/// Any handshake failure; the link has been closed when this returns `Err`.
pub async fn initiate_handshake<S: SecureStream>(
    link: &mut MessageLink<S>,
    handshake: &mut Handshake,
    budget: Duration,
) -> Result<Established, SessionError> {
    run_with_deadline(link, handshake, None, budget).await
}

async fn run_with_deadline<S: SecureStream>(
    link: &mut MessageLink<S>,
    handshake: &mut Handshake,
    admission: Option<&mut dyn SessionAdmission>,
    budget: Duration,
) -> Result<Established, SessionError> {
    match tokio::time::timeout(budget, drive(link, handshake, admission)).await {
        Ok(result) => result,
        Err(_) => {
            let error = SessionError::ProtocolTimeout {
                budget_ms: budget.as_millis() as u64,
            };
            warn!("handshake in state {} timed out", handshake.state());
            for action in handshake.fail(error.clone()) {
                if let HandshakeAction::Send(message) = action {
                    let _ = tokio::time::timeout(FAREWELL_BUDGET, link.send(&message)).await;
                }
            }
            link.close().await;
            handshake.finish();
            Err(error)
        }
    }
}

async fn drive<S: SecureStream>(
    link: &mut MessageLink<S>,
    handshake: &mut Handshake,
    mut admission: Option<&mut dyn SessionAdmission>,
) -> Result<Established, SessionError> {
    let mut pending: VecDeque<HandshakeAction> = handshake.start().into();

    loop {
        while let Some(action) = pending.pop_front() {
            match action {
                HandshakeAction::Send(message) => {
                    if let Err(e) = link.send(&message).await {
                        // While closing, a failed farewell does not change the outcome.
                        if !handshake.state().is_terminal() {
                            pending.clear();
                            pending.extend(handshake.abort(e));
                        }
                    }
                }
                HandshakeAction::Admit => {
                    let next = match admission.as_deref_mut() {
                        Some(registry) => match registry.admit() {
                            Ok(()) => handshake.admitted(rand::random()),
                            Err(e) => handshake.fail(e),
                        },
                        None => handshake.fail(SessionError::MalformedMessage(
                            "admission requested on the connecting side".to_string(),
                        )),
                    };
                    pending.extend(next);
                }
                HandshakeAction::Register => {
                    let registered = match (admission.as_deref_mut(), handshake.peer().cloned(), handshake.negotiated_version()) {
                        (Some(registry), Some(peer), Some(version)) => registry.register(&peer, version),
                        _ => Err(SessionError::MalformedMessage(
                            "registration requested without a validated peer".to_string(),
                        )),
                    };
                    let next = match registered {
                        Ok(id) => handshake.registered(id),
                        Err(e) => handshake.fail(e),
                    };
                    pending.extend(next);
                }
                HandshakeAction::Established(id) => {
                    link.bind(id);
                    let outcome = handshake.outcome().ok_or_else(|| {
                        SessionError::MalformedMessage("established without a peer".to_string())
                    })?;
                    info!(
                        "session {id} established with {} (protocol {})",
                        outcome.peer, outcome.version
                    );
                    return Ok(outcome);
                }
                HandshakeAction::Close(error) => {
                    debug!("handshake closing: {error}");
                    link.close().await;
                    handshake.finish();
                    return Err(error);
                }
            }
        }

        match link.recv().await {
            Ok(Some(message)) => pending.extend(handshake.on_message(message)),
            Ok(None) => {}
            Err(e) => pending.extend(handshake.fail(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorCode, PROTOCOL_VERSION};
    use crate::session::auth::SharedSecret;
    use crate::transport::TrafficCounters;

    fn server_machine(secret: &str) -> Handshake {
        Handshake::server(
            LocalHello::new(PROTOCOL_VERSION, "server", 0),
            Arc::new(SharedSecret::new(secret)),
        )
    }

    fn client_machine(version: ProtocolVersion, secret: &str) -> Handshake {
        Handshake::client(
            LocalHello::new(version, "client", 0),
            Arc::new(SharedSecret::new(secret)),
        )
    }

    fn sent(actions: &[HandshakeAction]) -> Vec<Message> {
        actions
            .iter()
            .filter_map(|a| match a {
                HandshakeAction::Send(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    /// Delivers every `Send` of `actions` to `peer`, returning the peer's reactions.
    fn deliver(actions: &[HandshakeAction], peer: &mut Handshake) -> Vec<HandshakeAction> {
        sent(actions)
            .into_iter()
            .flat_map(|m| peer.on_message(m))
            .collect()
    }

    #[test]
    fn test_matching_versions_reach_established_on_both_sides() {
        // Arrange
        let mut client = client_machine(PROTOCOL_VERSION, "s3cret");
        let mut server = server_machine("s3cret");
        let session_id = SessionId::generate();

        // Act
        let hello = client.start();
        let server_reply = deliver(&hello, &mut server);
        assert!(server_reply.contains(&HandshakeAction::Admit));
        deliver(&server_reply, &mut client);
        let challenge = server.admitted([9u8; 32]);
        let response = deliver(&challenge, &mut client);
        let verdict = deliver(&response, &mut server);
        assert_eq!(verdict, vec![HandshakeAction::Register]);
        let confirmation = server.registered(session_id);
        let client_done = deliver(&confirmation, &mut client);

        // Assert
        assert_eq!(server.state(), HandshakeState::Established);
        assert_eq!(client.state(), HandshakeState::Established);
        assert_eq!(client_done, vec![HandshakeAction::Established(session_id)]);
        assert_eq!(client.session_id(), Some(session_id));
    }

    #[test]
    fn test_major_mismatch_fails_before_any_auth_message() {
        // Arrange
        let mut client = client_machine(ProtocolVersion::new(2, 0), "s");
        let mut server = server_machine("s");

        // Act
        let reply = deliver(&client.start(), &mut server);

        // Assert
        let messages = sent(&reply);
        assert!(matches!(messages[0], Message::Hello(_)));
        assert!(matches!(&messages[1], Message::Error(e) if e.code == ErrorCode::VersionMismatch));
        assert!(!messages.iter().any(|m| matches!(m, Message::Auth(_))));
        assert!(!reply.contains(&HandshakeAction::Admit));
        assert_eq!(server.state(), HandshakeState::Closing);
        assert!(matches!(
            server.failure(),
            Some(SessionError::VersionMismatch { remote: Some(v), .. }) if v.major == 2
        ));
    }

    #[test]
    fn test_client_detects_mismatch_from_server_hello() {
        let mut client = client_machine(ProtocolVersion::new(2, 0), "s");
        let mut server = server_machine("s");
        let reply = deliver(&client.start(), &mut server);

        deliver(&reply, &mut client);

        assert!(matches!(
            client.failure(),
            Some(SessionError::VersionMismatch { local, remote: Some(remote) })
                if local.major == 2 && remote.major == 1
        ));
    }

    #[test]
    fn test_wrong_secret_is_rejected_with_auth_result() {
        // Arrange
        let mut client = client_machine(PROTOCOL_VERSION, "wrong");
        let mut server = server_machine("right");
        let reply = deliver(&client.start(), &mut server);
        deliver(&reply, &mut client);
        let challenge = server.admitted([1u8; 32]);
        let response = deliver(&challenge, &mut client);

        // Act
        let verdict = deliver(&response, &mut server);
        let client_reaction = deliver(&verdict, &mut client);

        // Assert
        assert_eq!(server.failure(), Some(&SessionError::AuthFailed));
        assert_eq!(client_reaction, vec![HandshakeAction::Close(SessionError::AuthFailed)]);
    }

    #[test]
    fn test_rejected_admission_reports_capacity_and_closes() {
        // Arrange
        let mut client = client_machine(PROTOCOL_VERSION, "s");
        let mut server = server_machine("s");
        let reply = deliver(&client.start(), &mut server);
        deliver(&reply, &mut client);

        // Act
        let rejection = server.fail(SessionError::CapacityExceeded);
        let client_reaction = deliver(&rejection, &mut client);

        // Assert
        assert_eq!(
            client_reaction,
            vec![HandshakeAction::Close(SessionError::CapacityExceeded)]
        );
        assert_eq!(client.state(), HandshakeState::Closing);
    }

    #[test]
    fn test_out_of_order_message_is_malformed() {
        let mut server = server_machine("s");
        let actions = server.on_message(Message::Heartbeat { token: 1 });
        assert!(matches!(
            actions.last(),
            Some(HandshakeAction::Close(SessionError::MalformedMessage(_)))
        ));
    }

    #[test]
    fn test_closed_is_idempotent() {
        // Arrange
        let mut server = server_machine("s");
        server.fail(SessionError::AuthFailed);
        server.finish();

        // Act
        let again = server.fail(SessionError::CapacityExceeded);
        let ignored = server.on_message(Message::Heartbeat { token: 1 });
        server.finish();

        // Assert
        assert!(again.is_empty());
        assert!(ignored.is_empty());
        assert_eq!(server.state(), HandshakeState::Closed);
        assert_eq!(server.failure(), Some(&SessionError::AuthFailed));
    }

    #[test]
    fn test_second_credential_attempt_is_not_possible() {
        let mut server = server_machine("s");
        let hello = client_machine(PROTOCOL_VERSION, "s").start();
        deliver(&hello, &mut server);
        server.admitted([0u8; 32]);
        server.on_message(Message::Auth(AuthMessage::Response {
            credential: vec![0; 32],
        }));

        let retry = server.on_message(Message::Auth(AuthMessage::Response {
            credential: vec![0; 32],
        }));

        assert!(retry.is_empty());
        assert_eq!(server.state(), HandshakeState::Closing);
    }

    // ── Drivers over an in-memory pipe ────────────────────────────────────────

    struct CountingAdmission {
        admitted: usize,
        full: bool,
    }

    impl SessionAdmission for CountingAdmission {
        fn admit(&mut self) -> Result<(), SessionError> {
            if self.full {
                return Err(SessionError::CapacityExceeded);
            }
            self.admitted += 1;
            Ok(())
        }

        fn register(&mut self, _: &PeerIdentity, _: ProtocolVersion) -> Result<SessionId, SessionError> {
            Ok(SessionId::generate())
        }
    }

    fn links() -> (
        MessageLink<tokio::io::DuplexStream>,
        MessageLink<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(4096);
        let counters = TrafficCounters::new();
        (
            MessageLink::new(a, 1, 4096, Arc::clone(&counters)),
            MessageLink::new(b, 1, 4096, counters),
        )
    }

    #[tokio::test]
    async fn test_drivers_agree_on_session_id() {
        // Arrange
        let (mut client_link, mut server_link) = links();
        let mut client = client_machine(PROTOCOL_VERSION, "s");
        let mut server = server_machine("s");
        let mut admission = CountingAdmission {
            admitted: 0,
            full: false,
        };
        let budget = Duration::from_secs(1);

        // Act
        let (client_result, server_result) = tokio::join!(
            initiate_handshake(&mut client_link, &mut client, budget),
            accept_handshake(&mut server_link, &mut server, &mut admission, budget),
        );

        // Assert
        let client_side = client_result.expect("client handshake");
        let server_side = server_result.expect("server handshake");
        assert_eq!(client_side.session_id, server_side.session_id);
        assert_eq!(client_side.peer.name, "server");
        assert_eq!(server_side.peer.name, "client");
        assert_eq!(client_link.session_id(), Some(client_side.session_id));
        assert_eq!(admission.admitted, 1);
    }

    #[tokio::test]
    async fn test_full_registry_surfaces_capacity_exceeded_on_client() {
        let (mut client_link, mut server_link) = links();
        let mut client = client_machine(PROTOCOL_VERSION, "s");
        let mut server = server_machine("s");
        let mut admission = CountingAdmission {
            admitted: 0,
            full: true,
        };
        let budget = Duration::from_secs(1);

        let (client_result, server_result) = tokio::join!(
            initiate_handshake(&mut client_link, &mut client, budget),
            accept_handshake(&mut server_link, &mut server, &mut admission, budget),
        );

        assert_eq!(client_result.unwrap_err(), SessionError::CapacityExceeded);
        assert_eq!(server_result.unwrap_err(), SessionError::CapacityExceeded);
    }

    #[tokio::test]
    async fn test_silent_peer_hits_protocol_timeout() {
        // Arrange – nobody ever answers the client's Hello
        let (mut client_link, _server_link) = links();
        let mut client = client_machine(PROTOCOL_VERSION, "s");

        // Act
        let result =
            initiate_handshake(&mut client_link, &mut client, Duration::from_millis(50)).await;

        // Assert
        assert_eq!(result.unwrap_err(), SessionError::ProtocolTimeout { budget_ms: 50 });
        assert_eq!(client.state(), HandshakeState::Closed);
    }
}

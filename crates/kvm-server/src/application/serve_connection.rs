//! ServeConnectionUseCase: one accepted connection from Hello to Closed.
//!
//! Each accepted stream gets its own task running [`serve_connection`]:
//!
//! 1. Run the server side of the handshake under the configured deadline.
//!    Admission reserves a registry slot; a valid credential commits it.
//! 2. Run the established-session loop until either side closes it or the
//!    peer goes silent.
//! 3. Remove the session from the registry, whatever the outcome.
//!
//! A connection that fails before `Established` never leaves a registry entry
//! behind, including the narrow case where the credential was accepted but
//! the AuthResult could not be delivered.

use std::sync::Arc;

use kvm_core::input::{InputInjector, InputQueue, InputRouter};
use kvm_core::session::{
    accept_handshake, run_session, Authenticator, Handshake, LinkSnapshot, LocalHello,
    MessageLink, SessionAdmission, SessionContext, SessionEnd, SessionObserver,
};
use kvm_core::{
    MetricsSink, PeerIdentity, ProtocolConfig, ProtocolVersion, SecureStream, SessionError,
    SessionId, TrafficCounters,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::application::manage_sessions::{NewSession, SessionControl, SessionManager, SlotReservation};

/// Capacity of a session's control channel.
const COMMAND_BUFFER: usize = 8;

/// Shared, read-only collaborators of every connection task.
pub struct ServerContext {
    pub manager: Arc<SessionManager>,
    pub local: LocalHello,
    pub authenticator: Arc<dyn Authenticator>,
    pub injector: Arc<dyn InputInjector>,
    pub metrics: Arc<dyn MetricsSink>,
    pub protocol: ProtocolConfig,
    pub counters: Arc<TrafficCounters>,
}

/// Bridges handshake admission to the registry.
struct RegistryAdmission {
    manager: Arc<SessionManager>,
    reservation: Option<SlotReservation>,
    control: Option<SessionControl>,
    registered: Option<SessionId>,
}

impl SessionAdmission for RegistryAdmission {
    fn admit(&mut self) -> Result<(), SessionError> {
        self.reservation = Some(self.manager.reserve()?);
        Ok(())
    }

    fn register(&mut self, peer: &PeerIdentity, version: ProtocolVersion) -> Result<SessionId, SessionError> {
        let reservation = self.reservation.take().ok_or(SessionError::CapacityExceeded)?;
        let session_id = reservation.commit(NewSession {
            peer: peer.clone(),
            version,
            control: self.control.take(),
        });
        self.registered = Some(session_id);
        Ok(session_id)
    }
}

/// Publishes heartbeat progress into the registry record.
struct RegistryObserver {
    manager: Arc<SessionManager>,
}

impl SessionObserver for RegistryObserver {
    fn on_progress(&self, snapshot: &LinkSnapshot) {
        self.manager.update(snapshot);
    }
}

/// Serves one accepted connection until it closes.
///
/// # Errors
///
/// The handshake failure or the fatal error that ended the session.
pub async fn serve_connection<S: SecureStream>(
    stream: S,
    peer_addr: String,
    ctx: Arc<ServerContext>,
) -> Result<SessionEnd, SessionError> {
    let mut link = MessageLink::new(
        stream,
        ctx.local.version.major,
        ctx.protocol.max_frame_size,
        Arc::clone(&ctx.counters),
    );
    let outbound = InputQueue::new(ctx.protocol.input_queue_capacity);
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
    let mut admission = RegistryAdmission {
        manager: Arc::clone(&ctx.manager),
        reservation: None,
        control: Some(SessionControl {
            commands: commands_tx,
            outbound: Arc::clone(&outbound),
        }),
        registered: None,
    };
    let mut handshake = Handshake::server(ctx.local.clone(), Arc::clone(&ctx.authenticator));

    let established = match accept_handshake(
        &mut link,
        &mut handshake,
        &mut admission,
        ctx.protocol.handshake_timeout(),
    )
    .await
    {
        Ok(established) => established,
        Err(e) => {
            if let Some(orphan) = admission.registered.take() {
                ctx.manager.remove(orphan);
            }
            warn!("handshake with {peer_addr} failed: {e}");
            return Err(e);
        }
    };

    let session_id = established.session_id;
    info!(
        "session {session_id} established with {} at {peer_addr} (v{})",
        established.peer, established.version
    );

    let session = SessionContext {
        session_id,
        local_version: ctx.local.version,
        heartbeat_interval: ctx.protocol.heartbeat_interval(),
        drain_timeout: ctx.protocol.drain_timeout(),
        router: InputRouter::new(session_id, outbound, Arc::clone(&ctx.injector)),
        commands: commands_rx,
        observer: Arc::new(RegistryObserver {
            manager: Arc::clone(&ctx.manager),
        }),
        metrics: Arc::clone(&ctx.metrics),
    };
    let outcome = run_session(link, session).await;
    ctx.manager.remove(session_id);
    outcome
}

// ── Tests ─────────────────────────────────────────────────────────────────────

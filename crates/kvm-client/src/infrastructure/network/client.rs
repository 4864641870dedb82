//! KvmClient: the client-side facade.
//!
//! Owns at most one session at a time and exposes the operations the binary
//! and the automation console call:
//!
//! | Operation                | Effect                                            |
//! |--------------------------|---------------------------------------------------|
//! | `connect(address)`       | connect, handshake, start the session task        |
//! | `get_connection_status`  | connected?, session id, latest RTT, last error    |
//! | `disconnect(id)`         | close the session gracefully and wait for it      |
//! | `send_input(event)`      | queue one event for the server                    |
//! | `run_with_reconnect`     | keep a session alive with backoff                 |
//!
//! # Status bookkeeping (for beginners)
//!
//! The session itself runs in its own Tokio task, so the facade cannot simply
//! look at local variables to answer "am I connected?". Instead the task and
//! the facade share a small `ClientState` behind a `std::sync::Mutex`:
//!
//! - the task's observer writes the latest heartbeat RTT into it;
//! - when the task finishes it clears the active session and records the
//!   error that ended it;
//! - the facade reads it for `get_connection_status`.
//!
//! The lock is only ever held for a few field assignments, never across an
//! `.await`, so a plain std mutex is the right tool here.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use kvm_core::input::{InputInjector, InputQueue, InputRouter, PushError, PushOutcome};
use kvm_core::protocol::capabilities;
use kvm_core::session::{
    run_session, CredentialSource, LinkSnapshot, LocalHello, SessionCommand, SessionContext,
    SessionEnd, SessionObserver, SharedSecret,
};
use kvm_core::{
    CloseReason, InputEvent, MetricsSink, ProtocolConfig, ProtocolVersion, SecureConnector,
    SessionError, SessionId, TracingMetrics, TrafficCounters, PROTOCOL_VERSION,
};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::application::establish_session::establish_session;
use crate::application::reconnect::{
    BackoffPolicy, ReconnectController, ReconnectEvent, ReconnectOutcome, SessionEstablisher,
};
use crate::infrastructure::input_injection::LoggingInjector;
use crate::infrastructure::storage::config::ClientConfig;

/// Capacity of the session's control channel.
const COMMAND_BUFFER: usize = 8;

/// Construction parameters for [`KvmClient`].
pub struct ClientSettings {
    pub name: String,
    pub protocol_version: ProtocolVersion,
    pub protocol: ProtocolConfig,
    pub backoff: BackoffPolicy,
    pub credentials: Arc<dyn CredentialSource>,
    pub injector: Arc<dyn InputInjector>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl ClientSettings {
    /// Settings with default tuning, tracing metrics and a logging injector.
    pub fn new(name: impl Into<String>, shared_secret: impl AsRef<[u8]>) -> Self {
        Self {
            name: name.into(),
            protocol_version: PROTOCOL_VERSION,
            protocol: ProtocolConfig::default(),
            backoff: BackoffPolicy::default(),
            credentials: Arc::new(SharedSecret::new(shared_secret)),
            injector: Arc::new(LoggingInjector::new()),
            metrics: Arc::new(TracingMetrics),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            protocol_version: config.client.protocol_version,
            protocol: config.protocol.clone(),
            backoff: config.reconnect.clone(),
            ..Self::new(config.client.name.clone(), &config.auth.shared_secret)
        }
    }
}

/// Answer to [`KvmClient::get_connection_status`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub session_id: Option<SessionId>,
    pub last_rtt_ms: Option<u64>,
    /// The error that ended the last session or connection attempt. Cleared
    /// when a new attempt begins.
    pub last_error: Option<SessionError>,
}

type SessionOutcome = Result<SessionEnd, SessionError>;

struct ActiveSession {
    session_id: SessionId,
    commands: mpsc::Sender<SessionCommand>,
    outbound: Arc<InputQueue>,
    ended: watch::Receiver<Option<SessionOutcome>>,
}

#[derive(Default)]
struct ClientState {
    active: Option<ActiveSession>,
    last_rtt: Option<Duration>,
    last_error: Option<SessionError>,
    last_end: Option<(SessionId, SessionOutcome)>,
}

fn lock(state: &Mutex<ClientState>) -> MutexGuard<'_, ClientState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publishes heartbeat RTTs into the shared status.
struct StatusObserver {
    state: Arc<Mutex<ClientState>>,
}

impl SessionObserver for StatusObserver {
    fn on_progress(&self, snapshot: &LinkSnapshot) {
        let mut state = lock(&self.state);
        let current = state.active.as_ref().map(|a| a.session_id);
        if current == Some(snapshot.session_id) && snapshot.rtt.is_some() {
            state.last_rtt = snapshot.rtt;
        }
    }
}

pub struct KvmClient<C> {
    connector: C,
    local: LocalHello,
    protocol: ProtocolConfig,
    backoff: BackoffPolicy,
    credentials: Arc<dyn CredentialSource>,
    injector: Arc<dyn InputInjector>,
    metrics: Arc<dyn MetricsSink>,
    counters: Arc<TrafficCounters>,
    state: Arc<Mutex<ClientState>>,
}

impl<C: SecureConnector> KvmClient<C> {
    /// # Errors
    ///
    /// [`InvalidConfig`](kvm_core::config::InvalidConfig) if the protocol or
    /// backoff tuning is unusable.
    pub fn new(connector: C, settings: ClientSettings) -> Result<Arc<Self>, kvm_core::config::InvalidConfig> {
        settings.protocol.validate()?;
        settings.backoff.validate()?;
        Ok(Arc::new(Self {
            connector,
            local: LocalHello::new(settings.protocol_version, settings.name, capabilities::DEFAULT),
            protocol: settings.protocol,
            backoff: settings.backoff,
            credentials: settings.credentials,
            injector: settings.injector,
            metrics: settings.metrics,
            counters: TrafficCounters::new(),
            state: Arc::new(Mutex::new(ClientState::default())),
        }))
    }

    /// Connects to `address`, completes the handshake and starts the session.
    ///
    /// A session that is still open is closed first.
    ///
    /// # Errors
    ///
    /// [`SessionError::ConnectionLost`] if the server is unreachable, or the
    /// handshake failure (`VersionMismatch`, `AuthFailed`, `CapacityExceeded`,
    /// `ProtocolTimeout`, `MalformedMessage`).
    pub async fn connect(&self, address: &str) -> Result<SessionId, SessionError> {
        if let Some(previous) = self.get_connection_status().session_id {
            info!("closing session {previous} before reconnecting");
            let _ = self.disconnect(previous).await;
        }
        lock(&self.state).last_error = None;

        info!("connecting to {address}");
        let (link, established) = match establish_session(
            &self.connector,
            address,
            &self.local,
            Arc::clone(&self.credentials),
            &self.protocol,
            Arc::clone(&self.counters),
        )
        .await
        {
            Ok(connected) => connected,
            Err(e) => {
                warn!("connection to {address} failed: {e}");
                lock(&self.state).last_error = Some(e.clone());
                return Err(e);
            }
        };

        let session_id = established.session_id;
        info!(
            "session {session_id} established with {} (v{})",
            established.peer, established.version
        );

        let outbound = InputQueue::new(self.protocol.input_queue_capacity);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (ended_tx, ended_rx) = watch::channel(None);
        {
            let mut state = lock(&self.state);
            state.active = Some(ActiveSession {
                session_id,
                commands: commands_tx,
                outbound: Arc::clone(&outbound),
                ended: ended_rx,
            });
            state.last_rtt = None;
        }

        let ctx = SessionContext {
            session_id,
            local_version: self.local.version,
            heartbeat_interval: self.protocol.heartbeat_interval(),
            drain_timeout: self.protocol.drain_timeout(),
            router: InputRouter::new(session_id, outbound, Arc::clone(&self.injector)),
            commands: commands_rx,
            observer: Arc::new(StatusObserver {
                state: Arc::clone(&self.state),
            }),
            metrics: Arc::clone(&self.metrics),
        };
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let outcome = run_session(link, ctx).await;
            match &outcome {
                Ok(end) => info!("session {session_id} closed: {:?} by {:?}", end.reason, end.initiator),
                Err(e) => warn!("session {session_id} ended: {e}"),
            }
            let mut state = lock(&state);
            if state.active.as_ref().is_some_and(|a| a.session_id == session_id) {
                state.active = None;
            }
            if let Err(e) = &outcome {
                state.last_error = Some(e.clone());
            }
            state.last_end = Some((session_id, outcome.clone()));
            ended_tx.send_replace(Some(outcome));
        });

        Ok(session_id)
    }

    pub fn get_connection_status(&self) -> ConnectionStatus {
        let state = lock(&self.state);
        ConnectionStatus {
            connected: state.active.is_some(),
            session_id: state.active.as_ref().map(|a| a.session_id),
            last_rtt_ms: state.last_rtt.map(|rtt| rtt.as_millis() as u64),
            last_error: state.last_error.clone(),
        }
    }

    /// Closes the session with `UserInitiated` and waits for its close
    /// sequence to finish.
    ///
    /// # Errors
    ///
    /// [`SessionError::SessionNotFound`] if `session_id` is not the live
    /// session.
    pub async fn disconnect(&self, session_id: SessionId) -> Result<(), SessionError> {
        let commands = {
            let state = lock(&self.state);
            match &state.active {
                Some(active) if active.session_id == session_id => active.commands.clone(),
                _ => return Err(SessionError::SessionNotFound(session_id)),
            }
        };
        // A full buffer already holds a close request; a closed one means the
        // session is ending on its own.
        let _ = commands.try_send(SessionCommand::Close(CloseReason::UserInitiated));
        let _ = self.wait_closed(session_id).await;
        Ok(())
    }

    /// Waits for `session_id` to end and returns how it ended.
    ///
    /// # Errors
    ///
    /// The error that ended the session, or
    /// [`SessionError::SessionNotFound`] for an id this client never ran or
    /// has since replaced.
    pub async fn wait_closed(&self, session_id: SessionId) -> Result<SessionEnd, SessionError> {
        let mut ended = {
            let state = lock(&self.state);
            match (&state.active, &state.last_end) {
                (Some(active), _) if active.session_id == session_id => active.ended.clone(),
                (_, Some((id, outcome))) if *id == session_id => return outcome.clone(),
                _ => return Err(SessionError::SessionNotFound(session_id)),
            }
        };
        loop {
            let current = ended.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if ended.changed().await.is_err() {
                return Err(SessionError::ConnectionLost(format!(
                    "session {session_id} task stopped unexpectedly"
                )));
            }
        }
    }

    /// Queues `event` for the server. Returns `Ok(None)` when not connected.
    ///
    /// # Errors
    ///
    /// [`SessionError::SessionNotFound`] if the session closed meanwhile.
    pub async fn send_input(&self, event: InputEvent) -> Result<Option<PushOutcome>, SessionError> {
        let target = lock(&self.state)
            .active
            .as_ref()
            .map(|a| (a.session_id, Arc::clone(&a.outbound)));
        let Some((session_id, outbound)) = target else {
            return Ok(None);
        };
        outbound.push(event).await.map(Some).map_err(|e| match e {
            PushError::Full(_) | PushError::Closed(_) => SessionError::SessionNotFound(session_id),
        })
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Connects to `address` and reconnects with backoff whenever the
    /// connection is lost, until `cancel` turns `true`.
    ///
    /// On cancellation the live session, if any, is closed gracefully.
    ///
    /// # Errors
    ///
    /// A handshake rejection, or the last connection loss once the give-up
    /// policy triggers.
    pub async fn run_with_reconnect(
        self: &Arc<Self>,
        address: &str,
        cancel: watch::Receiver<bool>,
        events: Option<mpsc::UnboundedSender<ReconnectEvent>>,
    ) -> Result<ReconnectOutcome, SessionError> {
        let mut controller = ReconnectController::new(Arc::clone(self), self.backoff.clone());
        if let Some(events) = events {
            controller = controller.with_events(events);
        }
        let outcome = controller.run(address, cancel).await;
        if outcome == Ok(ReconnectOutcome::Cancelled) {
            if let Some(session_id) = self.get_connection_status().session_id {
                let _ = self.disconnect(session_id).await;
            }
        }
        outcome
    }
}

#[async_trait]
impl<C: SecureConnector> SessionEstablisher for KvmClient<C> {
    async fn establish(&self, target: &str) -> Result<SessionId, SessionError> {
        self.connect(target).await
    }

    async fn wait_closed(&self, session_id: SessionId) -> Result<SessionEnd, SessionError> {
        KvmClient::wait_closed(self, session_id).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

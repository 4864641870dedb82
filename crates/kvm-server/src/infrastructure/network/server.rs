//! KvmServer: the server-side facade.
//!
//! Owns the session registry and the shared collaborators, runs the accept
//! loop, and exposes the operations the binary and the automation console
//! call:
//!
//! | Operation              | Effect                                              |
//! |------------------------|-----------------------------------------------------|
//! | `start_server(addr)`   | bind TCP and start accepting                        |
//! | `serve(acceptor)`      | accept from any [`SecureAcceptor`]                  |
//! | `get_active_sessions`  | number of established sessions                      |
//! | `sessions`             | snapshot of established sessions                    |
//! | `disconnect(id)`       | gracefully close one session                        |
//! | `connection_stats`     | session count, latest RTT, byte counters            |
//! | `send_input(event)`    | queue one event for the focused session             |
//! | `shutdown`             | stop accepting and close every session              |

use std::net::SocketAddr;
use std::sync::Arc;

use kvm_core::config::InvalidConfig;
use kvm_core::input::{InputCapture, InputInjector, PushOutcome};
use kvm_core::protocol::capabilities;
use kvm_core::session::{Authenticator, LocalHello, SessionCommand, SharedSecret};
use kvm_core::{
    CloseReason, ConnectionStats, InputEvent, MetricsSink, ProtocolConfig, SecureAcceptor,
    Session, SessionError, SessionId, TracingMetrics, TrafficCounters, PROTOCOL_VERSION,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::application::forward_input::InputForwarder;
use crate::application::manage_sessions::SessionManager;
use crate::application::serve_connection::{serve_connection, ServerContext};
use crate::infrastructure::input_capture::LogOnlyInjector;
use crate::infrastructure::storage::config::ServerConfig;

/// Errors raised while starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind failed on {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    InvalidConfig(#[from] InvalidConfig),
}

/// Construction parameters for [`KvmServer`].
pub struct ServerSettings {
    pub name: String,
    pub max_clients: usize,
    pub protocol: ProtocolConfig,
    pub authenticator: Arc<dyn Authenticator>,
    pub injector: Arc<dyn InputInjector>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl ServerSettings {
    /// Settings with default protocol tuning, tracing metrics and a
    /// log-only injector.
    pub fn new(name: impl Into<String>, max_clients: usize, shared_secret: impl AsRef<[u8]>) -> Self {
        Self {
            name: name.into(),
            max_clients,
            protocol: ProtocolConfig::default(),
            authenticator: Arc::new(SharedSecret::new(shared_secret)),
            injector: Arc::new(LogOnlyInjector),
            metrics: Arc::new(TracingMetrics),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            protocol: config.protocol.clone(),
            ..Self::new(
                config.server.name.clone(),
                config.server.max_clients,
                &config.auth.shared_secret,
            )
        }
    }
}

pub struct KvmServer {
    ctx: Arc<ServerContext>,
    forwarder: Arc<InputForwarder>,
    stop: watch::Sender<bool>,
}

impl KvmServer {
    /// # Errors
    ///
    /// [`ServerError::InvalidConfig`] if the protocol tuning is unusable.
    pub fn new(settings: ServerSettings) -> Result<Arc<Self>, ServerError> {
        settings.protocol.validate()?;
        let manager = SessionManager::new(settings.max_clients, Arc::clone(&settings.metrics));
        let ctx = Arc::new(ServerContext {
            manager: Arc::clone(&manager),
            local: LocalHello::new(PROTOCOL_VERSION, settings.name, capabilities::DEFAULT),
            authenticator: settings.authenticator,
            injector: settings.injector,
            metrics: settings.metrics,
            protocol: settings.protocol,
            counters: TrafficCounters::new(),
        });
        let (stop, _) = watch::channel(false);
        Ok(Arc::new(Self {
            ctx,
            forwarder: Arc::new(InputForwarder::new(manager)),
            stop,
        }))
    }

    /// Binds a TCP listener and starts accepting. Returns the bound address.
    ///
    /// # Errors
    ///
    /// [`ServerError::BindFailed`] if the address cannot be bound.
    pub async fn start_server(&self, bind_address: &str) -> Result<SocketAddr, ServerError> {
        let bind_failed = |source| ServerError::BindFailed {
            address: bind_address.to_string(),
            source,
        };
        let acceptor = crate::infrastructure::network::tcp::TcpAcceptor::bind(bind_address)
            .await
            .map_err(bind_failed)?;
        let local = acceptor.local_addr().map_err(bind_failed)?;
        info!("listening on {local}");
        self.serve(acceptor);
        Ok(local)
    }

    /// Accepts connections from `acceptor` until [`shutdown`](Self::shutdown).
    pub fn serve<A: SecureAcceptor>(&self, acceptor: A) -> JoinHandle<()> {
        let ctx = Arc::clone(&self.ctx);
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            let already_stopped = *stop.borrow();
            if already_stopped {
                return;
            }
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    accepted = acceptor.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("accepted connection from {peer}");
                            let ctx = Arc::clone(&ctx);
                            tokio::spawn(async move {
                                match serve_connection(stream, peer.clone(), ctx).await {
                                    Ok(end) => debug!("connection from {peer} finished: {end:?}"),
                                    Err(e) => debug!("connection from {peer} failed: {e}"),
                                }
                            });
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::NotConnected => {
                            warn!("acceptor shut down: {e}");
                            break;
                        }
                        Err(e) => {
                            error!("accept failed: {e}");
                            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        }
                    },
                }
            }
            info!("accept loop stopped");
        })
    }

    /// Spawns a task forwarding everything `capture` produces to the focused
    /// session.
    pub fn forward_from<C: InputCapture + 'static>(&self, mut capture: C) -> JoinHandle<u64> {
        let forwarder = Arc::clone(&self.forwarder);
        tokio::spawn(async move { forwarder.run(&mut capture).await })
    }

    /// Number of established sessions.
    pub fn get_active_sessions(&self) -> u32 {
        self.ctx.manager.list_active() as u32
    }

    /// Established sessions, oldest first.
    pub fn sessions(&self) -> Vec<Session> {
        self.ctx.manager.sessions()
    }

    /// Asks a session to close gracefully with `UserInitiated`.
    ///
    /// The registry entry disappears once the session task has finished its
    /// close sequence.
    ///
    /// # Errors
    ///
    /// [`SessionError::SessionNotFound`] if no live session has this id.
    pub fn disconnect(&self, session_id: SessionId) -> Result<(), SessionError> {
        self.close_session(session_id, CloseReason::UserInitiated)
    }

    fn close_session(&self, session_id: SessionId, reason: CloseReason) -> Result<(), SessionError> {
        let control = self
            .ctx
            .manager
            .control(session_id)
            .ok_or(SessionError::SessionNotFound(session_id))?;
        match control.commands.try_send(SessionCommand::Close(reason)) {
            // A full buffer already holds a close request.
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SessionError::SessionNotFound(session_id)),
        }
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        ConnectionStats {
            active_session_count: self.ctx.manager.list_active() as u32,
            last_rtt_ms: self.ctx.manager.latest_rtt().map(|rtt| rtt.as_millis() as u64),
            bytes_sent: self.ctx.counters.bytes_sent(),
            bytes_received: self.ctx.counters.bytes_received(),
        }
    }

    /// Queues `event` for the focused session.
    ///
    /// # Errors
    ///
    /// [`SessionError::SessionNotFound`] if the target closed meanwhile.
    pub async fn send_input(&self, event: InputEvent) -> Result<Option<PushOutcome>, SessionError> {
        self.forwarder.forward(event).await
    }

    /// Pins forwarded input to one session (`None` follows the newest).
    ///
    /// # Errors
    ///
    /// [`SessionError::SessionNotFound`] for an unknown id.
    pub fn set_focus(&self, session_id: Option<SessionId>) -> Result<(), SessionError> {
        self.forwarder.set_focus(session_id)
    }

    pub fn max_clients(&self) -> usize {
        self.ctx.manager.max_clients()
    }

    /// Stops accepting and closes every session with `ServerShutdown`.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
        let sessions = self.ctx.manager.sessions();
        info!("shutting down {} sessions", sessions.len());
        for session in sessions {
            let _ = self.close_session(session.session_id, CloseReason::ServerShutdown);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

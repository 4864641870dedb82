//! SessionManager: the server's registry of established sessions.
//!
//! The registry is the only state shared between connection tasks. Every
//! session that reached `Established` has exactly one entry here, keyed by
//! its [`SessionId`], together with the handle used to control it.
//!
//! # Capacity (for beginners)
//!
//! `max_clients` limits the number of live sessions. Checking the count only
//! when a session is created would let several handshakes that are running
//! at the same time all pass the check and overshoot the limit. Instead, a
//! connection takes a [`SlotReservation`] as soon as the peer's Hello is
//! accepted:
//!
//! ```text
//! Hello accepted ──► reserve() ──► credential ok ──► commit()  ──► session
//!                        │                │
//!                        │                └── credential bad ──► drop  ──► slot freed
//!                        └── registry full ──► CapacityExceeded
//! ```
//!
//! Reservations count against the limit exactly like sessions, so at most
//! `max_clients` connections can ever be past the Hello step.
//!
//! # Locking
//!
//! A `std::sync::RwLock` guards the registry. Status queries take the read
//! lock and may run concurrently; mutations take the write lock. No lock is
//! ever held across an `.await`, which is why the synchronous lock is the
//! right choice here.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use kvm_core::input::InputQueue;
use kvm_core::session::{LinkSnapshot, SessionCommand};
use kvm_core::{
    HandshakeState, MetricsSink, PeerIdentity, ProtocolVersion, Session, SessionError, SessionId,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Handle used to steer a running session from outside its task.
#[derive(Clone)]
pub struct SessionControl {
    pub commands: mpsc::Sender<SessionCommand>,
    pub outbound: Arc<InputQueue>,
}

/// Everything needed to create a registry entry.
pub struct NewSession {
    pub peer: PeerIdentity,
    pub version: ProtocolVersion,
    pub control: Option<SessionControl>,
}

struct Entry {
    session: Session,
    control: Option<SessionControl>,
}

struct Registry {
    sessions: HashMap<SessionId, Entry>,
    reserved: usize,
    max_clients: usize,
}

impl Registry {
    fn occupied(&self) -> usize {
        self.sessions.len() + self.reserved
    }

    fn insert(&mut self, new: NewSession) -> SessionId {
        let mut session_id = SessionId::generate();
        while self.sessions.contains_key(&session_id) {
            session_id = SessionId::generate();
        }
        let now = Instant::now();
        let session = Session {
            session_id,
            peer_identity: new.peer,
            state: HandshakeState::Established,
            established_at: now,
            last_heartbeat_at: now,
            negotiated_version: new.version,
            outbound_seq: 0,
            inbound_seq: 0,
            last_rtt: None,
        };
        self.sessions.insert(
            session_id,
            Entry {
                session,
                control: new.control,
            },
        );
        session_id
    }
}

/// Registry of established sessions.
pub struct SessionManager {
    inner: RwLock<Registry>,
    metrics: Arc<dyn MetricsSink>,
}

impl SessionManager {
    pub fn new(max_clients: usize, metrics: Arc<dyn MetricsSink>) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Registry {
                sessions: HashMap::new(),
                reserved: 0,
                max_clients,
            }),
            metrics,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_clients(&self) -> usize {
        self.read().max_clients
    }

    /// Holds one slot for a connection that is still authenticating.
    ///
    /// # Errors
    ///
    /// [`SessionError::CapacityExceeded`] when live sessions plus pending
    /// reservations already reach `max_clients`.
    pub fn reserve(self: &Arc<Self>) -> Result<SlotReservation, SessionError> {
        let mut registry = self.write();
        if registry.occupied() >= registry.max_clients {
            debug!(
                "registry full: {} sessions, {} pending",
                registry.sessions.len(),
                registry.reserved
            );
            return Err(SessionError::CapacityExceeded);
        }
        registry.reserved += 1;
        Ok(SlotReservation {
            manager: Arc::clone(self),
            held: true,
        })
    }

    /// Creates a session without a prior reservation.
    ///
    /// # Errors
    ///
    /// [`SessionError::CapacityExceeded`] when the registry is full.
    pub fn create(&self, new: NewSession) -> Result<SessionId, SessionError> {
        let (session_id, count) = {
            let mut registry = self.write();
            if registry.occupied() >= registry.max_clients {
                return Err(SessionError::CapacityExceeded);
            }
            let id = registry.insert(new);
            (id, registry.sessions.len())
        };
        self.on_created(session_id, count);
        Ok(session_id)
    }

    fn on_created(&self, session_id: SessionId, count: usize) {
        info!("session {session_id} registered ({count} active)");
        self.metrics.record_active_sessions(count as u32);
    }

    pub fn lookup(&self, session_id: SessionId) -> Option<Session> {
        self.read()
            .sessions
            .get(&session_id)
            .map(|entry| entry.session.clone())
    }

    /// Removes a session. Returns the final record, or `None` if it was
    /// already gone.
    pub fn remove(&self, session_id: SessionId) -> Option<Session> {
        let (removed, count) = {
            let mut registry = self.write();
            let removed = registry.sessions.remove(&session_id);
            (removed, registry.sessions.len())
        };
        let entry = removed?;
        info!("session {session_id} removed ({count} active)");
        self.metrics.record_active_sessions(count as u32);
        Some(entry.session)
    }

    /// Number of established sessions.
    pub fn list_active(&self) -> usize {
        self.read().sessions.len()
    }

    /// Snapshot of every established session, oldest first.
    pub fn sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .read()
            .sessions
            .values()
            .map(|entry| entry.session.clone())
            .collect();
        sessions.sort_by_key(|s| s.established_at);
        sessions
    }

    /// The most recently established session.
    pub fn newest(&self) -> Option<SessionId> {
        self.read()
            .sessions
            .values()
            .max_by_key(|entry| entry.session.established_at)
            .map(|entry| entry.session.session_id)
    }

    /// Folds a worker progress report into the session's record.
    pub fn update(&self, snapshot: &LinkSnapshot) {
        if let Some(entry) = self.write().sessions.get_mut(&snapshot.session_id) {
            entry.session.apply(snapshot);
        }
    }

    pub fn control(&self, session_id: SessionId) -> Option<SessionControl> {
        self.read()
            .sessions
            .get(&session_id)
            .and_then(|entry| entry.control.clone())
    }

    /// Round-trip time of the most recent measurement across all sessions.
    pub fn latest_rtt(&self) -> Option<std::time::Duration> {
        self.read()
            .sessions
            .values()
            .filter(|entry| entry.session.last_rtt.is_some())
            .max_by_key(|entry| entry.session.last_heartbeat_at)
            .and_then(|entry| entry.session.last_rtt)
    }

    fn release(&self) {
        let mut registry = self.write();
        registry.reserved = registry.reserved.saturating_sub(1);
    }

    fn commit(&self, new: NewSession) -> SessionId {
        let (session_id, count) = {
            let mut registry = self.write();
            registry.reserved = registry.reserved.saturating_sub(1);
            let id = registry.insert(new);
            (id, registry.sessions.len())
        };
        self.on_created(session_id, count);
        session_id
    }
}

/// A held registry slot. Released when dropped unless committed.
pub struct SlotReservation {
    manager: Arc<SessionManager>,
    held: bool,
}

impl SlotReservation {
    /// Turns the slot into a session.
    pub fn commit(mut self, new: NewSession) -> SessionId {
        self.held = false;
        self.manager.commit(new)
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if self.held {
            self.manager.release();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! ReconnectUseCase: keeps a client session alive across connection loss.
//!
//! The controller drives a [`SessionEstablisher`] in a loop:
//!
//! ```text
//!   establish ──ok──> wait until closed ──graceful──> stop (Closed)
//!       │                    │
//!       │ err                │ err
//!       ▼                    ▼
//!   ConnectionLost? ──no──> stop (Err)
//!       │ yes
//!       ▼
//!   sleep(backoff(attempt)) ──> establish ...
//! ```
//!
//! Every retry re-runs the whole chain from a fresh connection; nothing from
//! the lost session is carried over.
//!
//! # Exponential backoff (for beginners)
//!
//! Retrying immediately after a failure hammers a server that may already be
//! struggling. Instead, the wait doubles after each consecutive failure,
//! starting from `base_delay_ms` and never exceeding `max_delay_ms`:
//!
//! ```text
//! attempt:  1     2     3      4      5 ...
//! delay:    250   500   1000   2000   4000 → capped at 5000 (ms)
//! ```
//!
//! A small random *jitter* (±10 % by default) spreads the retries of many
//! clients that lost the same server at the same moment.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kvm_core::config::InvalidConfig;
use kvm_core::session::SessionEnd;
use kvm_core::{SessionError, SessionId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

// ── Backoff policy ────────────────────────────────────────────────────────────

/// Retry timing, configurable through the `[reconnect]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound of any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Relative spread applied to each delay, `0.0..1.0`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Consecutive failed attempts before giving up; `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_base_delay_ms() -> u64 {
    250
}
fn default_max_delay_ms() -> u64 {
    5_000
}
fn default_jitter() -> f64 {
    0.1
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let millis = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Delay before retry number `attempt`, with jitter drawn from `rng`.
    ///
    /// The result never exceeds `max_delay_ms`.
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let factor = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
        nominal
            .mul_f64(factor.max(0.0))
            .min(Duration::from_millis(self.max_delay_ms))
    }

    /// Checks ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// [`InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.base_delay_ms == 0 {
            return Err(InvalidConfig {
                field: "base_delay_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(InvalidConfig {
                field: "max_delay_ms",
                reason: format!("must be at least base_delay_ms ({})", self.base_delay_ms),
            });
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(InvalidConfig {
                field: "jitter",
                reason: "must be in 0.0..1.0".to_string(),
            });
        }
        Ok(())
    }
}

// ── Controller ────────────────────────────────────────────────────────────────

/// Opens sessions on behalf of the controller.
#[async_trait]
pub trait SessionEstablisher: Send + Sync {
    /// Runs connect and handshake against `target`.
    async fn establish(&self, target: &str) -> Result<SessionId, SessionError>;

    /// Waits for an established session to end.
    async fn wait_closed(&self, session_id: SessionId) -> Result<SessionEnd, SessionError>;
}

/// Progress reports of a running controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectEvent {
    Established { session_id: SessionId },
    Lost(SessionError),
    RetryScheduled { attempt: u32, delay: Duration },
    GaveUp { attempts: u32 },
}

/// How a controller run ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// The cancel signal fired.
    Cancelled,
    /// The session closed gracefully; graceful closes are not retried.
    Closed(SessionEnd),
}

pub struct ReconnectController<E: ?Sized> {
    establisher: Arc<E>,
    policy: BackoffPolicy,
    events: Option<mpsc::UnboundedSender<ReconnectEvent>>,
}

impl<E: SessionEstablisher + ?Sized> ReconnectController<E> {
    pub fn new(establisher: Arc<E>, policy: BackoffPolicy) -> Self {
        Self {
            establisher,
            policy,
            events: None,
        }
    }

    /// Reports progress on `events` as well as in the log.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ReconnectEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: ReconnectEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Keeps a session to `target` alive until `cancel` turns `true`, a
    /// session closes gracefully, or a non-retryable error occurs.
    ///
    /// # Errors
    ///
    /// The first error that is not [`SessionError::ConnectionLost`], or the
    /// last `ConnectionLost` once `max_attempts` is exhausted.
    pub async fn run(
        &self,
        target: &str,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<ReconnectOutcome, SessionError> {
        let mut attempt = 0u32;
        loop {
            let established = tokio::select! {
                _ = cancelled(&mut cancel) => return Ok(ReconnectOutcome::Cancelled),
                result = self.establisher.establish(target) => result,
            };

            let error = match established {
                Ok(session_id) => {
                    attempt = 0;
                    info!("session {session_id} established with {target}");
                    self.emit(ReconnectEvent::Established { session_id });
                    let ended = tokio::select! {
                        _ = cancelled(&mut cancel) => return Ok(ReconnectOutcome::Cancelled),
                        ended = self.establisher.wait_closed(session_id) => ended,
                    };
                    match ended {
                        Ok(end) => {
                            info!("session {session_id} closed ({:?}); not reconnecting", end.reason);
                            return Ok(ReconnectOutcome::Closed(end));
                        }
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                warn!("giving up on {target}: {error}");
                return Err(error);
            }
            self.emit(ReconnectEvent::Lost(error.clone()));

            attempt = attempt.saturating_add(1);
            if self.policy.max_attempts.is_some_and(|max| attempt > max) {
                warn!("giving up on {target} after {} failed attempts", attempt - 1);
                self.emit(ReconnectEvent::GaveUp { attempts: attempt - 1 });
                return Err(error);
            }

            let delay = self.policy.delay_for(attempt, &mut rand::thread_rng());
            info!("{error}; retry {attempt} in {} ms", delay.as_millis());
            self.emit(ReconnectEvent::RetryScheduled { attempt, delay });
            tokio::select! {
                _ = cancelled(&mut cancel) => return Ok(ReconnectOutcome::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Resolves once `cancel` reads `true`. A dropped sender never cancels.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        let stop = *cancel.borrow_and_update();
        if stop {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_core::session::CloseInitiator;
    use kvm_core::CloseReason;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        }
    }

    #[test]
    fn test_default_delays_double_from_250ms_and_cap_at_5s() {
        // Arrange
        let policy = no_jitter();
        let mut rng = StdRng::seed_from_u64(7);

        // Act
        let delays: Vec<u64> = (1..=7)
            .map(|attempt| policy.delay_for(attempt, &mut rng).as_millis() as u64)
            .collect();

        // Assert
        assert_eq!(delays, vec![250, 500, 1000, 2000, 4000, 5000, 5000]);
    }

    #[test]
    fn test_huge_attempt_numbers_stay_at_the_cap() {
        let policy = no_jitter();
        assert_eq!(policy.nominal_delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent_and_below_the_cap() {
        // Arrange
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..200 {
            // Act
            let third = policy.delay_for(3, &mut rng);
            let capped = policy.delay_for(10, &mut rng);

            // Assert
            assert!(third >= Duration::from_millis(900) && third <= Duration::from_millis(1100), "{third:?}");
            assert!(capped >= Duration::from_millis(4500) && capped <= Duration::from_secs(5), "{capped:?}");
        }
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let zero_base = BackoffPolicy {
            base_delay_ms: 0,
            ..BackoffPolicy::default()
        };
        let inverted = BackoffPolicy {
            max_delay_ms: 100,
            ..BackoffPolicy::default()
        };
        let wild_jitter = BackoffPolicy {
            jitter: 1.5,
            ..BackoffPolicy::default()
        };

        assert_eq!(zero_base.validate().unwrap_err().field, "base_delay_ms");
        assert_eq!(inverted.validate().unwrap_err().field, "max_delay_ms");
        assert_eq!(wild_jitter.validate().unwrap_err().field, "jitter");
        assert!(BackoffPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_policy_deserializes_partial_table() {
        let policy: BackoffPolicy = toml::from_str("max_attempts = 3").unwrap();
        assert_eq!(policy.max_attempts, Some(3));
        assert_eq!(policy.base_delay_ms, 250);
    }

    // ── Controller ──────────────────────────────────────────────────────────

    /// Replays scripted outcomes in order.
    #[derive(Default)]
    struct ScriptedEstablisher {
        connects: Mutex<VecDeque<Result<SessionId, SessionError>>>,
        closes: Mutex<VecDeque<Result<SessionEnd, SessionError>>>,
        attempts: Mutex<u32>,
    }

    impl ScriptedEstablisher {
        fn new(
            connects: Vec<Result<SessionId, SessionError>>,
            closes: Vec<Result<SessionEnd, SessionError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                connects: Mutex::new(connects.into()),
                closes: Mutex::new(closes.into()),
                attempts: Mutex::new(0),
            })
        }

        fn attempts(&self) -> u32 {
            *self.attempts.lock().unwrap()
        }
    }

    #[async_trait]
    impl SessionEstablisher for ScriptedEstablisher {
        async fn establish(&self, _target: &str) -> Result<SessionId, SessionError> {
            *self.attempts.lock().unwrap() += 1;
            let next = self.connects.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }

        async fn wait_closed(&self, _session_id: SessionId) -> Result<SessionEnd, SessionError> {
            let next = self.closes.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }
    }

    fn lost() -> SessionError {
        SessionError::ConnectionLost("connection refused".to_string())
    }

    fn fast_policy(max_attempts: Option<u32>) -> BackoffPolicy {
        BackoffPolicy {
            base_delay_ms: 1,
            max_delay_ms: 4,
            jitter: 0.0,
            max_attempts,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ReconnectEvent>) -> Vec<ReconnectEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_connection_lost_is_retried_with_growing_delays() {
        // Arrange
        let id = SessionId::generate();
        let graceful = SessionEnd {
            initiator: CloseInitiator::Peer,
            reason: CloseReason::ServerShutdown,
        };
        let establisher = ScriptedEstablisher::new(vec![Err(lost()), Err(lost()), Err(lost()), Ok(id)], vec![Ok(graceful)]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let controller = ReconnectController::new(Arc::clone(&establisher), fast_policy(None)).with_events(tx);
        let (_cancel_tx, cancel) = watch::channel(false);

        // Act
        let outcome = controller.run("server", cancel).await;

        // Assert
        assert_eq!(outcome, Ok(ReconnectOutcome::Closed(graceful)));
        let delays: Vec<Duration> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                ReconnectEvent::RetryScheduled { delay, .. } => Some(delay),
                _ => None,
            })
            .collect();
        assert_eq!(
            delays,
            vec![Duration::from_millis(1), Duration::from_millis(2), Duration::from_millis(4)]
        );
        assert_eq!(establisher.attempts(), 4);
    }

    #[tokio::test]
    async fn test_handshake_rejection_is_not_retried() {
        // Arrange
        let establisher = ScriptedEstablisher::new(vec![Err(SessionError::AuthFailed)], vec![]);
        let controller = ReconnectController::new(Arc::clone(&establisher), fast_policy(None));
        let (_cancel_tx, cancel) = watch::channel(false);

        // Act
        let outcome = controller.run("server", cancel).await;

        // Assert
        assert_eq!(outcome, Err(SessionError::AuthFailed));
        assert_eq!(establisher.attempts(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        // Arrange
        let establisher = ScriptedEstablisher::new(vec![Err(lost()), Err(lost()), Err(lost()), Err(lost())], vec![]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let controller = ReconnectController::new(Arc::clone(&establisher), fast_policy(Some(2))).with_events(tx);
        let (_cancel_tx, cancel) = watch::channel(false);

        // Act
        let outcome = controller.run("server", cancel).await;

        // Assert
        assert_eq!(outcome, Err(lost()));
        assert_eq!(establisher.attempts(), 3);
        assert_eq!(drain(&mut rx).last(), Some(&ReconnectEvent::GaveUp { attempts: 2 }));
    }

    #[tokio::test]
    async fn test_successful_session_resets_the_attempt_counter() {
        // Arrange – fail, connect, lose the session, fail again
        let id = SessionId::generate();
        let establisher = ScriptedEstablisher::new(vec![Err(lost()), Ok(id), Err(SessionError::CapacityExceeded)], vec![Err(lost())]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let controller = ReconnectController::new(Arc::clone(&establisher), fast_policy(None)).with_events(tx);
        let (_cancel_tx, cancel) = watch::channel(false);

        // Act
        let outcome = controller.run("server", cancel).await;

        // Assert
        assert_eq!(outcome, Err(SessionError::CapacityExceeded));
        let attempts: Vec<u32> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                ReconnectEvent::RetryScheduled { attempt, .. } => Some(attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![1, 1]);
    }

    #[tokio::test]
    async fn test_cancel_stops_a_pending_attempt() {
        // Arrange – the establisher never answers
        let establisher = ScriptedEstablisher::new(vec![], vec![]);
        let controller = ReconnectController::new(Arc::clone(&establisher), fast_policy(None));
        let (cancel_tx, cancel) = watch::channel(false);

        // Act
        let run = controller.run("server", cancel);
        let cancel_later = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_tx.send_replace(true);
        };
        let (outcome, ()) = tokio::join!(run, cancel_later);

        // Assert
        assert_eq!(outcome, Ok(ReconnectOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_already_cancelled_run_returns_immediately() {
        let establisher = ScriptedEstablisher::new(vec![], vec![]);
        let controller = ReconnectController::new(Arc::clone(&establisher), fast_policy(None));
        let (_cancel_tx, cancel) = watch::channel(true);

        let outcome = controller.run("server", cancel).await;

        assert_eq!(outcome, Ok(ReconnectOutcome::Cancelled));
    }
}

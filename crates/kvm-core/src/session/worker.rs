//! The established-session loop.
//!
//! One task owns one connection. After the handshake it runs
//! [`run_session`], which waits on four things at once:
//!
//! - a control command (local close),
//! - the heartbeat monitor's next deadline,
//! - the next inbound frame,
//! - the next outbound input event.
//!
//! All four futures are cancel-safe, so whichever fires first is handled and
//! the rest are simply re-armed on the next iteration. Per-session message
//! order therefore equals send order, and no lock is held across an await.
//!
//! Every send inside the loop is bounded by the heartbeat stale deadline. A
//! peer that stops reading fills the transport buffer, and the write must not
//! outlive the point where the session would be declared lost anyway.
//!
//! When the loop ends the outbound queue is discarded (not flushed), the
//! heartbeat timer dies with the loop, and a farewell message is attempted
//! for at most `drain_timeout`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::input::InputRouter;
use crate::monitoring::MetricsSink;
use crate::protocol::{CloseReason, Message, ProtocolVersion, SessionId};
use crate::session::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use crate::session::link::MessageLink;
use crate::session::model::LinkSnapshot;
use crate::transport::SecureStream;

/// Control messages accepted by a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Close(CloseReason),
}

/// Which side ended a session gracefully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseInitiator {
    Local,
    Peer,
}

/// A graceful end of session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEnd {
    pub initiator: CloseInitiator,
    pub reason: CloseReason,
}

/// Receives progress reports from a running session.
pub trait SessionObserver: Send + Sync {
    fn on_progress(&self, snapshot: &LinkSnapshot);
}

/// Observer that ignores every report.
pub struct IgnoreProgress;

impl SessionObserver for IgnoreProgress {
    fn on_progress(&self, _snapshot: &LinkSnapshot) {}
}

/// Everything a session needs besides its link.
pub struct SessionContext {
    pub session_id: SessionId,
    /// Local version, used to interpret peer error reports.
    pub local_version: ProtocolVersion,
    pub heartbeat_interval: Duration,
    pub drain_timeout: Duration,
    pub router: InputRouter,
    pub commands: mpsc::Receiver<SessionCommand>,
    pub observer: Arc<dyn SessionObserver>,
    pub metrics: Arc<dyn MetricsSink>,
}

enum Flow {
    Continue,
    End(Result<SessionEnd, SessionError>),
}

/// Runs an established session until it closes.
///
/// # Errors
///
/// The fatal [`SessionError`] that ended the session. A missed heartbeat
/// deadline or transport failure is [`SessionError::ConnectionLost`].
pub async fn run_session<S: SecureStream>(
    mut link: MessageLink<S>,
    mut ctx: SessionContext,
) -> Result<SessionEnd, SessionError> {
    let session_id = ctx.session_id;
    let mut monitor = HeartbeatMonitor::new(ctx.heartbeat_interval, Instant::now());
    let mut commands_open = true;

    let outcome = loop {
        let wake = tokio::time::Instant::from_std(monitor.next_wakeup());

        tokio::select! {
            biased;

            command = ctx.commands.recv(), if commands_open => match command {
                Some(SessionCommand::Close(reason)) => {
                    break Ok(SessionEnd {
                        initiator: CloseInitiator::Local,
                        reason,
                    });
                }
                None => commands_open = false,
            },

            _ = tokio::time::sleep_until(wake) => match monitor.poll(Instant::now()) {
                HeartbeatAction::Idle => {}
                HeartbeatAction::Send(token) => {
                    if let Err(e) = send_before_stale(&mut link, &Message::Heartbeat { token }, &monitor).await {
                        break Err(e);
                    }
                }
                HeartbeatAction::Stale { silent_for } => {
                    warn!("session {session_id}: no heartbeat ack for {silent_for:?}");
                    break Err(SessionError::ConnectionLost(format!(
                        "no heartbeat ack for {} ms",
                        silent_for.as_millis()
                    )));
                }
            },

            received = link.recv() => match received {
                Ok(Some(message)) => {
                    match handle_inbound(message, &mut link, &mut monitor, &mut ctx).await {
                        Flow::Continue => {}
                        Flow::End(result) => break result,
                    }
                }
                Ok(None) => {}
                Err(e) => break Err(e),
            },

            event = ctx.router.next_outbound(), if !ctx.router.outbound_closed() => {
                if let Some(event) = event {
                    if let Err(e) = send_before_stale(&mut link, &Message::InputEvent(event), &monitor).await {
                        break Err(e);
                    }
                }
            }
        }
    };

    let discarded = ctx.router.shutdown();
    if discarded > 0 {
        debug!("session {session_id}: discarded {discarded} unsent input events");
    }

    let farewell = match &outcome {
        Ok(SessionEnd {
            initiator: CloseInitiator::Local,
            reason,
        }) => Some(Message::SessionClose { reason: *reason }),
        Ok(_) => None,
        Err(e) => e.code().map(|code| Message::error(code, e.to_string())),
    };
    if let Some(message) = farewell {
        let _ = tokio::time::timeout(ctx.drain_timeout, link.send(&message)).await;
    }
    let _ = tokio::time::timeout(ctx.drain_timeout, link.close()).await;

    match &outcome {
        Ok(end) => info!(
            "session {session_id} closed by {:?} ({:?}); {} events injected",
            end.initiator,
            end.reason,
            ctx.router.delivered()
        ),
        Err(e) => warn!("session {session_id} ended: {e}"),
    }
    outcome
}

/// Sends `message`, giving up once the heartbeat monitor would declare the
/// peer lost.
async fn send_before_stale<S: SecureStream>(
    link: &mut MessageLink<S>,
    message: &Message,
    monitor: &HeartbeatMonitor,
) -> Result<(), SessionError> {
    let deadline = tokio::time::Instant::from_std(monitor.stale_at());
    match tokio::time::timeout_at(deadline, link.send(message)).await {
        Ok(sent) => sent.map(|_| ()),
        Err(_) => {
            let silent_for = Instant::now().saturating_duration_since(monitor.last_ack_at());
            Err(SessionError::ConnectionLost(format!(
                "peer stopped reading; no heartbeat ack for {} ms",
                silent_for.as_millis()
            )))
        }
    }
}

async fn handle_inbound<S: SecureStream>(
    message: Message,
    link: &mut MessageLink<S>,
    monitor: &mut HeartbeatMonitor,
    ctx: &mut SessionContext,
) -> Flow {
    match message {
        Message::InputEvent(event) => ctx.router.deliver(&event),
        Message::Heartbeat { token } => {
            if let Err(e) = send_before_stale(link, &Message::HeartbeatAck { token }, monitor).await {
                return Flow::End(Err(e));
            }
        }
        Message::HeartbeatAck { token } => {
            let now = Instant::now();
            let rtt = monitor.on_ack(token, now);
            if let Some(rtt) = rtt {
                ctx.metrics.record_latency_sample(rtt.as_secs_f64() * 1000.0);
            }
            ctx.observer.on_progress(&LinkSnapshot {
                session_id: ctx.session_id,
                at: monitor.last_ack_at(),
                rtt,
                outbound_seq: link.outbound_seq(),
                inbound_seq: link.inbound_seq(),
            });
        }
        Message::SessionClose { reason } => {
            return Flow::End(Ok(SessionEnd {
                initiator: CloseInitiator::Peer,
                reason,
            }));
        }
        Message::Error(report) => {
            return Flow::End(Err(SessionError::from_remote(&report, ctx.local_version)));
        }
        other @ (Message::Hello(_) | Message::Auth(_) | Message::AuthResult(_)) => {
            warn!(
                "session {}: ignoring {} after establishment",
                ctx.session_id,
                other.message_type()
            );
        }
    }
    Flow::Continue
}

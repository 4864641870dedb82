//! End-to-end client scenarios against an in-process server.
//!
//! The server side is assembled from the `kvm-core` building blocks over the
//! in-memory network, so each test controls exactly how the server behaves:
//! answering heartbeats, going silent, closing, or disappearing.

use std::sync::Arc;
use std::time::Duration;

use kvm_client::infrastructure::input_injection::mock::RecordingInjector;
use kvm_client::{BackoffPolicy, ClientSettings, KvmClient, ReconnectEvent, ReconnectOutcome};
use kvm_core::input::{InputQueue, InputRouter};
use kvm_core::protocol::{capabilities, ModifierFlags, MouseButton};
use kvm_core::session::{
    accept_handshake, run_session, CloseInitiator, Established, Handshake, IgnoreProgress,
    LocalHello, MessageLink, SessionAdmission, SessionCommand, SessionContext, SessionEnd,
    SharedSecret,
};
use kvm_core::transport::memory::{memory_network, MemoryAcceptor, MemoryConnector};
use kvm_core::{
    CloseReason, InputEvent, NoopMetrics, PeerIdentity, ProtocolConfig, ProtocolVersion,
    SecureAcceptor, SessionError, SessionId, TrafficCounters, PROTOCOL_VERSION,
};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const SECRET: &str = "s3cret";

// ── Fixtures ──────────────────────────────────────────────────────────────────

struct AdmitAll;

impl SessionAdmission for AdmitAll {
    fn admit(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    fn register(&mut self, _peer: &PeerIdentity, _version: ProtocolVersion) -> Result<SessionId, SessionError> {
        Ok(SessionId::generate())
    }
}

fn protocol(heartbeat_ms: u64) -> ProtocolConfig {
    ProtocolConfig {
        heartbeat_interval_ms: heartbeat_ms,
        handshake_timeout_ms: 500,
        drain_timeout_ms: 100,
        ..ProtocolConfig::default()
    }
}

fn make_client(
    connector: MemoryConnector,
    heartbeat_ms: u64,
    backoff: BackoffPolicy,
    injector: Arc<RecordingInjector>,
) -> Arc<KvmClient<MemoryConnector>> {
    let mut settings = ClientSettings::new("client", SECRET);
    settings.protocol = protocol(heartbeat_ms);
    settings.backoff = backoff;
    settings.injector = injector;
    settings.metrics = Arc::new(NoopMetrics);
    KvmClient::new(connector, settings).unwrap()
}

async fn accept_one(acceptor: &MemoryAcceptor, secret: &str) -> Result<(MessageLink<DuplexStream>, Established), SessionError> {
    let (stream, _) = acceptor.accept().await.unwrap();
    let mut link = MessageLink::new(stream, PROTOCOL_VERSION.major, 1 << 20, TrafficCounters::new());
    let mut handshake = Handshake::server(
        LocalHello::new(PROTOCOL_VERSION, "server", capabilities::DEFAULT),
        Arc::new(SharedSecret::new(secret)),
    );
    let established = accept_handshake(&mut link, &mut handshake, &mut AdmitAll, Duration::from_millis(500)).await?;
    Ok((link, established))
}

/// A server-side session that answers heartbeats.
struct ServedSession {
    session_id: SessionId,
    outbound: Arc<InputQueue>,
    commands: mpsc::Sender<SessionCommand>,
    outcome: JoinHandle<Result<SessionEnd, SessionError>>,
}

fn serve(link: MessageLink<DuplexStream>, established: Established, heartbeat_ms: u64) -> ServedSession {
    let outbound = InputQueue::new(64);
    let (commands, commands_rx) = mpsc::channel(4);
    let ctx = SessionContext {
        session_id: established.session_id,
        local_version: PROTOCOL_VERSION,
        heartbeat_interval: Duration::from_millis(heartbeat_ms),
        drain_timeout: Duration::from_millis(100),
        router: InputRouter::new(
            established.session_id,
            Arc::clone(&outbound),
            Arc::new(RecordingInjector::new()),
        ),
        commands: commands_rx,
        observer: Arc::new(IgnoreProgress),
        metrics: Arc::new(NoopMetrics),
    };
    ServedSession {
        session_id: established.session_id,
        outbound,
        commands,
        outcome: tokio::spawn(run_session(link, ctx)),
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ReconnectEvent>) -> Vec<ReconnectEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_silent_server_is_reported_as_connection_lost() {
    // Arrange – the server completes the handshake, then never reads again
    let (acceptor, connector) = memory_network(4);
    let client = make_client(connector, 40, BackoffPolicy::default(), Arc::new(RecordingInjector::new()));
    let server = tokio::spawn(async move {
        let (link, _) = accept_one(&acceptor, SECRET).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(link);
    });

    // Act
    let session_id = client.connect("server").await.unwrap();
    let connected = client.get_connection_status();
    let ended = tokio::time::timeout(Duration::from_secs(2), client.wait_closed(session_id))
        .await
        .expect("stale session must be detected");

    // Assert
    assert!(connected.connected);
    assert_eq!(connected.session_id, Some(session_id));
    assert!(matches!(ended, Err(SessionError::ConnectionLost(_))), "{ended:?}");
    let status = client.get_connection_status();
    assert!(!status.connected);
    assert!(matches!(status.last_error, Some(SessionError::ConnectionLost(_))));
    server.abort();
}

#[tokio::test]
async fn test_reconnect_backs_off_with_growing_delays_after_server_disappears() {
    // Arrange – one silent session, then nobody accepts any more
    let (acceptor, connector) = memory_network(4);
    let policy = BackoffPolicy {
        base_delay_ms: 20,
        max_delay_ms: 80,
        jitter: 0.0,
        max_attempts: Some(4),
    };
    let client = make_client(connector, 30, policy, Arc::new(RecordingInjector::new()));
    let server = tokio::spawn(async move {
        let (link, _) = accept_one(&acceptor, SECRET).await.unwrap();
        drop(acceptor);
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(link);
    });
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (_cancel_tx, cancel) = watch::channel(false);

    // Act
    let outcome = tokio::time::timeout(
        Duration::from_secs(3),
        client.run_with_reconnect("server", cancel, Some(events_tx)),
    )
    .await
    .expect("controller must give up");

    // Assert
    assert!(matches!(outcome, Err(SessionError::ConnectionLost(_))), "{outcome:?}");
    let events = drain(&mut events_rx);
    assert!(matches!(events[0], ReconnectEvent::Established { .. }));
    assert!(
        matches!(&events[1], ReconnectEvent::Lost(SessionError::ConnectionLost(msg)) if msg.contains("heartbeat")),
        "{:?}",
        events[1]
    );
    let delays: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            ReconnectEvent::RetryScheduled { delay, .. } => Some(delay.as_millis() as u64),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![20, 40, 80, 80]);
    assert_eq!(events.last(), Some(&ReconnectEvent::GaveUp { attempts: 4 }));
    server.abort();
}

#[tokio::test]
async fn test_answered_heartbeats_report_rtt_and_input_arrives_in_order() {
    // Arrange
    let (acceptor, connector) = memory_network(4);
    let injector = Arc::new(RecordingInjector::new());
    let client = make_client(connector, 20, BackoffPolicy::default(), Arc::clone(&injector));
    let server = tokio::spawn(async move {
        let (link, established) = accept_one(&acceptor, SECRET).await.unwrap();
        serve(link, established, 20)
    });
    let forwarded = vec![
        InputEvent::key(4, true, ModifierFlags::default(), 1),
        InputEvent::mouse_move(10, 20, 2),
        InputEvent::mouse_button(10, 20, MouseButton::Left, true, 3),
        InputEvent::key(4, false, ModifierFlags::default(), 4),
    ];

    // Act
    let session_id = client.connect("server").await.unwrap();
    let served = server.await.unwrap();
    for event in &forwarded {
        served.outbound.push(event.clone()).await.unwrap();
    }
    let settled = eventually(|| {
        injector.events().len() == forwarded.len() && client.get_connection_status().last_rtt_ms.is_some()
    })
    .await;

    // Assert
    assert!(settled, "events: {:?}", injector.events());
    assert_eq!(served.session_id, session_id);
    assert_eq!(injector.events(), forwarded);
}

#[tokio::test]
async fn test_disconnect_closes_gracefully_on_both_sides() {
    // Arrange
    let (acceptor, connector) = memory_network(4);
    let client = make_client(connector, 1000, BackoffPolicy::default(), Arc::new(RecordingInjector::new()));
    let server = tokio::spawn(async move {
        let (link, established) = accept_one(&acceptor, SECRET).await.unwrap();
        serve(link, established, 1000)
    });
    let session_id = client.connect("server").await.unwrap();
    let served = server.await.unwrap();

    // Act
    client.disconnect(session_id).await.unwrap();
    let server_end = served.outcome.await.unwrap().unwrap();
    let client_end = client.wait_closed(session_id).await.unwrap();

    // Assert
    assert_eq!(server_end.initiator, CloseInitiator::Peer);
    assert_eq!(server_end.reason, CloseReason::UserInitiated);
    assert_eq!(client_end.initiator, CloseInitiator::Local);
    let status = client.get_connection_status();
    assert!(!status.connected);
    assert_eq!(status.last_error, None);
}

#[tokio::test]
async fn test_graceful_server_close_ends_reconnect_without_retry() {
    // Arrange
    let (acceptor, connector) = memory_network(4);
    let client = make_client(connector, 1000, BackoffPolicy::default(), Arc::new(RecordingInjector::new()));
    let server = tokio::spawn(async move {
        let (link, established) = accept_one(&acceptor, SECRET).await.unwrap();
        let served = serve(link, established, 1000);
        tokio::time::sleep(Duration::from_millis(50)).await;
        served
            .commands
            .send(SessionCommand::Close(CloseReason::ServerShutdown))
            .await
            .unwrap();
        served.outcome.await.unwrap()
    });
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (_cancel_tx, cancel) = watch::channel(false);

    // Act
    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        client.run_with_reconnect("server", cancel, Some(events_tx)),
    )
    .await
    .unwrap();

    // Assert
    assert_eq!(
        outcome,
        Ok(ReconnectOutcome::Closed(SessionEnd {
            initiator: CloseInitiator::Peer,
            reason: CloseReason::ServerShutdown,
        }))
    );
    assert!(server.await.unwrap().is_ok());
    let events = drain(&mut events_rx);
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], ReconnectEvent::Established { .. }));
}

#[tokio::test]
async fn test_wrong_secret_is_not_retried() {
    // Arrange
    let (acceptor, connector) = memory_network(4);
    let client = make_client(connector, 1000, BackoffPolicy::default(), Arc::new(RecordingInjector::new()));
    let server = tokio::spawn(async move { accept_one(&acceptor, "another secret").await.map(|_| ()) });
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (_cancel_tx, cancel) = watch::channel(false);

    // Act
    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        client.run_with_reconnect("server", cancel, Some(events_tx)),
    )
    .await
    .unwrap();

    // Assert
    assert_eq!(outcome, Err(SessionError::AuthFailed));
    assert_eq!(server.await.unwrap(), Err(SessionError::AuthFailed));
    assert!(drain(&mut events_rx).is_empty());
    assert_eq!(client.get_connection_status().last_error, Some(SessionError::AuthFailed));
}

#[tokio::test]
async fn test_cancel_closes_the_live_session() {
    // Arrange
    let (acceptor, connector) = memory_network(4);
    let client = make_client(connector, 1000, BackoffPolicy::default(), Arc::new(RecordingInjector::new()));
    let server = tokio::spawn(async move {
        let (link, established) = accept_one(&acceptor, SECRET).await.unwrap();
        serve(link, established, 1000)
    });
    let (cancel_tx, cancel) = watch::channel(false);
    let runner = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.run_with_reconnect("server", cancel, None).await })
    };
    let served = server.await.unwrap();
    assert!(eventually(|| client.get_connection_status().connected).await);

    // Act
    cancel_tx.send_replace(true);
    let outcome = runner.await.unwrap();
    let server_end = served.outcome.await.unwrap().unwrap();

    // Assert
    assert_eq!(outcome, Ok(ReconnectOutcome::Cancelled));
    assert_eq!(server_end.reason, CloseReason::UserInitiated);
    assert!(!client.get_connection_status().connected);
}

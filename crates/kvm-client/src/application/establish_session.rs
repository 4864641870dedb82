//! EstablishSessionUseCase: connect, then run the client side of the handshake.
//!
//! Both steps share the configured handshake budget: a connect that hangs
//! counts against the same deadline as a server that never answers the Hello.
//! Connect failures are reported as [`SessionError::ConnectionLost`] so the
//! reconnection policy treats an unreachable server like a dropped one.

use std::sync::Arc;
use std::time::Instant;

use kvm_core::session::{initiate_handshake, CredentialSource, Established, Handshake, LocalHello, MessageLink};
use kvm_core::{ProtocolConfig, SecureConnector, SessionError, TrafficCounters};
use tracing::debug;

/// Opens a stream to `address` and completes the handshake on it.
///
/// # Errors
///
/// [`SessionError::ConnectionLost`] if the stream cannot be opened in time,
/// otherwise any handshake failure.
pub async fn establish_session<C: SecureConnector + ?Sized>(
    connector: &C,
    address: &str,
    local: &LocalHello,
    credentials: Arc<dyn CredentialSource>,
    protocol: &ProtocolConfig,
    counters: Arc<TrafficCounters>,
) -> Result<(MessageLink<C::Stream>, Established), SessionError> {
    let budget = protocol.handshake_timeout();
    let started = Instant::now();

    let stream = match tokio::time::timeout(budget, connector.connect(address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(SessionError::ConnectionLost(format!("connect to {address} failed: {e}"))),
        Err(_) => {
            return Err(SessionError::ConnectionLost(format!(
                "connect to {address} timed out after {} ms",
                budget.as_millis()
            )))
        }
    };
    debug!("connected to {address} in {:?}", started.elapsed());

    let mut link = MessageLink::new(stream, local.version.major, protocol.max_frame_size, counters);
    let mut handshake = Handshake::client(local.clone(), credentials);
    let remaining = budget.saturating_sub(started.elapsed());
    let established = initiate_handshake(&mut link, &mut handshake, remaining).await?;
    Ok((link, established))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_core::protocol::capabilities;
    use kvm_core::session::{accept_handshake, SessionAdmission, SharedSecret};
    use kvm_core::transport::memory::{memory_network, MemoryAcceptor};
    use kvm_core::{PeerIdentity, ProtocolVersion, SecureAcceptor, SessionId, PROTOCOL_VERSION};

    struct AdmitAll;

    impl SessionAdmission for AdmitAll {
        fn admit(&mut self) -> Result<(), SessionError> {
            Ok(())
        }

        fn register(&mut self, _peer: &PeerIdentity, _version: ProtocolVersion) -> Result<SessionId, SessionError> {
            Ok(SessionId::generate())
        }
    }

    fn protocol() -> ProtocolConfig {
        ProtocolConfig {
            handshake_timeout_ms: 500,
            ..ProtocolConfig::default()
        }
    }

    fn spawn_server(acceptor: MemoryAcceptor, secret: &'static str) -> tokio::task::JoinHandle<Result<Established, SessionError>> {
        tokio::spawn(async move {
            let (stream, _) = acceptor.accept().await.map_err(|e| SessionError::ConnectionLost(e.to_string()))?;
            let mut link = MessageLink::new(stream, PROTOCOL_VERSION.major, 1 << 20, TrafficCounters::new());
            let mut handshake = Handshake::server(
                LocalHello::new(PROTOCOL_VERSION, "server", capabilities::DEFAULT),
                Arc::new(SharedSecret::new(secret)),
            );
            let result = accept_handshake(&mut link, &mut handshake, &mut AdmitAll, std::time::Duration::from_millis(500)).await;
            // Keep the link open until the client has read the AuthResult.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            result
        })
    }

    #[tokio::test]
    async fn test_establishes_against_a_matching_server() {
        // Arrange
        let (acceptor, connector) = memory_network(1);
        let server = spawn_server(acceptor, "s3cret");
        let local = LocalHello::new(PROTOCOL_VERSION, "client", capabilities::DEFAULT);

        // Act
        let result = establish_session(
            &connector,
            "server",
            &local,
            Arc::new(SharedSecret::new("s3cret")),
            &protocol(),
            TrafficCounters::new(),
        )
        .await;

        // Assert
        let (link, established) = result.unwrap();
        let served = server.await.unwrap().unwrap();
        assert_eq!(established.session_id, served.session_id);
        assert_eq!(link.session_id(), Some(established.session_id));
        assert_eq!(established.peer.name, "server");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_a_retryable_connection_loss() {
        // Arrange – nobody accepts
        let (acceptor, connector) = memory_network(1);
        drop(acceptor);
        let local = LocalHello::new(PROTOCOL_VERSION, "client", capabilities::DEFAULT);

        // Act
        let result = establish_session(
            &connector,
            "server",
            &local,
            Arc::new(SharedSecret::new("s3cret")),
            &protocol(),
            TrafficCounters::new(),
        )
        .await;

        // Assert
        let error = result.err().unwrap();
        assert!(matches!(error, SessionError::ConnectionLost(_)), "{error:?}");
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn test_major_version_mismatch_is_reported() {
        // Arrange
        let (acceptor, connector) = memory_network(1);
        let _server = spawn_server(acceptor, "s3cret");
        let local = LocalHello::new(ProtocolVersion::new(2, 0), "client", capabilities::DEFAULT);

        // Act
        let result = establish_session(
            &connector,
            "server",
            &local,
            Arc::new(SharedSecret::new("s3cret")),
            &protocol(),
            TrafficCounters::new(),
        )
        .await;

        // Assert
        assert!(matches!(result.err(), Some(SessionError::VersionMismatch { .. })));
    }
}

//! TCP listener adapter.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use kvm_core::SecureAcceptor;
use tokio::net::{TcpListener, TcpStream};

/// Accepts TCP connections with Nagle's algorithm disabled, so single input
/// events are not held back waiting for more data.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Binds to `address` (`host:port`; port 0 picks a free port).
    ///
    /// # Errors
    ///
    /// Any error from resolving or binding the address.
    pub async fn bind(address: &str) -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(address).await?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait]
impl SecureAcceptor for TcpAcceptor {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, String)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_to_port_zero_assigns_a_port() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        assert_ne!(acceptor.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_accept_returns_nodelay_stream_and_peer_address() {
        // Arrange
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = acceptor.local_addr().unwrap();

        // Act
        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (stream, peer) = acceptor.accept().await.unwrap();
        let _client = client.await.unwrap().unwrap();

        // Assert
        assert!(stream.nodelay().unwrap());
        assert!(peer.starts_with("127.0.0.1:"));
    }
}

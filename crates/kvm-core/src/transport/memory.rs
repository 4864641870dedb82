//! In-process network built from `tokio::io::duplex` pipes.
//!
//! Stands in for the TCP/TLS collaborators in tests and local demos: the
//! connector hands one end of a fresh pipe to the acceptor through a channel.
//! Dropping the [`MemoryAcceptor`] makes later connects fail with
//! `ConnectionRefused`, like a closed listening socket.

use std::io;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};

use super::{SecureAcceptor, SecureConnector};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Creates a connected acceptor/connector pair.
///
/// `backlog` bounds the number of connections waiting to be accepted.
pub fn memory_network(backlog: usize) -> (MemoryAcceptor, MemoryConnector) {
    let (tx, rx) = mpsc::channel(backlog.max(1));
    (
        MemoryAcceptor {
            incoming: Mutex::new(rx),
        },
        MemoryConnector { listener: tx },
    )
}

/// Accepting side of a [`memory_network`].
pub struct MemoryAcceptor {
    incoming: Mutex<mpsc::Receiver<(DuplexStream, String)>>,
}

/// Connecting side of a [`memory_network`]. Cheap to clone.
#[derive(Clone)]
pub struct MemoryConnector {
    listener: mpsc::Sender<(DuplexStream, String)>,
}

#[async_trait]
impl SecureAcceptor for MemoryAcceptor {
    type Stream = DuplexStream;

    async fn accept(&self) -> io::Result<(DuplexStream, String)> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "memory network shut down"))
    }
}

#[async_trait]
impl SecureConnector for MemoryConnector {
    type Stream = DuplexStream;

    async fn connect(&self, address: &str) -> io::Result<DuplexStream> {
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        self.listener
            .send((remote, format!("memory:{address}")))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "nobody is accepting"))?;
        Ok(local)
    }
}

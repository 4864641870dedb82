//! TCP connector adapter.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use kvm_core::SecureConnector;
use tokio::net::TcpStream;

use super::discovery::{DnsResolver, ServiceResolver};

/// Opens TCP connections with Nagle's algorithm disabled, resolving names
/// through a [`ServiceResolver`].
pub struct TcpConnector {
    resolver: Arc<dyn ServiceResolver>,
}

impl TcpConnector {
    pub fn new(resolver: Arc<dyn ServiceResolver>) -> Self {
        Self { resolver }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Arc::new(DnsResolver))
    }
}

#[async_trait]
impl SecureConnector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, address: &str) -> io::Result<TcpStream> {
        let addr = self.resolver.resolve(address).await?;
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

//! Server address resolution.
//!
//! The client is configured with a *name* (`desk.local`, `10.0.0.5:24800`)
//! and needs a socket address. [`ServiceResolver`] is the seam for whatever
//! discovery mechanism a deployment uses; [`DnsResolver`] covers the common
//! case with the system resolver, and [`StaticResolver`] pins names to
//! addresses for tests and fixed setups.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::lookup_host;
use tracing::debug;

/// Port used when a name carries none.
pub const DEFAULT_PORT: u16 = 24800;

/// Maps a service name to a connectable address.
#[async_trait]
pub trait ServiceResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> io::Result<SocketAddr>;
}

/// Resolves through the operating system's resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsResolver;

#[async_trait]
impl ServiceResolver for DnsResolver {
    async fn resolve(&self, name: &str) -> io::Result<SocketAddr> {
        if let Ok(addr) = name.parse::<SocketAddr>() {
            return Ok(addr);
        }
        let target = if name.contains(':') {
            name.to_string()
        } else {
            format!("{name}:{DEFAULT_PORT}")
        };
        let addr = lookup_host(target.as_str())
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address found for {name}")))?;
        debug!("resolved {name} to {addr}");
        Ok(addr)
    }
}

/// Fixed name → address table.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    entries: HashMap<String, SocketAddr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, addr: SocketAddr) -> Self {
        self.entries.insert(name.into(), addr);
        self
    }
}

#[async_trait]
impl ServiceResolver for StaticResolver {
    async fn resolve(&self, name: &str) -> io::Result<SocketAddr> {
        self.entries
            .get(name)
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("unknown service {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dns_resolver_passes_socket_addresses_through() {
        let addr = DnsResolver.resolve("127.0.0.1:4000").await.unwrap();
        assert_eq!(addr, "127.0.0.1:4000".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_dns_resolver_applies_default_port() {
        let addr = DnsResolver.resolve("localhost").await.unwrap();
        assert_eq!(addr.port(), DEFAULT_PORT);
    }

    #[tokio::test]
    async fn test_static_resolver_rejects_unknown_names() {
        // Arrange
        let addr: SocketAddr = "10.0.0.5:24800".parse().unwrap();
        let resolver = StaticResolver::new().with("desk", addr);

        // Act / Assert
        assert_eq!(resolver.resolve("desk").await.unwrap(), addr);
        let err = resolver.resolve("laptop").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}

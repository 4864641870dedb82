//! Network infrastructure for the server.
//!
//! # Sub-modules
//!
//! - **`tcp`** – [`SecureAcceptor`](kvm_core::SecureAcceptor) over a plain
//!   TCP listener, for deployments where the security layer wraps the socket
//!   outside this process (VPN, SSH tunnel, TLS terminator).
//!
//! - **`server`** – The [`KvmServer`](server::KvmServer) facade: accept loop,
//!   one task per connection, and the operations exposed to the binary and
//!   the automation console.

pub mod server;
pub mod tcp;

//! Network infrastructure for the client.
//!
//! # Sub-modules
//!
//! - **`discovery`** – [`ServiceResolver`](discovery::ServiceResolver): turns
//!   the configured server name into a socket address (system DNS by default).
//!
//! - **`tcp`** – [`SecureConnector`](kvm_core::SecureConnector) over plain TCP
//!   for deployments where the security layer wraps the socket outside this
//!   process.
//!
//! - **`client`** – The [`KvmClient`](client::KvmClient) facade: connect,
//!   status, disconnect, input and the reconnect loop.

pub mod client;
pub mod discovery;
pub mod tcp;

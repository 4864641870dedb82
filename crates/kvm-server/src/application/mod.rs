//! Application layer use cases for the server.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the protocol
//! core (`kvm_core`) and the infrastructure (sockets, files, OS hooks).
//! Use cases here orchestrate core types to fulfil one goal each and depend
//! on traits rather than concrete adapters.
//!
//! # Sub-modules
//!
//! - **`manage_sessions`** – The registry of established sessions: creation
//!   under the `max_clients` limit, lookup, removal, status snapshots.
//!
//! - **`serve_connection`** – Drives one accepted connection through the
//!   handshake and the established-session loop, and cleans up the registry
//!   afterwards.
//!
//! - **`forward_input`** – Sends locally captured input to the focused
//!   session.

pub mod forward_input;
pub mod manage_sessions;
pub mod serve_connection;

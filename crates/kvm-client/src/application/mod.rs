//! Application layer use cases for the client application.
//!
//! # What use cases does the client have?
//!
//! - **`establish_session`** – Opens a secure stream to the server and runs the
//!   client side of the Hello / Auth handshake within one deadline.  The
//!   stream factory is injected, so the same code runs over TCP in production
//!   and over in-memory pipes in tests.
//!
//! - **`reconnect`** – Keeps a session alive: when the connection is lost the
//!   controller waits with exponential backoff and re-runs the whole chain.
//!   Rejections during the handshake (wrong secret, full server, version
//!   mismatch) are final and end the controller.

pub mod establish_session;
pub mod reconnect;

//! Infrastructure layer for the server.
//!
//! Contains OS-facing adapters: the TCP listener and server facade, input
//! capture plumbing, configuration loading, and the JSON command bridge.
//!
//! **Dependency rule**: this layer may depend on `application` and `kvm_core`,
//! but MUST NOT be imported by the `application` layer outside of tests.

pub mod input_capture;
pub mod network;
pub mod storage;
pub mod ui_bridge;

//! Infrastructure layer for the client application.
//!
//! Contains the adapters around the session core: network I/O, input
//! injection, configuration files and the automation console.
//!
//! **Dependency rule**: this layer may depend on `application` and `kvm_core`,
//! but MUST NOT be imported by the `application` layer outside of tests.
//!
//! # Sub-modules
//!
//! - **`input_injection`** – Implementations of `InputInjector`. OS backends
//!   plug in here; a logging injector is the default and a recording one is
//!   provided for tests.
//!
//! - **`network`** – Name resolution, the TCP connector and the `KvmClient`
//!   facade that owns the live session.
//!
//! - **`storage`** – TOML configuration loading.
//!
//! - **`ui_bridge`** – Line-oriented JSON command console exposing client
//!   status and controls to automation tools.

pub mod input_injection;
pub mod network;
pub mod storage;
pub mod ui_bridge;

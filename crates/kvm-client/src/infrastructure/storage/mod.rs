//! Storage infrastructure: configuration file loading.
//!
//! The `config` sub-module reads the client's TOML configuration, including
//! the `[reconnect]` backoff table. The client never writes its configuration
//! back.

pub mod config;

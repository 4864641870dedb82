//! Storage infrastructure: configuration file loading.
//!
//! The `config` sub-module reads the server's TOML configuration and fills in
//! defaults for everything the file leaves out. The server never writes its
//! configuration back.

pub mod config;

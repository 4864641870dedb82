//! TOML configuration for the client.
//!
//! Default location:
//! - Windows:  `%APPDATA%\KVMOverIP\client.toml`
//! - Linux:    `~/.config/kvmoverip/client.toml`
//! - macOS:    `~/Library/Application Support/KVMOverIP/client.toml`
//!
//! Example:
//!
//! ```toml
//! [client]
//! server_address = "192.168.1.10:24800"
//! name = "laptop"
//! log_level = "info"
//!
//! [protocol]
//! heartbeat_interval_ms = 30000
//!
//! [reconnect]
//! base_delay_ms = 250
//! max_delay_ms = 5000
//! jitter = 0.1
//! # max_attempts = 20
//!
//! [auth]
//! shared_secret = "correct horse battery staple"
//! ```
//!
//! Missing files, tables and keys fall back to the defaults below.

use std::path::{Path, PathBuf};

use kvm_core::config::{InvalidConfig, ProtocolConfig};
use kvm_core::{ProtocolVersion, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::reconnect::BackoffPolicy;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Invalid(#[from] InvalidConfig),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub reconnect: BackoffPolicy,
    #[serde(default)]
    pub auth: AuthSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientSection {
    /// Server `host:port`, or a bare host name resolved with the default port.
    #[serde(default = "default_server_address")]
    pub server_address: String,
    /// Name announced in the client's Hello.
    #[serde(default = "default_name")]
    pub name: String,
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Version announced in the Hello. Only changed to test compatibility.
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthSection {
    #[serde(default)]
    pub shared_secret: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_server_address() -> String {
    "127.0.0.1:24800".to_string()
}
fn default_name() -> String {
    "kvm-client".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            name: default_name(),
            log_level: default_log_level(),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl ClientConfig {
    /// Checks ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// [`InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        self.protocol.validate()?;
        self.reconnect.validate()?;
        if self.client.server_address.trim().is_empty() {
            return Err(InvalidConfig {
                field: "server_address",
                reason: "must not be empty".to_string(),
            });
        }
        if self.auth.shared_secret.is_empty() {
            return Err(InvalidConfig {
                field: "shared_secret",
                reason: "must be set in [auth] or on the command line".to_string(),
            });
        }
        Ok(())
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Resolves the default config file path.
///
/// # Errors
///
/// [`ConfigError::NoPlatformConfigDir`] when no base directory is known.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("client.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads the config at `path`, returning defaults if the file does not exist.
///
/// # Errors
///
/// [`ConfigError::Io`] for file-system errors other than "not found" and
/// [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<ClientConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ClientConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("KVMOverIP"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("kvmoverip"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join("Library").join("Application Support").join("KVMOverIP"))
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

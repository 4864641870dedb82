//! TOML configuration for the server.
//!
//! Default location:
//! - Windows:  `%APPDATA%\KVMOverIP\server.toml`
//! - Linux:    `~/.config/kvmoverip/server.toml`
//! - macOS:    `~/Library/Application Support/KVMOverIP/server.toml`
//!
//! Example:
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0:24800"
//! max_clients = 10
//! name = "office-desktop"
//! log_level = "info"
//!
//! [protocol]
//! heartbeat_interval_ms = 30000
//!
//! [auth]
//! shared_secret = "correct horse battery staple"
//! ```
//!
//! # Serde default values
//!
//! Every field is annotated with `#[serde(default = "...")]`, so a missing
//! file, a missing table or a missing key all fall back to the values below.

use std::path::{Path, PathBuf};

use kvm_core::config::{InvalidConfig, ProtocolConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but is out of range.
    #[error(transparent)]
    Invalid(#[from] InvalidConfig),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub auth: AuthSection,
}

/// Listener and registry settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerSection {
    /// `host:port` to listen on. `"0.0.0.0:24800"` listens on all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Maximum number of concurrently established sessions.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Name announced in the server's Hello.
    #[serde(default = "default_name")]
    pub name: String,
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Credential settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthSection {
    /// Pre-shared secret clients must prove knowledge of.
    #[serde(default)]
    pub shared_secret: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "0.0.0.0:24800".to_string()
}
fn default_max_clients() -> usize {
    10
}
fn default_name() -> String {
    "kvm-server".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_clients: default_max_clients(),
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Checks ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// [`InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        self.protocol.validate()?;
        if self.server.max_clients == 0 {
            return Err(InvalidConfig {
                field: "max_clients",
                reason: "must be greater than zero".to_string(),
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
/// [`ConfigError::NoPlatformConfigDir`] when the platform base directory
/// cannot be determined from the environment.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("server.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads the config at `path`, returning defaults if the file does not exist.
///
/// # Errors
///
/// [`ConfigError::Io`] for file-system errors other than "not found" and
/// [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
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

//! Protocol tuning shared by the server and the client.
//!
//! Both binaries embed a `[protocol]` table of this shape in their TOML
//! configuration:
//!
//! ```toml
//! [protocol]
//! heartbeat_interval_ms = 30000
//! handshake_timeout_ms = 1000
//! max_frame_size = 1048576
//! input_queue_capacity = 256
//! drain_timeout_ms = 250
//! ```
//!
//! Every field has a serde default, so a partial table (or none at all) is
//! valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A configuration value is outside its allowed range.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid configuration value for `{field}`: {reason}")]
pub struct InvalidConfig {
    pub field: &'static str,
    pub reason: String,
}

/// Timing and sizing parameters of the session protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// How often each side sends a heartbeat. Silence for twice this long
    /// marks the session stale.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Budget for the whole handshake, from connect to established.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Largest accepted frame, excluding the 4-byte length prefix.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Bound of each session's outbound input queue.
    #[serde(default = "default_input_queue_capacity")]
    pub input_queue_capacity: usize,
    /// How long a closing session may spend on its farewell message.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}
fn default_handshake_timeout_ms() -> u64 {
    1_000
}
fn default_max_frame_size() -> usize {
    1024 * 1024
}
fn default_input_queue_capacity() -> usize {
    256
}
fn default_drain_timeout_ms() -> u64 {
    250
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            max_frame_size: default_max_frame_size(),
            input_queue_capacity: default_input_queue_capacity(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl ProtocolConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Rejects values that would make the protocol unusable.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        let positive: [(&'static str, u64); 3] = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("input_queue_capacity", self.input_queue_capacity as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(InvalidConfig {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        // The largest handshake message must always fit.
        if self.max_frame_size < 512 {
            return Err(InvalidConfig {
                field: "max_frame_size",
                reason: format!("{} is below the 512 byte minimum", self.max_frame_size),
            });
        }
        if self.max_frame_size > u32::MAX as usize {
            return Err(InvalidConfig {
                field: "max_frame_size",
                reason: "does not fit the u32 length prefix".to_string(),
            });
        }
        Ok(())
    }
}

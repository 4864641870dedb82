//! Command bridge for the client application.
//!
//! Exposes the [`KvmClient`] facade to automation tools through one JSON
//! request per line on stdin and one JSON response per line on stdout:
//!
//! ```text
//! → {"command": "get_connection_status"}
//! ← {"success": true, "data": {"connected": true, "session_id": "6f1c...", ...}, "error": null}
//! → {"command": "connect", "args": {"address": "desk.local:24800"}}
//! ← {"success": false, "data": null, "error": "authentication failed"}
//! ```
//!
//! # DTOs (Data Transfer Objects)
//!
//! [`ConnectionStatus`] carries typed values (`SessionId`, `SessionError`)
//! that are not meant to be serialized as-is. [`ConnectionStatusDto`] is the
//! plain snapshot sent over the console: ids and errors become strings.
//!
//! # `CommandResult<T>`
//!
//! All commands answer with the same envelope:
//! ```json
//! { "success": true,  "data": {...}, "error": null  }
//! { "success": false, "data": null,  "error": "..."  }
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use kvm_core::{InputEvent, SessionError, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::infrastructure::network::client::{ConnectionStatus, KvmClient};
use crate::infrastructure::network::tcp::TcpConnector;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("invalid command table: {0}")]
    InvalidTable(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

// ── Shared bridge state ───────────────────────────────────────────────────────

pub struct BridgeState {
    pub client: Arc<KvmClient<TcpConnector>>,
}

// ── Data Transfer Objects ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResult<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> CommandResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Serializable form of [`ConnectionStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatusDto {
    pub connected: bool,
    pub session_id: Option<String>,
    pub last_rtt_ms: Option<u64>,
    pub last_error: Option<String>,
}

impl From<ConnectionStatus> for ConnectionStatusDto {
    fn from(status: ConnectionStatus) -> Self {
        Self {
            connected: status.connected,
            session_id: status.session_id.map(|id| id.to_string()),
            last_rtt_ms: status.last_rtt_ms,
            last_error: status.last_error.map(|e| e.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConnectArgs {
    address: String,
}

#[derive(Debug, Deserialize)]
struct SessionArgs {
    session_id: String,
}

// ── Command table ─────────────────────────────────────────────────────────────

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, BridgeError>> + Send>>;

pub type Handler = fn(Arc<BridgeState>, Value) -> HandlerFuture;

/// Every command the bridge understands.
pub static COMMANDS: &[(&str, Handler)] = &[
    ("get_connection_status", get_connection_status),
    ("connect", connect),
    ("disconnect", disconnect),
    ("send_input", send_input),
];

/// Checks a command table for empty or duplicated names.
///
/// # Errors
///
/// [`BridgeError::InvalidTable`] naming the offending entry.
pub fn validate_command_table(table: &[(&str, Handler)]) -> Result<(), BridgeError> {
    let mut seen = HashSet::new();
    for (name, _) in table {
        if name.trim().is_empty() {
            return Err(BridgeError::InvalidTable("empty command name".to_string()));
        }
        if !seen.insert(*name) {
            return Err(BridgeError::InvalidTable(format!("duplicate command `{name}`")));
        }
    }
    Ok(())
}

fn parse_args<T: for<'de> Deserialize<'de>>(args: Value) -> Result<T, BridgeError> {
    serde_json::from_value(args).map_err(|e| BridgeError::InvalidArguments(e.to_string()))
}

fn to_json<T: Serialize>(value: T) -> Result<Value, BridgeError> {
    serde_json::to_value(value).map_err(|e| BridgeError::InvalidArguments(e.to_string()))
}

// ── Handlers ──────────────────────────────────────────────────────────────────

fn get_connection_status(state: Arc<BridgeState>, _args: Value) -> HandlerFuture {
    Box::pin(async move { to_json(ConnectionStatusDto::from(state.client.get_connection_status())) })
}

fn connect(state: Arc<BridgeState>, args: Value) -> HandlerFuture {
    Box::pin(async move {
        let args: ConnectArgs = parse_args(args)?;
        let session_id = state.client.connect(&args.address).await?;
        to_json(session_id.to_string())
    })
}

fn disconnect(state: Arc<BridgeState>, args: Value) -> HandlerFuture {
    Box::pin(async move {
        let args: SessionArgs = parse_args(args)?;
        let session_id: SessionId = args
            .session_id
            .parse()
            .map_err(|e| BridgeError::InvalidArguments(format!("invalid session_id: {e}")))?;
        state.client.disconnect(session_id).await?;
        Ok(Value::Null)
    })
}

fn send_input(state: Arc<BridgeState>, args: Value) -> HandlerFuture {
    Box::pin(async move {
        let event: InputEvent = parse_args(args)?;
        let outcome = state.client.send_input(event).await?;
        to_json(outcome.map(|o| format!("{o:?}")))
    })
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// Runs one request against [`COMMANDS`].
pub async fn dispatch(state: Arc<BridgeState>, request: CommandRequest) -> CommandResult<Value> {
    let handler = COMMANDS
        .iter()
        .find(|(name, _)| *name == request.command)
        .map(|(_, handler)| *handler);
    let Some(handler) = handler else {
        return CommandResult::err(BridgeError::UnknownCommand(request.command).to_string());
    };
    match handler(state, request.args).await {
        Ok(data) => CommandResult::ok(data),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

/// Serves line-delimited JSON requests from `reader` until end of input.
///
/// # Errors
///
/// I/O errors on `reader` or `writer`.
pub async fn run_console<R, W>(state: Arc<BridgeState>, reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<CommandRequest>(line) {
            Ok(request) => {
                debug!("console command `{}`", request.command);
                dispatch(Arc::clone(&state), request).await
            }
            Err(e) => {
                warn!("unparseable console request: {e}");
                CommandResult::err(format!("invalid request: {e}"))
            }
        };
        let mut out = serde_json::to_string(&response)
            .unwrap_or_else(|e| format!(r#"{{"success":false,"data":null,"error":"{e}"}}"#));
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

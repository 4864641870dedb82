//! Command bridge: exposes server operations to automation clients.
//!
//! The bridge reads one JSON request per line and writes one JSON response
//! per line:
//!
//! ```text
//! → {"command": "get_active_sessions"}
//! ← {"success": true, "data": 2, "error": null}
//! → {"command": "list_sessions"}
//! ← {"success": true, "data": [...], "error": null}
//! → {"command": "disconnect", "args": {"session_id": "6f1c..."}}
//! ← {"success": true, "data": null, "error": null}
//! ```
//!
//! # The command table (for beginners)
//!
//! Commands are looked up in [`COMMANDS`], a static slice of
//! `(name, handler)` pairs. Adding a command means writing one handler
//! function and adding one line to the table. [`validate_command_table`] runs
//! once at startup and refuses to start with an empty or duplicated name, so
//! a typo in the table fails loudly instead of shadowing another command.
//!
//! # `CommandResult<T>` wrapper
//!
//! Every response has the same shape,
//! `{ success: bool, data: T | null, error: string | null }`, so callers can
//! always check `success` first.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use kvm_core::{InputEvent, Session, SessionError, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::infrastructure::network::server::KvmServer;

/// Errors raised by command handlers.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("invalid command table: {0}")]
    InvalidTable(String),

    #[error("input capture channel is closed")]
    CaptureClosed,

    #[error(transparent)]
    Session(#[from] SessionError),
}

// ── Shared bridge state ───────────────────────────────────────────────────────

/// State handed to every handler.
pub struct BridgeState {
    pub server: Arc<KvmServer>,
    /// Sending half of the capture channel; `send_input` feeds events in as
    /// if they had been captured locally.
    pub capture: mpsc::Sender<InputEvent>,
}

// ── Data Transfer Objects ─────────────────────────────────────────────────────

/// One line of input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub args: Value,
}

/// Unified response wrapper.
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

/// DTO describing one established session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDto {
    pub session_id: String,
    pub peer_name: String,
    pub node_id: String,
    pub protocol_version: String,
    pub connected_secs: u64,
    pub last_rtt_ms: Option<u64>,
    pub outbound_seq: u32,
    pub inbound_seq: u32,
}

impl From<&Session> for SessionDto {
    fn from(s: &Session) -> Self {
        Self {
            session_id: s.session_id.to_string(),
            peer_name: s.peer_identity.name.clone(),
            node_id: s.peer_identity.node_id.to_string(),
            protocol_version: s.negotiated_version.to_string(),
            connected_secs: s.established_at.elapsed().as_secs(),
            last_rtt_ms: s.last_rtt.map(|rtt| rtt.as_millis() as u64),
            outbound_seq: s.outbound_seq,
            inbound_seq: s.inbound_seq,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionArgs {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct FocusArgs {
    #[serde(default)]
    session_id: Option<String>,
}

// ── Command table ─────────────────────────────────────────────────────────────

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, BridgeError>> + Send>>;

/// A command handler.
pub type Handler = fn(Arc<BridgeState>, Value) -> HandlerFuture;

/// Every command the bridge understands.
pub static COMMANDS: &[(&str, Handler)] = &[
    ("get_active_sessions", get_active_sessions),
    ("list_sessions", list_sessions),
    ("connection_stats", connection_stats),
    ("disconnect", disconnect),
    ("set_focus", set_focus),
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

fn parse_session_id(raw: &str) -> Result<SessionId, BridgeError> {
    raw.parse()
        .map_err(|e| BridgeError::InvalidArguments(format!("invalid session_id: {e}")))
}

fn to_json<T: Serialize>(value: T) -> Result<Value, BridgeError> {
    serde_json::to_value(value).map_err(|e| BridgeError::InvalidArguments(e.to_string()))
}

// ── Handlers ──────────────────────────────────────────────────────────────────

fn get_active_sessions(state: Arc<BridgeState>, _args: Value) -> HandlerFuture {
    Box::pin(async move { to_json(state.server.get_active_sessions()) })
}

fn list_sessions(state: Arc<BridgeState>, _args: Value) -> HandlerFuture {
    Box::pin(async move {
        let sessions: Vec<SessionDto> = state
            .server
            .sessions()
            .iter()
            .map(SessionDto::from)
            .collect();
        to_json(sessions)
    })
}

fn connection_stats(state: Arc<BridgeState>, _args: Value) -> HandlerFuture {
    Box::pin(async move { to_json(state.server.connection_stats()) })
}

fn disconnect(state: Arc<BridgeState>, args: Value) -> HandlerFuture {
    Box::pin(async move {
        let args: SessionArgs = parse_args(args)?;
        state.server.disconnect(parse_session_id(&args.session_id)?)?;
        Ok(Value::Null)
    })
}

fn set_focus(state: Arc<BridgeState>, args: Value) -> HandlerFuture {
    Box::pin(async move {
        let args: FocusArgs = parse_args(args)?;
        let target = args.session_id.as_deref().map(parse_session_id).transpose()?;
        state.server.set_focus(target)?;
        Ok(Value::Null)
    })
}

fn send_input(state: Arc<BridgeState>, args: Value) -> HandlerFuture {
    Box::pin(async move {
        let event: InputEvent = parse_args(args)?;
        state
            .capture
            .send(event)
            .await
            .map_err(|_| BridgeError::CaptureClosed)?;
        Ok(Value::Null)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::network::server::ServerSettings;
    use serde_json::json;

    fn make_state() -> (Arc<BridgeState>, mpsc::Receiver<InputEvent>) {
        let server = KvmServer::new(ServerSettings::new("test", 4, "secret")).unwrap();
        let (capture, rx) = mpsc::channel(4);
        (Arc::new(BridgeState { server, capture }), rx)
    }

    fn request(command: &str, args: Value) -> CommandRequest {
        CommandRequest {
            command: command.to_string(),
            args,
        }
    }

    #[test]
    fn test_builtin_command_table_is_valid() {
        assert!(validate_command_table(COMMANDS).is_ok());
    }

    #[test]
    fn test_duplicate_command_names_are_rejected() {
        let table: &[(&str, Handler)] = &[
            ("connection_stats", connection_stats),
            ("connection_stats", get_active_sessions),
        ];
        assert!(matches!(
            validate_command_table(table),
            Err(BridgeError::InvalidTable(_))
        ));
    }

    #[tokio::test]
    async fn test_get_active_sessions_returns_zero_initially() {
        // Arrange
        let (state, _rx) = make_state();

        // Act
        let result = dispatch(state, request("get_active_sessions", Value::Null)).await;

        // Assert
        assert!(result.success);
        assert_eq!(result.data.unwrap(), json!(0));
    }

    #[tokio::test]
    async fn test_list_sessions_returns_empty_list_initially() {
        let (state, _rx) = make_state();
        let result = dispatch(state, request("list_sessions", Value::Null)).await;
        assert!(result.success);
        assert_eq!(result.data.unwrap(), json!([]));
    }

    #[tokio::test]
    async fn test_connection_stats_reports_zero_sessions() {
        let (state, _rx) = make_state();
        let result = dispatch(state, request("connection_stats", Value::Null)).await;
        assert!(result.success);
        assert_eq!(result.data.unwrap()["active_session_count"], json!(0));
    }

    #[tokio::test]
    async fn test_unknown_command_fails() {
        let (state, _rx) = make_state();
        let result = dispatch(state, request("reboot", Value::Null)).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("reboot"));
    }

    #[tokio::test]
    async fn test_disconnect_with_invalid_uuid_fails() {
        let (state, _rx) = make_state();
        let result = dispatch(state, request("disconnect", json!({"session_id": "nope"}))).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("invalid session_id"));
    }

    #[tokio::test]
    async fn test_disconnect_unknown_session_reports_not_found() {
        let (state, _rx) = make_state();
        let id = SessionId::generate();
        let result = dispatch(
            state,
            request("disconnect", json!({"session_id": id.to_string()})),
        )
        .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_send_input_feeds_capture_channel() {
        // Arrange
        let (state, mut rx) = make_state();
        let event = InputEvent::mouse_move(3, 4, 0);

        // Act
        let result = dispatch(state, request("send_input", serde_json::to_value(&event).unwrap())).await;

        // Assert
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(rx.recv().await, Some(event));
    }

    #[tokio::test]
    async fn test_console_answers_one_line_per_request() {
        // Arrange
        let (state, _rx) = make_state();
        let input = b"{\"command\":\"connection_stats\"}\n\nnot json\n".to_vec();
        let mut output = Vec::new();

        // Act
        run_console(state, &input[..], &mut output).await.unwrap();

        // Assert
        let text = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(first["success"], json!(true));
        assert_eq!(second["success"], json!(false));
    }

    #[test]
    fn test_command_result_err_sets_success_false() {
        let r: CommandResult<i32> = CommandResult::err("something went wrong");
        assert!(!r.success);
        assert!(r.data.is_none());
        assert_eq!(r.error.unwrap(), "something went wrong");
    }
}

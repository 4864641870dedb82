//! KVM-Over-IP client entry point.
//!
//! Wires together the network connection, the reconnect loop and the command
//! console, then runs the Tokio async event loop.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load config, apply command-line overrides, validate
//!  └─ KvmClient::new(TcpConnector)
//!  └─ run_with_reconnect(server)  -- connect, heartbeat, backoff on loss
//!  └─ run_console(stdin)          -- JSON automation commands
//!  └─ Ctrl-C                      -- cancel, close the session, exit
//! ```
//!
//! # Platform input injector
//!
//! The `LoggingInjector` used here counts and logs injected events rather
//! than synthesising OS input.  A platform backend (`SendInput`, XTest,
//! CoreGraphics) is plugged in through `ClientSettings::injector`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::BufReader;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kvm_client::infrastructure::network::tcp::TcpConnector;
use kvm_client::infrastructure::storage::config::{config_file_path, load_config};
use kvm_client::infrastructure::ui_bridge::{run_console, validate_command_table, BridgeState, COMMANDS};
use kvm_client::{ClientSettings, KvmClient, ReconnectEvent, ReconnectOutcome};

#[derive(Debug, Parser)]
#[command(name = "kvm-client", version, about = "KVM-Over-IP session client")]
struct Args {
    /// Path to the TOML config file (defaults to the platform config dir).
    #[arg(long, env = "KVM_CLIENT_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `[client] server_address`.
    #[arg(long)]
    server: Option<String>,

    /// Overrides `[client] name`.
    #[arg(long)]
    name: Option<String>,

    /// Overrides `[auth] shared_secret`.
    #[arg(long, env = "KVM_SHARED_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Disables the stdin command console.
    #[arg(long)]
    no_console: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let path = match args.config {
        Some(path) => path,
        None => config_file_path().context("locating the config file")?,
    };
    let mut config = load_config(&path).with_context(|| format!("loading {}", path.display()))?;
    if let Some(server) = args.server {
        config.client.server_address = server;
    }
    if let Some(name) = args.name {
        config.client.name = name;
    }
    if let Some(secret) = args.secret {
        config.auth.shared_secret = secret;
    }
    config.validate().context("validating configuration")?;

    // Initialise structured logging.  Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.client.log_level)),
        )
        .init();

    info!("KVM-Over-IP client starting (config {})", path.display());
    validate_command_table(COMMANDS).context("validating the command table")?;

    let client = KvmClient::new(TcpConnector::default(), ClientSettings::from_config(&config))
        .context("building the client")?;

    // ── Reconnect loop ────────────────────────────────────────────────────────
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let session_loop = {
        let client = Arc::clone(&client);
        let server = config.client.server_address.clone();
        tokio::spawn(async move { client.run_with_reconnect(&server, cancel_rx, Some(events_tx)).await })
    };
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                ReconnectEvent::Established { session_id } => info!("connected (session {session_id})"),
                ReconnectEvent::Lost(e) => warn!("connection lost: {e}"),
                ReconnectEvent::RetryScheduled { attempt, delay } => {
                    info!("retry {attempt} in {} ms", delay.as_millis())
                }
                ReconnectEvent::GaveUp { attempts } => error!("gave up after {attempts} attempts"),
            }
        }
    });

    // ── Automation console ────────────────────────────────────────────────────
    if !args.no_console {
        let state = Arc::new(BridgeState {
            client: Arc::clone(&client),
        });
        tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            if let Err(e) = run_console(state, stdin, tokio::io::stdout()).await {
                error!("command console failed: {e}");
            }
        });
    }

    info!("KVM-Over-IP client running.  Press Ctrl-C to exit.");
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for the shutdown signal")?;
            info!("shutdown signal received");
            cancel_tx.send_replace(true);
        }
        _ = wait_for_loop_end(&cancel_tx) => {}
    }

    match session_loop.await.context("joining the session loop")? {
        Ok(ReconnectOutcome::Cancelled) => info!("KVM-Over-IP client stopped"),
        Ok(ReconnectOutcome::Closed(end)) => info!("server closed the session ({:?})", end.reason),
        Err(e) => {
            error!("session ended: {e}");
            return Err(e).context("keeping the session alive");
        }
    }
    Ok(())
}

/// Resolves when every cancel receiver is gone, that is when the reconnect
/// loop has returned on its own.
async fn wait_for_loop_end(cancel: &watch::Sender<bool>) {
    cancel.closed().await;
}

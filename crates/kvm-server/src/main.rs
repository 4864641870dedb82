//! KVM-Over-IP server entry point.
//!
//! Wires together the infrastructure services and starts the Tokio runtime.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load config, apply command-line overrides, validate
//!  └─ KvmServer::start_server()   -- TCP accept loop, one task per connection
//!  └─ forward_from(capture)      -- captured input → focused session
//!  └─ run_console(stdin)         -- JSON automation commands
//!  └─ Ctrl-C                     -- close every session, exit
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kvm_server::infrastructure::input_capture::ChannelInputCapture;
use kvm_server::infrastructure::storage::config::{config_file_path, load_config};
use kvm_server::infrastructure::ui_bridge::{run_console, validate_command_table, BridgeState, COMMANDS};
use kvm_server::{KvmServer, ServerSettings};

/// Capacity of the channel between capture sources and the forwarder.
const CAPTURE_BUFFER: usize = 1024;

#[derive(Debug, Parser)]
#[command(name = "kvm-server", version, about = "KVM-Over-IP session server")]
struct Args {
    /// Path to the TOML config file (defaults to the platform config dir).
    #[arg(long, env = "KVM_SERVER_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `[server] bind_address`.
    #[arg(long)]
    bind: Option<String>,

    /// Overrides `[server] max_clients`.
    #[arg(long)]
    max_clients: Option<usize>,

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
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }
    if let Some(max_clients) = args.max_clients {
        config.server.max_clients = max_clients;
    }
    if let Some(secret) = args.secret {
        config.auth.shared_secret = secret;
    }
    config.validate().context("validating configuration")?;

    // Initialise structured logging.  Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .init();

    info!("KVM-Over-IP server starting (config {})", path.display());
    validate_command_table(COMMANDS).context("validating the command table")?;

    let server = KvmServer::new(ServerSettings::from_config(&config))?;
    let bound = server
        .start_server(&config.server.bind_address)
        .await
        .context("starting the listener")?;
    info!(
        "accepting up to {} clients on {bound}",
        server.max_clients()
    );

    // ── Input capture ─────────────────────────────────────────────────────────
    // Platform hooks would hold a clone of `capture_tx`; the console feeds the
    // same channel through `send_input`.
    let (capture_tx, capture) = ChannelInputCapture::new(CAPTURE_BUFFER);
    let _forwarding = server.forward_from(capture);

    // ── Automation console ────────────────────────────────────────────────────
    if !args.no_console {
        let state = Arc::new(BridgeState {
            server: Arc::clone(&server),
            capture: capture_tx,
        });
        tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            if let Err(e) = run_console(state, stdin, tokio::io::stdout()).await {
                error!("command console failed: {e}");
            }
        });
    }

    info!("KVM-Over-IP server ready.  Press Ctrl-C to exit.");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for the shutdown signal")?;

    info!("shutdown signal received");
    server.shutdown();
    // Give sessions their drain window to say goodbye.
    tokio::time::sleep(config.protocol.drain_timeout()).await;
    info!("KVM-Over-IP server stopped");
    Ok(())
}

//! cmdwire: binary command server over WebSocket
//!
//! Runs the session engine with a small set of built-in commands so the
//! server can be exercised with any WebSocket client.
//!
//! Usage:
//!   cmdwire                           # Listen on 127.0.0.1:8080/ws
//!   cmdwire --port 9000 --verbose     # Custom port, debug logging
//!   cmdwire --rate 50 --burst 100     # Tighter per-session rate limit
//!
//! Built-in commands:
//!   0x00000001  echo the payload back to the sender
//!   0x00000002  broadcast the payload to every session
//!   RPC "echo"      return the params object
//!   RPC "sessions"  return the number of live sessions

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use cmdwire_protocol::{HandlerResult, Params};
use cmdwire_server::{AcceptPolicy, RateLimitConfig, Server, ServerConfig};
use cmdwire_transport::TransportConfig;
use serde_json::{Value, json};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CMD_ECHO: u32 = 0x0001;
const CMD_BROADCAST: u32 = 0x0002;

#[derive(Parser, Debug)]
#[command(name = "cmdwire", about = "cmdwire: binary command server over WebSocket")]
struct Cli {
    /// Port to listen on (0 for OS-assigned)
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// WebSocket upgrade path
    #[arg(long, default_value = "/ws")]
    path: String,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Sustained inbound messages per second per session
    #[arg(long, default_value = "100")]
    rate: f64,

    /// Inbound burst size per session
    #[arg(long, default_value = "200")]
    burst: u32,

    /// Disable inbound rate limiting
    #[arg(long)]
    no_rate_limit: bool,

    /// Only accept upgrades from these origins (repeatable)
    #[arg(long = "allow-origin")]
    allow_origins: Vec<String>,

    /// Seconds to wait for sessions to close on shutdown
    #[arg(long, default_value = "5")]
    shutdown_timeout: u64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Log to a file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if let Some(log_path) = &cli.log_file {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("failed to open log file {}", log_path.display()))?;

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
        eprintln!("Logging to {}", log_path.display());
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

fn server_config(cli: &Cli) -> ServerConfig {
    let rate_limit = if cli.no_rate_limit {
        RateLimitConfig::disabled()
    } else {
        RateLimitConfig::new(cli.rate, cli.burst)
    };
    ServerConfig {
        transport: TransportConfig {
            hostname: cli.hostname.clone(),
            port: cli.port,
            path: cli.path.clone(),
            max_connections: cli.max_connections,
            ..Default::default()
        },
        rate_limit,
        ..Default::default()
    }
}

fn build_server(cli: &Cli) -> anyhow::Result<Server> {
    let policy = if cli.allow_origins.is_empty() {
        AcceptPolicy::allow_all()
    } else {
        AcceptPolicy::allow_origins(cli.allow_origins.clone())
    };

    let server = Server::builder(server_config(cli))
        .accept_policy(policy)
        .on_connect(|session| info!(session_id = %session.id(), "client connected"))
        .on_disconnect(|session, voluntary| {
            info!(session_id = %session.id(), voluntary, "client disconnected")
        })
        .build();

    server.register_handler(CMD_ECHO, |session, payload| async move {
        if let Err(e) = session.send(CMD_ECHO, &payload).await {
            warn!(session_id = %session.id(), "echo failed: {e}");
        }
    })?;

    let registry = server.registry();
    server.register_handler(CMD_BROADCAST, move |_session, payload| {
        let registry = registry.clone();
        async move {
            if let Err(e) = registry.broadcast(CMD_BROADCAST, &payload).await {
                warn!("broadcast failed: {e}");
            }
        }
    })?;

    server.register_rpc_handler("echo", |params: Params| async move { HandlerResult::Ok(Value::Object(params)) });

    let registry = server.registry();
    server.register_rpc_handler("sessions", move |_params: Params| {
        let count = registry.len();
        async move { HandlerResult::Ok(json!({ "count": count })) }
    });

    Ok(server)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let server = build_server(&cli)?;
    server.start().await.context("failed to start server")?;

    let addr = server
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|| format!("{}:{}", cli.hostname, cli.port));

    println!();
    println!("────────────────────────────────────────────────────────────────");
    println!("  cmdwire");
    println!("────────────────────────────────────────────────────────────────");
    println!();
    println!("  WebSocket:  ws://{addr}{}", cli.path);
    println!("  Health:     http://{addr}/health");
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;

    println!();
    println!("  Shutting down...");
    if let Err(e) = server.stop(Duration::from_secs(cli.shutdown_timeout)).await {
        warn!("shutdown incomplete: {e}");
    }
    println!("  Server stopped.");
    Ok(())
}

//! attn-ptyd: PTY session daemon for attn.
//!
//! Spawns coding-agent terminals, keeps their output replayable and lets UI
//! clients attach, detach and reattach over a loopback WebSocket.

use anyhow::Context;
use attn_ptyd::config::DEFAULT_CONFIG_PATH;
use attn_ptyd::{CliOverrides, PtyServer, ServerConfig};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// attn-ptyd: PTY session daemon
#[derive(Parser, Debug)]
#[command(name = "attn-ptyd", version, about = "PTY session daemon for attn")]
struct Cli {
    /// Listen address (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Config file path
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Replay window per session, in bytes
    #[arg(long)]
    scrollback_bytes: Option<usize>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Record every session as JSONL into this directory
    #[arg(long)]
    capture_dir: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting attn-ptyd");

    if let Err(e) = run(cli).await {
        error!(error = format!("{e:#}"), "attn-ptyd failed");
        std::process::exit(1);
    }

    info!("attn-ptyd stopped");
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let overrides = CliOverrides {
        listen: cli.listen,
        scrollback_bytes: cli.scrollback_bytes,
        max_sessions: cli.max_sessions,
        capture_dir: cli.capture_dir,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = ServerConfig::load(Some(&config_path), overrides)
        .context("failed to load config")?;

    let server = Arc::new(PtyServer::new(config));
    server
        .start()
        .await
        .context("failed to start listener")?;

    shutdown_signal().await?;
    info!("received shutdown signal");
    server.shutdown().await;
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = ctrl_c => result?,
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    Ok(())
}

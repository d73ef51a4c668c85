//! canlinkd - canlink gateway daemon
//!
//! Shares CAN adapters with local processes over a per-user Unix socket.
//!
//! Usage:
//!   canlinkd [OPTIONS] [COMMAND]
//!
//! Without a command the daemon serves until it receives ctrl-c or a `quit`
//! command. The other commands talk to a running daemon.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use canlink_client::GatewayClient;
use canlink_gateway::{GatewayError, GatewayServer};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::DaemonConfig;

#[derive(Parser)]
#[command(name = "canlinkd")]
#[command(author, version, about = "canlink gateway daemon")]
struct Cli {
    /// Gateway socket path
    #[arg(short, long, env = "CANLINK_SOCKET")]
    socket: Option<PathBuf>,

    /// Configuration file path (TOML)
    #[arg(short, long, env = "CANLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default)
    Serve,
    /// Check that a gateway is answering
    Ping,
    /// Ask a running gateway to shut down
    Quit,
    /// List the adapters a running gateway offers
    Adapters,
    /// List serial ports seen by a running gateway
    Ports,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DaemonConfig::load(cli.config.as_deref())?;

    // RUST_LOG wins over the config file
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter(cli.verbose).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let socket = config.socket_path(cli.socket.as_deref());
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(socket, &config).await,
        Commands::Ping => {
            GatewayClient::new(&socket).ping().await?;
            println!("pong");
            Ok(())
        }
        Commands::Quit => {
            GatewayClient::new(&socket).quit().await?;
            println!("bye");
            Ok(())
        }
        Commands::Adapters => {
            let adapters = GatewayClient::new(&socket).list_adapters().await?;
            println!("{}", serde_json::to_string_pretty(&adapters)?);
            Ok(())
        }
        Commands::Ports => {
            let ports = GatewayClient::new(&socket).list_ports().await?;
            println!("{}", serde_json::to_string_pretty(&ports)?);
            Ok(())
        }
    }
}

async fn serve(socket: PathBuf, config: &DaemonConfig) -> Result<()> {
    tracing::info!("Starting canlinkd (canlink gateway daemon)");

    let registry = canlink_adapters::default_registry().context("Adapter registration failed")?;
    let adapters: Vec<_> = registry.list().into_iter().map(|info| info.name).collect();
    tracing::info!(adapters = ?adapters, "Registered adapters");

    let server = match GatewayServer::bind(&socket, Arc::new(registry)).await {
        Ok(server) => server.with_drain_grace(config.close_grace()),
        Err(GatewayError::AlreadyRunning(path)) => {
            tracing::info!(path = %path.display(), "Gateway already running, exiting");
            return Ok(());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to bind {}", socket.display()))
        }
    };

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupted, shutting down");
                shutdown.cancel();
            }
            Err(err) => tracing::warn!(error = %err, "Cannot listen for ctrl-c"),
        }
    });

    server.serve().await?;
    Ok(())
}

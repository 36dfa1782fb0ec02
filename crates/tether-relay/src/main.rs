//! Tether Relay Binary
//!
//! Long-running relay started on the remote host, plus the `probe`
//! subcommand used during bootstrap to check that one is answering.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::time::Duration;
use tether_proto::DEFAULT_RELAY_PORT;
use tether_relay::{probe, RelayConfig, RelayServer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Remote relay for filesystem access and terminal sessions
#[derive(Parser, Debug)]
#[command(name = "tether-relay")]
#[command(version)]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for connections
    Serve {
        /// Address to bind
        #[arg(long, env = "TETHER_RELAY_BIND", default_value = "0.0.0.0")]
        bind: String,
        /// Port to listen on
        #[arg(long, env = "TETHER_RELAY_PORT", default_value_t = DEFAULT_RELAY_PORT)]
        port: u16,
        /// Shell for new sessions
        #[arg(long, env = "TETHER_SHELL")]
        shell: Option<String>,
        /// Serve sessions from piped processes only
        #[arg(long, env = "TETHER_NO_PTY")]
        no_pty: bool,
    },
    /// Exit 0 if a relay answers on the port, 1 otherwise
    Probe {
        /// Host to connect to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Relay port
        #[arg(long, env = "TETHER_RELAY_PORT", default_value_t = DEFAULT_RELAY_PORT)]
        port: u16,
        /// How long to wait for the greeting
        #[arg(long, default_value_t = 3000)]
        timeout_ms: u64,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout is reserved for probe output; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve { bind, port, shell, no_pty } => {
            let config = RelayConfig {
                bind,
                port,
                shell,
                disable_pty: no_pty,
                ..Default::default()
            };
            info!("Starting tether relay {}", env!("CARGO_PKG_VERSION"));
            let server = RelayServer::bind(config).await?;

            tokio::select! {
                result = server.run() => {
                    if let Err(e) = result {
                        error!("Relay error: {:#}", e);
                        std::process::exit(1);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down");
                }
            }
            Ok(())
        }
        Command::Probe { host, port, timeout_ms } => {
            match probe(&host, port, Duration::from_millis(timeout_ms)).await {
                Ok(greeting) => {
                    println!("{}", serde_json::to_string(&greeting)?);
                    Ok(())
                }
                Err(e) => {
                    eprintln!("probe failed: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}

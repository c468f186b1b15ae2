use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use trp::{run_tunnel, ClientConfig, ResolvedClientConfig};

/// trp - expose a local TCP service through a trp server
#[derive(Parser, Debug)]
#[command(name = "trp")]
#[command(about = "Expose a local TCP port through a reverse tunnel")]
struct Cli {
    /// Tunnel server host [default: 127.0.0.1]
    #[arg(short = 's', long)]
    server_host: Option<String>,

    /// Tunnel server control port [default: 7777]
    #[arg(short = 'r', long)]
    server_port: Option<u16>,

    /// Port to expose on the server, 0 lets the server pick [default: 7080]
    #[arg(short = 'p', long)]
    remote_port: Option<u16>,

    /// Host of the local service [default: 127.0.0.1]
    #[arg(long)]
    local_host: Option<String>,

    /// Port of the local service [default: 9090]
    #[arg(short = 'l', long)]
    local_port: Option<u16>,

    /// Read settings from a TOML file (flags take precedence)
    #[arg(short, long)]
    config: Option<String>,

    /// Exit when the connection drops instead of reconnecting
    #[arg(long)]
    no_reconnect: bool,

    /// Seconds to wait before reconnecting [default: 5]
    #[arg(long)]
    reconnect_delay: Option<u64>,
}

impl Cli {
    fn resolve(self) -> Result<ResolvedClientConfig> {
        let file = match &self.config {
            Some(path) => ClientConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path))?,
            None => ClientConfig::default(),
        };

        let flags = ClientConfig {
            server_host: self.server_host,
            server_port: self.server_port,
            remote_port: self.remote_port,
            local_host: self.local_host,
            local_port: self.local_port,
            reconnect: self.no_reconnect.then_some(false),
            reconnect_delay_secs: self.reconnect_delay,
        };

        Ok(flags.or(file).resolve())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("trp=info".parse()?)
                .add_directive("trp_common=info".parse()?),
        )
        .init();

    let config = Cli::parse().resolve()?;
    tracing::info!(
        "Exposing {} as port {} on {}",
        config.local_addr(),
        config.mapping.remote,
        config.server_addr()
    );

    // Reconnection loop
    loop {
        tracing::info!("Connecting to {}...", config.server_addr());

        tokio::select! {
            result = run_tunnel(&config) => {
                match result {
                    Ok(()) => tracing::info!("Tunnel closed by server"),
                    Err(e) => tracing::error!("Tunnel error: {}", e),
                }
            }
            _ = shutdown_signal() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }

        if !config.reconnect {
            break;
        }

        tracing::info!("Reconnecting in {} seconds...", config.reconnect_delay.as_secs());
        tokio::select! {
            _ = tokio::time::sleep(config.reconnect_delay) => {}
            _ = shutdown_signal() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    tracing::info!("Client shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

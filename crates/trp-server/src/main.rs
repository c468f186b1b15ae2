use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use trp_server::{close_all_sessions, new_session_registry, ControlPlane, ServerConfig};

/// Tunnel server - accepts tunnel clients and exposes their ports publicly
#[derive(Parser, Debug)]
#[command(name = "trp-server")]
#[command(about = "Reverse TCP tunnel server")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "server.toml")]
    config: String,

    /// Address the control plane binds to
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Control plane port
    #[arg(short, long)]
    port: Option<u16>,

    /// Address public tunnel listeners bind to
    #[arg(long)]
    tunnel_bind: Option<IpAddr>,

    /// Seconds without traffic before a client is dropped (0 disables)
    #[arg(long)]
    heartbeat_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("trp_server=info".parse()?)
                .add_directive("trp_common=info".parse()?),
        )
        .init();

    let args = Args::parse();
    tracing::info!("Starting tunnel server with config: {}", args.config);

    let mut config = ServerConfig::load_and_resolve(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    // Command-line flags win over everything else
    if let Some(bind) = args.bind {
        config.control_addr.set_ip(bind);
    }
    if let Some(port) = args.port {
        config.control_addr.set_port(port);
    }
    if let Some(tunnel_bind) = args.tunnel_bind {
        config.tunnel_bind_addr = tunnel_bind;
    }
    if let Some(secs) = args.heartbeat_timeout {
        config.heartbeat_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }

    tracing::info!("Control plane address: {}", config.control_addr);
    tracing::info!("Tunnel bind address: {}", config.tunnel_bind_addr);
    match config.heartbeat_timeout {
        Some(timeout) => tracing::info!("Heartbeat timeout: {}s", timeout.as_secs()),
        None => tracing::info!("Heartbeat timeout: disabled"),
    }

    let sessions = new_session_registry();
    let control_plane = ControlPlane::new(
        sessions.clone(),
        config.tunnel_bind_addr,
        config.heartbeat_timeout,
    );

    tokio::select! {
        result = control_plane.run(config.control_addr) => {
            result.with_context(|| format!("Control plane on {} stopped", config.control_addr))?;
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, cleaning up...");
        }
    }

    let closed = close_all_sessions(&sessions);
    tracing::info!("Closed {} session(s)", closed);
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
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
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

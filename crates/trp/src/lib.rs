//! trp tunnel client library
//!
//! Connects to a trp server, asks it to expose a port and forwards every
//! visitor on that port to a local TCP service.

mod config;
mod connector;
mod tcp_forwarder;

pub use config::{
    ClientConfig, ResolvedClientConfig, DEFAULT_LOCAL_HOST, DEFAULT_LOCAL_PORT,
    DEFAULT_RECONNECT_DELAY, DEFAULT_REMOTE_PORT, DEFAULT_SERVER_HOST, DEFAULT_SERVER_PORT,
};
pub use connector::TunnelConnection;
pub use tcp_forwarder::TcpForwarder;

use trp_common::TunnelError;

/// Connect, request the configured mapping and relay until the server goes away
pub async fn run_tunnel(config: &ResolvedClientConfig) -> Result<(), TunnelError> {
    let forwarder = TcpForwarder::new(config.local_addr());
    let connection = TunnelConnection::connect(&config.server_addr(), forwarder).await?;
    connection.request_ports(config.mapping).await?;
    connection.run().await
}

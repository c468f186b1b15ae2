use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use trp_common::{dispatch, ControlHandler, Session, TunnelError};
use trp_protocol::{PortMapping, VisitorId};

use crate::state::SessionRegistry;

/// Control plane server that accepts tunnel client connections
pub struct ControlPlane {
    sessions: SessionRegistry,
    handler: ServerHandler,
    heartbeat_timeout: Option<Duration>,
}

impl ControlPlane {
    pub fn new(
        sessions: SessionRegistry,
        tunnel_bind_addr: IpAddr,
        heartbeat_timeout: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            handler: ServerHandler { tunnel_bind_addr },
            heartbeat_timeout,
        })
    }

    /// Start listening for tunnel client connections
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve control connections on an already bound listener
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!("Control plane listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("Failed to accept control connection: {}", e);
                    continue;
                }
            };
            let this = self.clone();

            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream, peer_addr).await {
                    tracing::error!("Connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), TunnelError> {
        tracing::info!("New connection from {}", peer_addr);

        let (session, read_half) = Session::start(stream, peer_addr);
        self.sessions.insert(peer_addr, session.clone());

        let result = dispatch(session, read_half, &self.handler, self.heartbeat_timeout).await;

        self.sessions.remove(&peer_addr);
        result
    }
}

/// Server side of the control protocol: PORTS opens the public listener,
/// NEW_VISITOR is never valid from a client
pub struct ServerHandler {
    tunnel_bind_addr: IpAddr,
}

#[async_trait]
impl ControlHandler for ServerHandler {
    async fn on_ports(
        &self,
        session: &Arc<Session>,
        mapping: PortMapping,
    ) -> Result<(), TunnelError> {
        tracing::info!("Port request from {}: {}", session.peer_addr(), mapping);

        let addr = SocketAddr::new(self.tunnel_bind_addr, mapping.remote);
        match session.bind_remote_port(addr).await {
            Ok(port) => tracing::info!(
                "Tunnel open: {} -> {} (local port {})",
                port,
                session.peer_addr(),
                mapping.local
            ),
            // The session stays up; the client keeps heartbeating against a dead tunnel
            Err(e) => tracing::error!("Failed to open tunnel for {}: {}", session.peer_addr(), e),
        }
        Ok(())
    }

    async fn on_new_visitor(
        &self,
        session: &Arc<Session>,
        visitor_id: VisitorId,
    ) -> Result<(), TunnelError> {
        tracing::warn!(
            "Ignoring NEW_VISITOR {} from client {}: visitors are announced by the server",
            visitor_id,
            session.peer_addr()
        );
        Ok(())
    }
}

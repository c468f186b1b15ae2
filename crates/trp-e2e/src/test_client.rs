//! Test client for E2E tests
//!
//! Runs the real client connection in a background task against a
//! [`TestServer`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;

use trp::{TcpForwarder, TunnelConnection};
use trp_common::{Session, TunnelError};
use trp_protocol::{PortMapping, HEARTBEAT_INTERVAL};

use crate::harness::TestServer;

/// A test tunnel client
pub struct TestClient {
    /// Our end of the control connection (the server's registry key)
    pub local_addr: SocketAddr,
    session: Arc<Session>,
    handle: Option<JoinHandle<Result<(), TunnelError>>>,
}

impl TestClient {
    /// Connect and ask the server for an ephemeral tunnel port
    pub async fn connect(server: &TestServer, local_addr: &str) -> Result<Self> {
        Self::connect_with(server, local_addr, 0, HEARTBEAT_INTERVAL).await
    }

    /// Connect, requesting `remote_port` and heartbeating every `heartbeat_interval`
    pub async fn connect_with(
        server: &TestServer,
        local_addr: &str,
        remote_port: u16,
        heartbeat_interval: Duration,
    ) -> Result<Self> {
        let forwarder = TcpForwarder::new(local_addr.to_string());
        let connection = TunnelConnection::connect(&server.control_addr.to_string(), forwarder)
            .await?
            .with_heartbeat_interval(heartbeat_interval);

        // Local port travels in PORTS for parity with the real client
        let local_port = local_addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);
        connection
            .request_ports(PortMapping {
                remote: remote_port,
                local: local_port,
            })
            .await?;

        let client_addr = connection.local_addr();
        let session = connection.session().clone();
        let handle = tokio::spawn(connection.run());

        Ok(Self {
            local_addr: client_addr,
            session,
            handle: Some(handle),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn visitor_count(&self) -> usize {
        self.session.visitor_count()
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Drop the control connection
    pub fn shutdown(&self) {
        self.session.close();
    }

    /// Wait for the connection task to finish
    pub async fn join(&mut self) -> Option<Result<(), TunnelError>> {
        let handle = self.handle.take()?;
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .ok()?
            .ok()
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.session.close();
    }
}

//! Test server harness for E2E tests
//!
//! Starts a complete trp server on an ephemeral loopback port. Tunnel
//! listeners bind to 127.0.0.1 as well.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;

use trp_common::Session;
use trp_server::{close_all_sessions, new_session_registry, ControlPlane, SessionRegistry};

/// How long the `wait_for_*` helpers poll before giving up
const WAIT_LIMIT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A running test server instance
pub struct TestServer {
    /// Control plane address
    pub control_addr: SocketAddr,
    sessions: SessionRegistry,
    /// Shutdown signal sender
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    /// Start a test server without idle enforcement
    pub async fn start() -> Self {
        Self::start_with_heartbeat_timeout(None).await
    }

    /// Start a test server that drops clients silent for `timeout`
    pub async fn start_with_heartbeat_timeout(timeout: Option<Duration>) -> Self {
        let sessions = new_session_registry();
        let control_plane =
            ControlPlane::new(sessions.clone(), IpAddr::V4(Ipv4Addr::LOCALHOST), timeout);

        let control_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind control plane");
        let control_addr = control_listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let registry = sessions.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = control_plane.run_with_listener(control_listener) => {
                    if let Err(e) = result {
                        tracing::error!("Control plane error: {}", e);
                    }
                }
                _ = shutdown_rx => {
                    tracing::debug!("Control plane shutting down");
                }
            }
            close_all_sessions(&registry);
        });

        Self {
            control_addr,
            sessions,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Session for the client connected from `client_addr`
    pub fn session(&self, client_addr: SocketAddr) -> Option<Arc<Session>> {
        self.sessions.get(&client_addr).map(|entry| entry.value().clone())
    }

    /// Wait until the client's PORTS request has opened a tunnel listener
    pub async fn wait_for_tunnel_port(&self, client_addr: SocketAddr) -> u16 {
        let mut port = None;
        wait_until(|| {
            port = self.session(client_addr).and_then(|s| s.listen_port());
            port.is_some()
        })
        .await;
        port.expect("tunnel listener was never opened")
    }

    /// Wait until exactly `count` sessions are registered
    pub async fn wait_for_session_count(&self, count: usize) {
        if !wait_until(|| self.session_count() == count).await {
            panic!(
                "expected {} session(s), still have {}",
                count,
                self.session_count()
            );
        }
    }

    /// Shutdown the test server, closing every session
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Poll `condition` until it holds or [`WAIT_LIMIT`] passes
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    condition()
}

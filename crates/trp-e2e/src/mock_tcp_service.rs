//! Mock TCP service for E2E tests
//!
//! Stands in for the local service behind the tunnel: it can echo data back,
//! answer with a fixed response, or just record what it receives.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use crate::harness::wait_until;

/// Behavior mode for the mock TCP service
#[derive(Clone, Debug)]
pub enum TcpServiceMode {
    /// Echo back all received data
    Echo,
    /// Read one chunk, reply with a fixed response, then close
    FixedResponse(Vec<u8>),
    /// Read until the peer closes, never reply
    Accumulate,
}

/// A finished connection and everything it received
#[derive(Clone, Debug)]
pub struct RecordedTcpConnection {
    pub received_data: Vec<u8>,
    pub peer_addr: SocketAddr,
}

/// A mock TCP service for testing
pub struct MockTcpService {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    /// Connections that have ended
    finished: Arc<RwLock<Vec<RecordedTcpConnection>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockTcpService {
    /// Start an echo service on an ephemeral port
    pub async fn start() -> Self {
        Self::start_with_mode(TcpServiceMode::Echo).await
    }

    /// Start a mock TCP service with a specific mode
    pub async fn start_with_mode(mode: TcpServiceMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock TCP service");
        let addr = listener.local_addr().unwrap();

        let accepted = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(RwLock::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let accepted_count = accepted.clone();
        let finished_log = finished.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        tracing::debug!("Mock TCP service shutting down");
                        break;
                    }
                    result = listener.accept() => match result {
                        Ok((stream, peer_addr)) => {
                            accepted_count.fetch_add(1, Ordering::SeqCst);
                            let finished = finished_log.clone();
                            let mode = mode.clone();
                            tokio::spawn(async move {
                                let received_data = serve(stream, mode).await;
                                finished.write().push(RecordedTcpConnection {
                                    received_data,
                                    peer_addr,
                                });
                            });
                        }
                        Err(e) => {
                            tracing::error!("Mock TCP accept error: {}", e);
                            break;
                        }
                    },
                }
            }
        });

        Self {
            addr,
            accepted,
            finished,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Get the address this service is listening on
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the address as a string
    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    /// Connections accepted so far, finished or not
    pub fn accepted_count(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Connections that have been closed, in the order they finished
    pub fn get_connections(&self) -> Vec<RecordedTcpConnection> {
        self.finished.read().clone()
    }

    /// Get total bytes received across finished connections
    pub fn total_bytes_received(&self) -> usize {
        self.finished
            .read()
            .iter()
            .map(|c| c.received_data.len())
            .sum()
    }

    /// Wait until `count` connections have been closed
    pub async fn wait_for_finished(&self, count: usize) -> bool {
        wait_until(|| self.finished.read().len() >= count).await
    }

    /// Shutdown the service
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockTcpService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run one connection to completion, returning everything it received
async fn serve(mut stream: TcpStream, mode: TcpServiceMode) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Mock TCP read error: {}", e);
                break;
            }
        };
        received.extend_from_slice(&buf[..n]);

        match &mode {
            TcpServiceMode::Echo => {
                if let Err(e) = stream.write_all(&buf[..n]).await {
                    tracing::debug!("Mock TCP echo error: {}", e);
                    break;
                }
            }
            TcpServiceMode::FixedResponse(response) => {
                if let Err(e) = stream.write_all(response).await {
                    tracing::debug!("Mock TCP response error: {}", e);
                }
                break;
            }
            TcpServiceMode::Accumulate => {}
        }
    }

    received
}

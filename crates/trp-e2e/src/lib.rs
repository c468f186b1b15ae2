//! End-to-end test utilities for the trp tunnel system
//!
//! This crate provides an in-process server, a client wrapper and a scriptable
//! local TCP service so whole tunnels can be exercised over loopback.

pub mod harness;
pub mod mock_tcp_service;
pub mod test_client;

pub use harness::TestServer;
pub use mock_tcp_service::{MockTcpService, RecordedTcpConnection, TcpServiceMode};
pub use test_client::TestClient;

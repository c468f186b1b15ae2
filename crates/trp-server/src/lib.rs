//! trp tunnel server library
//!
//! This library provides the core components for running a trp tunnel server.
//! It can be used to embed a tunnel server in other applications or for testing.

mod config;
mod control_plane;
mod state;

// Re-export public types
pub use config::{ResolvedServerConfig, ServerConfig, DEFAULT_CONTROL_PORT};
pub use control_plane::{ControlPlane, ServerHandler};
pub use state::{close_all_sessions, new_session_registry, SessionRegistry};

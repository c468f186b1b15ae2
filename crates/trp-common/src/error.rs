use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use trp_protocol::{CodecError, ProtocolError, VisitorId};

/// Common errors for tunnel operations
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Failed to connect to {addr}: {source}")]
    Dial {
        addr: String,
        source: std::io::Error,
    },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Session closed")]
    SessionClosed,

    #[error("No frame received for {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("Visitor {0} is already registered")]
    DuplicateVisitor(VisitorId),

    #[error("Visitor {0} is not draining its socket")]
    VisitorStalled(VisitorId),

    #[error("Remote port already bound to {0}")]
    AlreadyListening(u16),
}

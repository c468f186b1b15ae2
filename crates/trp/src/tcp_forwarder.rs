use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use trp_common::{ControlHandler, Session, TunnelError};
use trp_protocol::{ControlMessage, PortMapping, VisitorId};

/// Client side of the control protocol: every announced visitor gets a
/// fresh connection to the local service
pub struct TcpForwarder {
    local_addr: String,
}

impl TcpForwarder {
    pub fn new(local_addr: String) -> Self {
        Self { local_addr }
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    async fn dial(&self) -> Result<TcpStream, TunnelError> {
        let stream = TcpStream::connect(&self.local_addr)
            .await
            .map_err(|source| TunnelError::Dial {
                addr: self.local_addr.clone(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY on {}: {}", self.local_addr, e);
        }
        Ok(stream)
    }
}

#[async_trait]
impl ControlHandler for TcpForwarder {
    async fn on_ports(
        &self,
        session: &Arc<Session>,
        mapping: PortMapping,
    ) -> Result<(), TunnelError> {
        tracing::warn!(
            "Ignoring PORTS {} from server {}: port requests come from the client",
            mapping,
            session.peer_addr()
        );
        Ok(())
    }

    /// Dial the local service before returning, so DATA that follows the
    /// announcement finds the visitor registered
    async fn on_new_visitor(
        &self,
        session: &Arc<Session>,
        visitor_id: VisitorId,
    ) -> Result<(), TunnelError> {
        tracing::debug!("Opening connection {} to {}", visitor_id, self.local_addr);

        let stream = match self.dial().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("Visitor {}: {}", visitor_id, e);
                // Tell the server so it drops the external connection
                if let Err(e) = session.send(ControlMessage::CloseVisitor(visitor_id)).await {
                    tracing::debug!("Could not report failed dial for {}: {}", visitor_id, e);
                }
                return Ok(());
            }
        };

        match session.register_visitor(visitor_id, stream) {
            Ok(()) => {
                tracing::info!("Visitor {} connected to {}", visitor_id, self.local_addr);
            }
            Err(TunnelError::SessionClosed) => {}
            Err(e) => tracing::warn!("Dropping connection for visitor {}: {}", visitor_id, e),
        }
        Ok(())
    }
}

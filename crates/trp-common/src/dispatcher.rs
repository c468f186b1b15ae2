//! Control-plane dispatch loop shared by both roles
//!
//! The loop decodes frames off the control connection, pairs tagged frames
//! through a [`Sequencer`] and acts on each complete message. Role-specific
//! behavior (binding ports on the server, dialing the local target on the
//! client) is delegated to a [`ControlHandler`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio_util::codec::Decoder;
use trp_protocol::{ControlMessage, FrameCodec, PortMapping, Sequencer, VisitorId};

use crate::session::Session;
use crate::TunnelError;

/// Role-specific reactions to control messages
///
/// Returning an error tears the session down; recoverable problems should be
/// logged and swallowed by the implementation.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    /// The peer asked for a port mapping
    async fn on_ports(
        &self,
        session: &Arc<Session>,
        mapping: PortMapping,
    ) -> Result<(), TunnelError>;

    /// The peer announced a new visitor
    async fn on_new_visitor(
        &self,
        session: &Arc<Session>,
        visitor_id: VisitorId,
    ) -> Result<(), TunnelError>;
}

/// Run the dispatch loop until the control connection ends, then close the
/// session
///
/// With `idle_timeout` set, the connection is dropped if no frame arrives
/// within that window; every frame resets it.
pub async fn dispatch<R, H>(
    session: Arc<Session>,
    mut reader: R,
    handler: &H,
    idle_timeout: Option<Duration>,
) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin,
    H: ControlHandler + ?Sized,
{
    let result = read_loop(&session, &mut reader, handler, idle_timeout).await;
    session.close();

    match &result {
        Ok(()) => tracing::info!("Peer disconnected: {}", session.peer_addr()),
        Err(e) => tracing::warn!("Control connection {} terminated: {}", session.peer_addr(), e),
    }
    result
}

async fn read_loop<R, H>(
    session: &Arc<Session>,
    reader: &mut R,
    handler: &H,
    idle_timeout: Option<Duration>,
) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin,
    H: ControlHandler + ?Sized,
{
    let mut codec = FrameCodec::new();
    let mut sequencer = Sequencer::new();
    let mut read_buf = BytesMut::with_capacity(8192);
    let mut last_frame = Instant::now();

    loop {
        while let Some(frame) = codec.decode(&mut read_buf)? {
            last_frame = Instant::now();
            match sequencer.push(frame) {
                Ok(Some(msg)) => handle_message(session, handler, msg).await?,
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => tracing::warn!("Dropping message from {}: {}", session.peer_addr(), e),
            }
        }

        let read = tokio::select! {
            _ = session.closed() => return Ok(()),
            read = read_more(reader, &mut read_buf, idle_timeout.map(|t| (last_frame, t))) => read?,
        };

        if read == 0 {
            // Complete frames were drained above; anything left is a torn frame
            codec.decode_eof(&mut read_buf)?;
            return Ok(());
        }
    }
}

async fn read_more<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    deadline: Option<(Instant, Duration)>,
) -> Result<usize, TunnelError>
where
    R: AsyncRead + Unpin,
{
    match deadline {
        Some((since, timeout)) => tokio::time::timeout_at(since + timeout, reader.read_buf(buf))
            .await
            .map_err(|_| TunnelError::HeartbeatTimeout(timeout))?
            .map_err(TunnelError::from),
        None => Ok(reader.read_buf(buf).await?),
    }
}

async fn handle_message<H>(
    session: &Arc<Session>,
    handler: &H,
    msg: ControlMessage,
) -> Result<(), TunnelError>
where
    H: ControlHandler + ?Sized,
{
    match msg {
        ControlMessage::Ports(mapping) => handler.on_ports(session, mapping).await,
        ControlMessage::Heartbeat => {
            tracing::debug!("Heartbeat from {}", session.peer_addr());
            Ok(())
        }
        ControlMessage::NewVisitor(visitor_id) => handler.on_new_visitor(session, visitor_id).await,
        ControlMessage::CloseVisitor(visitor_id) => {
            if session.close_visitor(visitor_id) {
                tracing::debug!("Visitor {} closed by peer", visitor_id);
            } else {
                tracing::debug!("Close for unknown visitor {}", visitor_id);
            }
            Ok(())
        }
        ControlMessage::Data { visitor_id, data } => {
            tracing::debug!("Data for visitor {}: {} bytes", visitor_id, data.len());
            session.forward_to_visitor(visitor_id, data).await;
            Ok(())
        }
    }
}

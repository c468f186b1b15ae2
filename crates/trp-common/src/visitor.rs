use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use trp_protocol::VisitorId;

use crate::TunnelError;

/// Chunks queued for a visitor socket before the visitor counts as stalled
pub const VISITOR_QUEUE_DEPTH: usize = 64;

/// One relayed TCP connection
///
/// The socket itself is split between a relay task (socket to tunnel) and a
/// writer task (tunnel to socket). Closing the visitor cancels both; bytes
/// already queued for the socket are flushed before its write side is shut
/// down, unless the socket itself is blocked.
pub struct Visitor {
    id: VisitorId,
    writer: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Visitor {
    pub(crate) fn new(id: VisitorId) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (writer, rx) = mpsc::channel(VISITOR_QUEUE_DEPTH);
        let visitor = Arc::new(Self {
            id,
            writer,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        (visitor, rx)
    }

    pub fn id(&self) -> VisitorId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the visitor, returning `false` if it was already closed
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    /// Resolves once the visitor has been closed
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Queue bytes for the visitor socket without waiting
    ///
    /// A visitor whose queue is full is not draining its socket; the caller
    /// gets [`TunnelError::VisitorStalled`] instead of blocking.
    pub fn send(&self, data: Bytes) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::ConnectionClosed);
        }
        match self.writer.try_send(data) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TunnelError::VisitorStalled(self.id)),
            Err(TrySendError::Closed(_)) => Err(TunnelError::ConnectionClosed),
        }
    }

    /// Drain queued bytes into the socket until the visitor is closed
    pub(crate) async fn write_loop<W>(
        &self,
        mut writer: W,
        mut rx: mpsc::Receiver<Bytes>,
    ) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let data = tokio::select! {
                biased;
                data = rx.recv() => match data {
                    Some(data) => data,
                    None => break,
                },
                _ = self.cancel.cancelled() => break,
            };

            // After a close, queued bytes only go out while the socket keeps up
            tokio::select! {
                biased;
                result = writer.write_all(&data) => result?,
                _ = self.cancel.cancelled() => break,
            }
        }

        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Visitor {} shutdown: {}", self.id, e);
        }
        Ok(())
    }
}

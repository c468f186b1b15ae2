use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use trp_protocol::{ControlMessage, FrameCodec, VisitorId, MAX_FRAME_SIZE};

use crate::visitor::Visitor;
use crate::TunnelError;

/// Outbound control messages queued before senders are back-pressured
pub const CONTROL_QUEUE_DEPTH: usize = 64;

/// Largest chunk read from a visitor socket into a single DATA frame
pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;

const _: () = assert!(RELAY_BUFFER_SIZE <= MAX_FRAME_SIZE);

/// Public listener bound on behalf of the peer
struct RemoteListener {
    port: u16,
    cancel: CancellationToken,
}

/// One control connection and everything multiplexed over it
///
/// All writes to the control connection go through a single writer task, so
/// a tagged message (VISITOR frame + follow-up) always reaches the wire as
/// one contiguous unit.
pub struct Session {
    peer_addr: SocketAddr,
    outbound: mpsc::Sender<ControlMessage>,
    visitors: Mutex<HashMap<VisitorId, Arc<Visitor>>>,
    next_visitor_id: AtomicU64,
    listener: Mutex<Option<RemoteListener>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Session {
    /// Take ownership of a control connection
    ///
    /// Spawns the control writer task and returns the read half, which the
    /// caller hands to [`crate::dispatch`].
    pub fn start<S>(stream: S, peer_addr: SocketAddr) -> (Arc<Self>, ReadHalf<S>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        let shutdown = CancellationToken::new();

        tokio::spawn(write_control(write_half, rx, shutdown.clone(), peer_addr));

        let session = Arc::new(Self {
            peer_addr,
            outbound,
            visitors: Mutex::new(HashMap::new()),
            next_visitor_id: AtomicU64::new(0),
            listener: Mutex::new(None),
            shutdown,
            closed: AtomicBool::new(false),
        });
        (session, read_half)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Port of the public listener, if one is bound
    pub fn listen_port(&self) -> Option<u16> {
        self.listener.lock().as_ref().map(|l| l.port)
    }

    pub fn visitor_count(&self) -> usize {
        self.visitors.lock().len()
    }

    pub fn contains_visitor(&self, id: VisitorId) -> bool {
        self.visitors.lock().contains_key(&id)
    }

    /// Ids of all live visitors, in ascending order
    pub fn visitor_ids(&self) -> Vec<VisitorId> {
        let mut ids: Vec<_> = self.visitors.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the control connection is shutting down
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Queue a message for the peer
    pub async fn send(&self, msg: ControlMessage) -> Result<(), TunnelError> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(TunnelError::SessionClosed),
            result = self.outbound.send(msg) => {
                result.map_err(|_| TunnelError::ConnectionClosed)
            }
        }
    }

    /// Open the public listener and relay every accepted connection to the peer
    ///
    /// Returns the bound port, which differs from `addr` when it asks for
    /// port 0.
    pub async fn bind_remote_port(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> Result<u16, TunnelError> {
        if let Some(port) = self.listen_port() {
            return Err(TunnelError::AlreadyListening(port));
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TunnelError::Bind { addr, source })?;
        let port = listener.local_addr()?.port();
        let cancel = self.shutdown.child_token();

        {
            let mut slot = self.listener.lock();
            if self.is_closed() {
                return Err(TunnelError::SessionClosed);
            }
            if let Some(existing) = slot.as_ref() {
                return Err(TunnelError::AlreadyListening(existing.port));
            }
            *slot = Some(RemoteListener {
                port,
                cancel: cancel.clone(),
            });
        }

        tracing::info!("Mapping port {} to {}", port, self.peer_addr);

        let session = self.clone();
        tokio::spawn(async move { session.accept_loop(listener, port, cancel).await });

        Ok(port)
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        port: u16,
        cancel: CancellationToken,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Proxy closed: {}", port);
                    return;
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, visitor_addr)) => match self.accept_visitor(stream).await {
                    Ok(id) => {
                        tracing::info!(
                            "Visitor {} connected from {} on port {}",
                            id,
                            visitor_addr,
                            port
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Rejected visitor from {} on port {}: {}",
                            visitor_addr,
                            port,
                            e
                        );
                        if self.is_closed() {
                            return;
                        }
                    }
                },
                Err(e) => {
                    tracing::error!("Error accepting visitor on port {}: {}", port, e);
                }
            }
        }
    }

    /// Register a locally accepted connection under the next visitor id and
    /// announce it to the peer
    pub async fn accept_visitor<S>(
        self: &Arc<Self>,
        stream: S,
    ) -> Result<VisitorId, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = self.next_visitor_id.fetch_add(1, Ordering::Relaxed);
        let (visitor, rx) = Visitor::new(id);
        self.insert_visitor(visitor.clone())?;

        if let Err(e) = self.send(ControlMessage::NewVisitor(id)).await {
            self.close_visitor(id);
            return Err(e);
        }

        self.spawn_relay(visitor, stream, rx);
        Ok(id)
    }

    /// Register a connection under an id assigned by the peer
    pub fn register_visitor<S>(
        self: &Arc<Self>,
        id: VisitorId,
        stream: S,
    ) -> Result<(), TunnelError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (visitor, rx) = Visitor::new(id);
        self.insert_visitor(visitor.clone())?;
        self.spawn_relay(visitor, stream, rx);
        Ok(())
    }

    fn insert_visitor(&self, visitor: Arc<Visitor>) -> Result<(), TunnelError> {
        let mut visitors = self.visitors.lock();
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }
        match visitors.entry(visitor.id()) {
            Entry::Occupied(_) => Err(TunnelError::DuplicateVisitor(visitor.id())),
            Entry::Vacant(slot) => {
                slot.insert(visitor);
                Ok(())
            }
        }
    }

    fn spawn_relay<S>(
        self: &Arc<Self>,
        visitor: Arc<Visitor>,
        stream: S,
        rx: mpsc::Receiver<Bytes>,
    )
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);

        let session = self.clone();
        let writer_visitor = visitor.clone();
        tokio::spawn(async move {
            if let Err(e) = writer_visitor.write_loop(write_half, rx).await {
                tracing::error!("Failed to write to visitor {}: {}", writer_visitor.id(), e);
                session.close_and_notify(writer_visitor.id()).await;
            }
        });

        let session = self.clone();
        tokio::spawn(async move { session.relay(visitor, read_half).await });
    }

    /// Forward everything read from the visitor socket to the peer as DATA
    async fn relay<R>(self: Arc<Self>, visitor: Arc<Visitor>, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let id = visitor.id();
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

        loop {
            let result = tokio::select! {
                _ = visitor.closed() => {
                    tracing::debug!("Visitor {} closed, relay stopped", id);
                    return;
                }
                result = reader.read(&mut buf) => result,
            };

            match result {
                Ok(0) => {
                    tracing::debug!("Visitor {} disconnected", id);
                    break;
                }
                Ok(n) => {
                    let msg = ControlMessage::Data {
                        visitor_id: id,
                        data: Bytes::copy_from_slice(&buf[..n]),
                    };
                    if let Err(e) = self.send(msg).await {
                        tracing::debug!("Dropping visitor {}: {}", id, e);
                        self.close_visitor(id);
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    tracing::warn!("Interrupted reading from visitor {}: {}", id, e);
                }
                Err(e) => {
                    tracing::error!("Error reading from visitor {}: {}", id, e);
                    break;
                }
            }
        }

        self.close_and_notify(id).await;
    }

    /// Close a visitor locally and tell the peer to close its mirror
    async fn close_and_notify(&self, id: VisitorId) {
        if self.close_visitor(id) {
            if let Err(e) = self.send(ControlMessage::CloseVisitor(id)).await {
                tracing::debug!("Could not notify peer of visitor {} close: {}", id, e);
            }
        }
    }

    /// Close and forget a visitor, returning `false` if it was not registered
    pub fn close_visitor(&self, id: VisitorId) -> bool {
        let visitor = self.visitors.lock().remove(&id);
        match visitor {
            Some(visitor) => {
                visitor.close();
                tracing::debug!("Visitor {} closed", id);
                true
            }
            None => false,
        }
    }

    /// Queue bytes received from the peer for a visitor socket
    ///
    /// Never waits on the visitor. Returns `false` when the visitor is
    /// unknown or already closed, and when it has stopped draining its
    /// socket; a stalled visitor is closed and the peer is told.
    pub async fn forward_to_visitor(&self, id: VisitorId, data: Bytes) -> bool {
        let visitor = self.visitors.lock().get(&id).cloned();
        let Some(visitor) = visitor else {
            tracing::warn!("Received data for unknown visitor {} (may have been closed)", id);
            return false;
        };

        match visitor.send(data) {
            Ok(()) => true,
            Err(e @ TunnelError::VisitorStalled(_)) => {
                tracing::warn!("Dropping visitor {}: {}", id, e);
                self.close_and_notify(id).await;
                false
            }
            Err(e) => {
                tracing::warn!("Failed to forward data to visitor {}: {}", id, e);
                false
            }
        }
    }

    /// Tear down the session
    ///
    /// Stops the control connection first, then closes every visitor, then
    /// the public listener. Safe to call more than once.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("Closing session with {}", self.peer_addr);
        }
        self.shutdown.cancel();

        let drained: Vec<Arc<Visitor>> = self.visitors.lock().drain().map(|(_, v)| v).collect();
        for visitor in drained {
            visitor.close();
        }

        if let Some(listener) = self.listener.lock().take() {
            listener.cancel.cancel();
        }
    }
}

/// Single writer for the control connection
async fn write_control<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<ControlMessage>,
    shutdown: CancellationToken,
    peer_addr: SocketAddr,
) where
    W: AsyncWrite + Unpin,
{
    let mut codec = FrameCodec::new();
    let mut write_buf = BytesMut::with_capacity(8192);

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        write_buf.clear();
        if let Err(e) = codec.encode(msg, &mut write_buf) {
            tracing::error!("Failed to encode message for {}: {}", peer_addr, e);
            continue;
        }
        if let Err(e) = writer.write_all(&write_buf).await {
            tracing::error!("Failed to write to {}: {}", peer_addr, e);
            break;
        }
        if let Err(e) = writer.flush().await {
            tracing::error!("Failed to flush to {}: {}", peer_addr, e);
            break;
        }
    }

    // A dead writer takes the whole session down
    shutdown.cancel();
    if let Err(e) = writer.shutdown().await {
        tracing::debug!("Control connection {} shutdown: {}", peer_addr, e);
    }
}

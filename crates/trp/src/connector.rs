use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::ReadHalf;
use tokio::net::TcpStream;
use trp_common::{dispatch, Session, TunnelError};
use trp_protocol::{ControlMessage, PortMapping, HEARTBEAT_INTERVAL};

use crate::tcp_forwarder::TcpForwarder;

/// Manages the connection to the tunnel server
pub struct TunnelConnection {
    local_addr: SocketAddr,
    session: Arc<Session>,
    read_half: ReadHalf<TcpStream>,
    forwarder: TcpForwarder,
    heartbeat_interval: Duration,
}

impl TunnelConnection {
    /// Dial the server's control port
    pub async fn connect(
        server_addr: &str,
        forwarder: TcpForwarder,
    ) -> Result<Self, TunnelError> {
        let stream = TcpStream::connect(server_addr)
            .await
            .map_err(|source| TunnelError::Dial {
                addr: server_addr.to_string(),
                source,
            })?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        tracing::info!("Connected to server: {}", peer_addr);

        let (session, read_half) = Session::start(stream, peer_addr);
        Ok(Self {
            local_addr,
            session,
            read_half,
            forwarder,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        })
    }

    /// Override how often heartbeats are sent
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Our end of the control connection, as the server sees it
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Ask the server to expose `mapping.remote` and forward it here
    pub async fn request_ports(&self, mapping: PortMapping) -> Result<(), TunnelError> {
        self.session.send(ControlMessage::Ports(mapping)).await?;
        tracing::debug!("Sent port request {}", mapping);
        Ok(())
    }

    /// Run the tunnel connection, processing messages until disconnection
    pub async fn run(self) -> Result<(), TunnelError> {
        let heartbeat = tokio::spawn(send_heartbeats(
            self.session.clone(),
            self.heartbeat_interval,
        ));

        // The server never heartbeats, so the client does not enforce a deadline
        let result = dispatch(self.session, self.read_half, &self.forwarder, None).await;

        heartbeat.abort();
        result
    }
}

/// Send a heartbeat immediately, then once per interval until the session ends
async fn send_heartbeats(session: Arc<Session>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = session.closed() => break,
            _ = ticker.tick() => {
                if let Err(e) = session.send(ControlMessage::Heartbeat).await {
                    tracing::debug!("Heartbeat stopped: {}", e);
                    break;
                }
                tracing::debug!("Heartbeat sent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::BytesMut;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio_util::codec::Decoder;
    use trp_protocol::{FrameCodec, Sequencer};

    struct RawServer {
        stream: TcpStream,
        buf: BytesMut,
        sequencer: Sequencer,
    }

    impl RawServer {
        async fn recv(&mut self) -> Option<ControlMessage> {
            let mut codec = FrameCodec::new();
            loop {
                while let Some(frame) = codec.decode(&mut self.buf).unwrap() {
                    if let Some(msg) = self.sequencer.push(frame).unwrap() {
                        return Some(msg);
                    }
                }
                let pending = self.stream.read_buf(&mut self.buf);
                let n = tokio::time::timeout(Duration::from_secs(5), pending)
                    .await
                    .expect("timed out waiting for client")
                    .ok()?;
                if n == 0 {
                    return None;
                }
            }
        }
    }

    async fn connect_pair(interval: Duration) -> (TunnelConnection, RawServer) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let forwarder = TcpForwarder::new("127.0.0.1:1".to_string());
        let (connection, accepted) = tokio::join!(
            TunnelConnection::connect(&addr, forwarder),
            listener.accept()
        );

        let server = RawServer {
            stream: accepted.unwrap().0,
            buf: BytesMut::new(),
            sequencer: Sequencer::new(),
        };
        (connection.unwrap().with_heartbeat_interval(interval), server)
    }

    #[tokio::test]
    async fn test_ports_then_periodic_heartbeats() {
        let (connection, mut server) = connect_pair(Duration::from_millis(50)).await;
        let mapping = PortMapping { remote: 7080, local: 9090 };
        connection.request_ports(mapping).await.unwrap();
        tokio::spawn(connection.run());

        assert_eq!(server.recv().await, Some(ControlMessage::Ports(mapping)));
        for _ in 0..3 {
            assert_eq!(server.recv().await, Some(ControlMessage::Heartbeat));
        }
    }

    #[tokio::test]
    async fn test_run_ends_when_server_hangs_up() {
        let (connection, server) = connect_pair(Duration::from_secs(30)).await;
        let session = connection.session().clone();
        let task = tokio::spawn(connection.run());

        // Unread heartbeats may turn the hang-up into a reset, so only the
        // teardown is asserted
        drop(server);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .ok();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_connect_failure_is_dial_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let forwarder = TcpForwarder::new("127.0.0.1:1".to_string());
        let result = TunnelConnection::connect(&addr, forwarder).await;
        assert!(matches!(result, Err(TunnelError::Dial { .. })));
    }
}

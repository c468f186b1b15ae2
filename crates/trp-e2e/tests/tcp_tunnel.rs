//! TCP tunnel end-to-end tests

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use trp_e2e::harness::wait_until;
use trp_e2e::{MockTcpService, TcpServiceMode, TestClient, TestServer};

/// Initialize tracing for tests
fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("trp=debug,trp_common=debug,trp_server=debug,trp_e2e=debug")
        .with_test_writer()
        .try_init();
}

/// Helper to read with timeout
async fn read_with_timeout(
    stream: &mut TcpStream,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<usize, String> {
    match tokio::time::timeout(timeout, stream.read(buf)).await {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => Err(format!("Read error: {}", e)),
        Err(_) => Err("Read timeout".to_string()),
    }
}

/// Read until EOF, treating a reset as EOF
async fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match read_with_timeout(stream, &mut buf, Duration::from_secs(5)).await {
            Ok(0) => return received,
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(e) if e.starts_with("Read error") => return received,
            Err(e) => panic!("{}", e),
        }
    }
}

/// A port nothing is listening on
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_tcp_tunnel_echo() {
    init_test();

    // 1. Start test server and local echo service
    let server = TestServer::start().await;
    let mock = MockTcpService::start().await;

    // 2. Connect client and wait for the tunnel
    let client = TestClient::connect(&server, &mock.addr_string())
        .await
        .expect("Failed to connect client");
    let tunnel_port = server.wait_for_tunnel_port(client.local_addr).await;
    tracing::info!("Tunnel established on port {}", tunnel_port);

    // 3. Send data through the tunnel
    let mut stream = TcpStream::connect(("127.0.0.1", tunnel_port))
        .await
        .expect("Failed to connect to tunnel port");
    stream
        .write_all(b"Hello through TCP tunnel!")
        .await
        .expect("Failed to write");

    // 4. Read echoed response
    let mut buf = [0u8; 64];
    let mut received = Vec::new();
    while received.len() < 25 {
        let n = read_with_timeout(&mut stream, &mut buf, Duration::from_secs(5))
            .await
            .expect("Failed to read echo response");
        assert!(n > 0, "tunnel closed early");
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, b"Hello through TCP tunnel!");

    // 5. Closing the visitor closes the local connection
    drop(stream);
    assert!(mock.wait_for_finished(1).await);
    let connections = mock.get_connections();
    assert_eq!(connections[0].received_data, b"Hello through TCP tunnel!");
}

#[tokio::test]
async fn test_ping_pong_on_requested_port() {
    init_test();

    let server = TestServer::start().await;
    let mock =
        MockTcpService::start_with_mode(TcpServiceMode::FixedResponse(b"pong".to_vec())).await;

    let remote_port = free_port().await;
    let client = TestClient::connect_with(
        &server,
        &mock.addr_string(),
        remote_port,
        Duration::from_secs(30),
    )
    .await
    .expect("Failed to connect client");
    assert_eq!(server.wait_for_tunnel_port(client.local_addr).await, remote_port);

    let mut stream = TcpStream::connect(("127.0.0.1", remote_port))
        .await
        .expect("Failed to connect to tunnel port");
    stream.write_all(b"ping").await.unwrap();

    // The local service answers and hangs up; both reach the visitor in order
    assert_eq!(read_to_close(&mut stream).await, b"pong");

    let session = server.session(client.local_addr).unwrap();
    assert!(wait_until(|| session.visitor_count() == 0 && client.visitor_count() == 0).await);
}

#[tokio::test]
async fn test_multiple_concurrent_connections() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockTcpService::start().await;
    let client = TestClient::connect(&server, &mock.addr_string()).await.unwrap();
    let tunnel_port = server.wait_for_tunnel_port(client.local_addr).await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        tasks.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", tunnel_port)).await.unwrap();
            let message = format!("connection {} says hello", i).into_bytes();
            stream.write_all(&message).await.unwrap();

            let mut received = vec![0u8; message.len()];
            tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut received))
                .await
                .expect("Read timeout")
                .unwrap();
            assert_eq!(received, message);
            stream
        }));
    }

    let mut streams = Vec::new();
    for task in tasks {
        streams.push(task.await.unwrap());
    }

    // Every live visitor has its own id on both ends
    let session = server.session(client.local_addr).unwrap();
    assert_eq!(session.visitor_ids(), (0..8).collect::<Vec<_>>());
    assert_eq!(client.session().visitor_ids(), (0..8).collect::<Vec<_>>());
    assert_eq!(mock.accepted_count(), 8);

    drop(streams);
    assert!(mock.wait_for_finished(8).await);
    assert!(wait_until(|| session.visitor_count() == 0 && client.visitor_count() == 0).await);
}

#[tokio::test]
async fn test_large_transfer() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockTcpService::start().await;
    let client = TestClient::connect(&server, &mock.addr_string()).await.unwrap();
    let tunnel_port = server.wait_for_tunnel_port(client.local_addr).await;

    // Spans many DATA frames in both directions
    let payload: Vec<u8> = (0..2 * 1024 * 1024).map(|i| (i % 251) as u8).collect();

    let stream = TcpStream::connect(("127.0.0.1", tunnel_port)).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();

    let to_send = payload.clone();
    let write_task = tokio::spawn(async move {
        writer.write_all(&to_send).await.unwrap();
        writer
    });

    let mut received = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(20), reader.read_exact(&mut received))
        .await
        .expect("Read timeout")
        .unwrap();
    let _writer = write_task.await.unwrap();

    assert!(received == payload, "echoed payload differs");
}

#[tokio::test]
async fn test_bidirectional_exchange() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockTcpService::start().await;
    let client = TestClient::connect(&server, &mock.addr_string()).await.unwrap();
    let tunnel_port = server.wait_for_tunnel_port(client.local_addr).await;

    let mut stream = TcpStream::connect(("127.0.0.1", tunnel_port)).await.unwrap();
    for round in 0..20 {
        let message = format!("round {}", round).into_bytes();
        stream.write_all(&message).await.unwrap();

        let mut received = vec![0u8; message.len()];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut received))
            .await
            .expect("Read timeout")
            .unwrap();
        assert_eq!(received, message);
    }
}

#[tokio::test]
async fn test_visitor_disconnect_propagates() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockTcpService::start_with_mode(TcpServiceMode::Accumulate).await;
    let client = TestClient::connect(&server, &mock.addr_string()).await.unwrap();
    let tunnel_port = server.wait_for_tunnel_port(client.local_addr).await;
    let session = server.session(client.local_addr).unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", tunnel_port)).await.unwrap();
    stream.write_all(b"last words").await.unwrap();
    assert!(wait_until(|| client.visitor_count() == 1).await);

    drop(stream);

    // The local connection sees everything, then EOF
    assert!(mock.wait_for_finished(1).await);
    assert_eq!(mock.get_connections()[0].received_data, b"last words");
    assert!(wait_until(|| session.visitor_count() == 0 && client.visitor_count() == 0).await);

    // The session itself is unaffected
    assert!(!session.is_closed());
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_dial_failure_closes_visitor() {
    init_test();

    let server = TestServer::start().await;
    let unreachable = format!("127.0.0.1:{}", free_port().await);
    let client = TestClient::connect(&server, &unreachable).await.unwrap();
    let tunnel_port = server.wait_for_tunnel_port(client.local_addr).await;

    let mut stream = TcpStream::connect(("127.0.0.1", tunnel_port)).await.unwrap();
    assert!(read_to_close(&mut stream).await.is_empty());

    let session = server.session(client.local_addr).unwrap();
    assert!(wait_until(|| session.visitor_count() == 0).await);
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_client_disconnect_tears_down_tunnel() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockTcpService::start().await;
    let client = TestClient::connect(&server, &mock.addr_string()).await.unwrap();
    let tunnel_port = server.wait_for_tunnel_port(client.local_addr).await;

    let mut stream = TcpStream::connect(("127.0.0.1", tunnel_port)).await.unwrap();
    stream.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await.unwrap();

    client.shutdown();
    server.wait_for_session_count(0).await;

    // Visitor connection and public listener go away with the session
    assert!(read_to_close(&mut stream).await.is_empty());
    let refused = wait_until(|| {
        std::net::TcpStream::connect_timeout(
            &([127, 0, 0, 1], tunnel_port).into(),
            Duration::from_millis(100),
        )
        .is_err()
    })
    .await;
    assert!(refused, "tunnel port still accepting");
}

#[tokio::test]
async fn test_server_shutdown_ends_client() {
    init_test();

    let mut server = TestServer::start().await;
    let mock = MockTcpService::start().await;
    let mut client = TestClient::connect(&server, &mock.addr_string()).await.unwrap();
    server.wait_for_tunnel_port(client.local_addr).await;

    server.shutdown();

    assert!(client.join().await.is_some(), "client did not stop");
    assert!(client.is_closed());
    assert_eq!(client.visitor_count(), 0);
}

#[tokio::test]
async fn test_port_in_use_keeps_session() {
    init_test();

    let server = TestServer::start().await;
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let client = TestClient::connect_with(&server, "127.0.0.1:1", port, Duration::from_secs(30))
        .await
        .unwrap();
    server.wait_for_session_count(1).await;

    // Bind failed; the control connection stays up without a listener
    tokio::time::sleep(Duration::from_millis(200)).await;
    let session = server.session(client.local_addr).unwrap();
    assert_eq!(session.listen_port(), None);
    assert!(!session.is_closed());
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_heartbeats_keep_session_alive() {
    init_test();

    let server = TestServer::start_with_heartbeat_timeout(Some(Duration::from_millis(300))).await;
    let mock = MockTcpService::start().await;
    let client = TestClient::connect_with(
        &server,
        &mock.addr_string(),
        0,
        Duration::from_millis(100),
    )
    .await
    .unwrap();
    let tunnel_port = server.wait_for_tunnel_port(client.local_addr).await;

    // Well past the timeout, with no visitor traffic
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(server.session_count(), 1);
    assert!(!client.is_closed());

    let mut stream = TcpStream::connect(("127.0.0.1", tunnel_port)).await.unwrap();
    stream.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("Read timeout")
        .unwrap();
    assert_eq!(&buf, b"still here");
}

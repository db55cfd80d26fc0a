use std::{net::SocketAddr, str::FromStr, time::Duration};

use termrpc::driver::{ClientEvent, DataMode, ServerEvent, SocketClient, SocketServer};
use tokio::{io::AsyncWriteExt, time::timeout};

const WAIT: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn any_addr() -> SocketAddr {
    SocketAddr::from_str("127.0.0.1:0").unwrap()
}

async fn recv_client(events: &mut tokio::sync::mpsc::Receiver<ClientEvent>) -> ClientEvent {
    timeout(WAIT, events.recv()).await.unwrap().unwrap()
}

async fn recv_server(events: &mut tokio::sync::mpsc::Receiver<ServerEvent>) -> ServerEvent {
    timeout(WAIT, events.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_header_mode_delivery_in_order() {
    init_logging();

    let (server, mut server_events) = SocketServer::start(DataMode::PayloadHeader, any_addr(), 1)
        .await
        .unwrap();
    let (client, mut client_events) =
        SocketClient::connect(DataMode::PayloadHeader, server.local_addr())
            .await
            .unwrap();

    let event = recv_server(&mut server_events).await;
    assert!(matches!(event, ServerEvent::ClientConnected(_)));

    let payloads: Vec<Vec<u8>> = (0u8..10).map(|i| vec![i, i + 1, i + 2]).collect();
    for payload in &payloads {
        server.write(payload.clone()).unwrap();
    }
    for payload in &payloads {
        match recv_client(&mut client_events).await {
            ClientEvent::ServerDataRecv(data) => assert_eq!(data.as_slice(), &payload[..]),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    for payload in &payloads {
        client.write(payload.clone()).unwrap();
    }
    for payload in &payloads {
        match recv_server(&mut server_events).await {
            ServerEvent::ClientDataRecv(_, data) => assert_eq!(data.as_slice(), &payload[..]),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    assert!(client.is_connected());
    assert_eq!(server.client_count(), 1);
}

#[tokio::test]
async fn test_delimiter_mode_splits_lines() {
    init_logging();

    let (server, mut server_events) =
        SocketServer::start(DataMode::NewLineDelimiter, any_addr(), 1)
            .await
            .unwrap();
    let (client, _client_events) =
        SocketClient::connect(DataMode::NewLineDelimiter, server.local_addr())
            .await
            .unwrap();

    let event = recv_server(&mut server_events).await;
    assert!(matches!(event, ServerEvent::ClientConnected(_)));

    client.write(&b"hello\nworld\n"[..]).unwrap();

    match recv_server(&mut server_events).await {
        ServerEvent::ClientDataRecv(_, data) => assert_eq!(data.as_slice(), b"hello\n"),
        other => panic!("unexpected event: {other:?}"),
    }
    match recv_server(&mut server_events).await {
        ServerEvent::ClientDataRecv(_, data) => assert_eq!(data.as_slice(), b"world\n"),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_client_disconnect_event() {
    init_logging();

    let (server, mut server_events) = SocketServer::start(DataMode::PayloadHeader, any_addr(), 1)
        .await
        .unwrap();
    let (client, _client_events) =
        SocketClient::connect(DataMode::PayloadHeader, server.local_addr())
            .await
            .unwrap();

    let event = recv_server(&mut server_events).await;
    assert!(matches!(event, ServerEvent::ClientConnected(_)));

    client.disconnect();
    assert!(!client.is_connected());

    let event = recv_server(&mut server_events).await;
    assert!(matches!(event, ServerEvent::ClientDisconnected(_)));
    assert_eq!(server.client_count(), 0);
}

#[tokio::test]
async fn test_server_stop_disconnects_client() {
    init_logging();

    let (server, mut server_events) = SocketServer::start(DataMode::PayloadHeader, any_addr(), 1)
        .await
        .unwrap();
    let (client, mut client_events) =
        SocketClient::connect(DataMode::PayloadHeader, server.local_addr())
            .await
            .unwrap();

    let event = recv_server(&mut server_events).await;
    assert!(matches!(event, ServerEvent::ClientConnected(_)));

    server.stop();

    let event = recv_client(&mut client_events).await;
    assert!(matches!(event, ClientEvent::ServerDisconnected));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_client_limit_refuses_extra_connections() {
    init_logging();

    let (server, mut server_events) = SocketServer::start(DataMode::PayloadHeader, any_addr(), 1)
        .await
        .unwrap();
    let (first, _first_events) = SocketClient::connect(DataMode::PayloadHeader, server.local_addr())
        .await
        .unwrap();

    let event = recv_server(&mut server_events).await;
    assert!(matches!(event, ServerEvent::ClientConnected(_)));

    let (_second, mut second_events) =
        SocketClient::connect(DataMode::PayloadHeader, server.local_addr())
            .await
            .unwrap();

    let event = recv_client(&mut second_events).await;
    assert!(matches!(event, ClientEvent::ServerDisconnected));

    assert_eq!(server.client_count(), 1);
    assert!(first.is_connected());
}

#[tokio::test]
async fn test_oversized_length_prefix_closes_connection() {
    init_logging();

    let (server, mut server_events) = SocketServer::start(DataMode::PayloadHeader, any_addr(), 1)
        .await
        .unwrap();

    let mut stream = tokio::net::TcpStream::connect(server.local_addr())
        .await
        .unwrap();

    let event = recv_server(&mut server_events).await;
    assert!(matches!(event, ServerEvent::ClientConnected(_)));

    stream.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

    let event = recv_server(&mut server_events).await;
    assert!(matches!(event, ServerEvent::ClientDisconnected(_)));
    assert_eq!(server.client_count(), 0);
}

//! Two managers talking over loopback addresses

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::mpsc::UnboundedReceiver;

use super::{DisconnectReason, SessionEvent, SessionManager};
use crate::discovery::DeviceRegistry;
use crate::transfer::{checksum, ContentKind, TransferError};
use crate::{Error, SessionConfig};

const WAIT: Duration = Duration::from_secs(5);

struct Node {
    ip: IpAddr,
    manager: SessionManager,
    events: UnboundedReceiver<SessionEvent>,
}

impl Node {
    async fn bind(last_octet: u8, port: u16, config: SessionConfig) -> Node {
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, last_octet));
        let registry = Arc::new(DeviceRegistry::default());
        let (manager, events) = SessionManager::bind(ip, port, config, registry).await.unwrap();
        Node { ip, manager, events }
    }

    async fn next_event(&mut self) -> SessionEvent {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_secs(3),
        write_timeout: Duration::from_secs(1),
        control_timeout: Duration::from_secs(1),
        chunk_enqueue_timeout: Duration::from_secs(2),
        marker_enqueue_timeout: Duration::from_secs(1),
        queue_capacity: 100,
    }
}

/// Two managers on 127.0.0.1 and 127.0.0.2 sharing one port number
async fn pair() -> (Node, Node) {
    let a = Node::bind(1, 0, fast_config()).await;
    let b = Node::bind(2, a.manager.port(), fast_config()).await;
    (a, b)
}

/// Pair with a live session dialed by `a`
async fn connected_pair() -> (Node, Node) {
    let (mut a, mut b) = pair().await;
    a.manager.connect(b.ip, "beta").await.unwrap();

    assert!(matches!(a.next_event().await, SessionEvent::Connected { is_initiator: true, .. }));
    match b.next_event().await {
        SessionEvent::Connected { ip, is_initiator } => {
            assert_eq!(ip, a.ip);
            assert!(!is_initiator);
        }
        other => panic!("unexpected event {:?}", other),
    }
    (a, b)
}

#[tokio::test]
async fn test_request_response_then_connect() {
    let (mut a, mut b) = pair().await;

    a.manager.send_request("alpha", b.ip).await.unwrap();
    match b.next_event().await {
        SessionEvent::RequestReceived { from, request } => {
            assert_eq!(from, a.ip);
            assert_eq!(request.from_name, "alpha");
            assert_eq!(request.to_ip, b.ip.to_string());
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(b.manager.session_count().await, 0);

    b.manager.send_response(a.ip, true).await.unwrap();
    let accepted_by = match a.next_event().await {
        SessionEvent::ResponseReceived { from, response } => {
            assert!(response.accept);
            from
        }
        other => panic!("unexpected event {:?}", other),
    };
    assert_eq!(accepted_by, b.ip);

    a.manager.connect(accepted_by, "beta").await.unwrap();
    assert!(matches!(a.next_event().await, SessionEvent::Connected { is_initiator: true, .. }));
    assert!(matches!(b.next_event().await, SessionEvent::Connected { is_initiator: false, .. }));

    assert!(a.manager.is_connected(b.ip).await);
    assert!(b.manager.is_connected(a.ip).await);
    assert_eq!(a.manager.display_name(b.ip).await.as_deref(), Some("beta"));
    assert!(a.manager.connected_ips().await.contains(&b.ip));
}

#[tokio::test]
async fn test_concurrent_connect_yields_one_session() {
    let (a, b) = pair().await;

    let (first, second) = tokio::join!(
        a.manager.connect(b.ip, "beta"),
        a.manager.connect(b.ip, "beta"),
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(r, Err(Error::AlreadyConnected(ip)) if *ip == b.ip)));
    assert_eq!(a.manager.session_count().await, 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(b.manager.session_count().await, 1);

    // The acceptor side already holds a session for this peer
    let again = b.manager.connect(a.ip, "alpha").await;
    assert!(matches!(again, Err(Error::AlreadyConnected(_))));
}

#[tokio::test]
async fn test_connect_to_unreachable_peer_leaves_no_state() {
    let a = Node::bind(1, 0, fast_config()).await;
    let nobody = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 9));

    let result = a.manager.connect(nobody, "ghost").await;
    assert!(result.is_err());
    assert!(!a.manager.is_connected(nobody).await);

    // The reservation was released, so the error is not AlreadyConnected
    let retry = a.manager.connect(nobody, "ghost").await;
    assert!(!matches!(retry, Err(Error::AlreadyConnected(_))));
}

#[tokio::test]
async fn test_heartbeat_timeout_tears_down() {
    let config = SessionConfig {
        heartbeat_timeout: Duration::from_millis(300),
        ..fast_config()
    };
    let mut a = Node::bind(1, 0, config).await;
    let peer_ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2));
    let listener = TcpListener::bind(SocketAddr::new(peer_ip, a.manager.port())).await.unwrap();

    // A peer that keeps talking but never acknowledges a heartbeat
    let fake = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut read_half, mut write_half) = stream.into_split();
        tokio::spawn(async move {
            let mut sink = [0u8; 4096];
            while matches!(read_half.read(&mut sink).await, Ok(n) if n > 0) {}
        });
        let line = b"{\"type\":\"heartbeat\",\"data\":{\"from_ip\":\"127.0.0.2\",\"timestamp\":0}}\n";
        while write_half.write_all(line).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    a.manager.connect(peer_ip, "silent").await.unwrap();
    assert!(matches!(a.next_event().await, SessionEvent::Connected { .. }));

    match a.next_event().await {
        SessionEvent::Disconnected { ip, reason } => {
            assert_eq!(ip, peer_ip);
            assert_eq!(reason, DisconnectReason::TimedOut);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(!a.manager.is_connected(peer_ip).await);

    // Exactly one disconnect event
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(a.events.try_recv().is_err());
    fake.abort();
}

#[tokio::test]
async fn test_file_broadcast_end_to_end() {
    let (a, mut b) = connected_pair().await;

    let data: Vec<u8> = (0..2 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let sum = checksum(&data);

    let report = a.manager.broadcast_file("photo.png", data.clone(), &sum).await;
    assert_eq!(report.total_chunks, 4);
    assert_eq!(report.delivered, vec![b.ip]);
    assert!(report.failed.is_empty());

    match b.next_event().await {
        SessionEvent::ChunkStart { from, start } => {
            assert_eq!(from, a.ip);
            assert_eq!(start.total_chunks, 4);
            assert_eq!(start.total_size, data.len() as u64);
            assert_eq!(start.file_id, report.file_id);
        }
        other => panic!("unexpected event {:?}", other),
    }

    for expected_index in 0..4 {
        match b.next_event().await {
            SessionEvent::ChunkData { progress, .. } => {
                assert_eq!(progress.chunk_index, expected_index);
                assert_eq!(progress.received, expected_index + 1);
                assert_eq!(progress.total, 4);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    match b.next_event().await {
        SessionEvent::ChunkComplete { from, outcome } => {
            assert_eq!(from, a.ip);
            let file = outcome.unwrap();
            assert_eq!(file.file_name, "photo.png");
            assert_eq!(file.kind, ContentKind::Image);
            assert_eq!(file.checksum, sum);
            assert_eq!(file.data, data);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_clipboard_broadcast() {
    let (a, mut b) = connected_pair().await;

    let sent_to = a.manager.broadcast_clipboard("hello from alpha").await;
    assert_eq!(sent_to, vec![b.ip]);

    match b.next_event().await {
        SessionEvent::ClipboardReceived { from, data } => {
            assert_eq!(from, a.ip);
            assert_eq!(data.content, "hello from alpha");
            assert_eq!(data.from_ip, a.ip.to_string());
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_disconnect_notifies_peer() {
    let (mut a, mut b) = connected_pair().await;

    a.manager.disconnect(b.ip).await.unwrap();
    assert!(!a.manager.is_connected(b.ip).await);
    assert!(matches!(
        a.next_event().await,
        SessionEvent::Disconnected { reason: DisconnectReason::UserDisconnected, .. }
    ));

    match b.next_event().await {
        SessionEvent::Disconnected { ip, reason } => {
            assert_eq!(ip, a.ip);
            assert_eq!(reason.to_string(), "User disconnected");
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(!b.manager.is_connected(a.ip).await);

    let again = a.manager.disconnect(b.ip).await;
    assert!(matches!(again, Err(Error::NotConnected(_))));
}

#[tokio::test]
async fn test_shutdown_as_hub() {
    let (a, mut b) = connected_pair().await;

    a.manager.shutdown_as_hub().await;
    assert_eq!(a.manager.session_count().await, 0);

    match b.next_event().await {
        SessionEvent::Disconnected { ip, reason } => {
            assert_eq!(ip, a.ip);
            assert_eq!(reason, DisconnectReason::HubShutdown);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_message_does_not_end_session() {
    let mut a = Node::bind(1, 0, SessionConfig::default()).await;

    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.2:0".parse().unwrap()).unwrap();
    let mut stream = socket
        .connect(SocketAddr::new(a.ip, a.manager.port()))
        .await
        .unwrap();

    stream.write_all(b"{\"type\":\"telepathy\",\"data\":{\"x\":1}}\n").await.unwrap();
    stream
        .write_all(b"{\"type\":\"clipboard\",\"data\":{\"from_ip\":\"127.0.0.2\",\"content\":\"still here\",\"timestamp\":1}}\n")
        .await
        .unwrap();

    assert!(matches!(a.next_event().await, SessionEvent::Connected { is_initiator: false, .. }));
    match a.next_event().await {
        SessionEvent::ClipboardReceived { data, .. } => assert_eq!(data.content, "still here"),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(a.manager.is_connected("127.0.0.2".parse().unwrap()).await);
}

/// Raw session from 127.0.0.2 into `a`, classified by its first line
async fn raw_peer(a: &Node, first_line: &[u8]) -> tokio::net::TcpStream {
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.2:0".parse().unwrap()).unwrap();
    let mut stream = socket
        .connect(SocketAddr::new(a.ip, a.manager.port()))
        .await
        .unwrap();
    stream.write_all(first_line).await.unwrap();
    stream
}

#[tokio::test]
async fn test_disconnect_mid_transfer_abandons_it() {
    let mut a = Node::bind(1, 0, SessionConfig::default()).await;
    let peer: IpAddr = "127.0.0.2".parse().unwrap();

    let mut stream = raw_peer(
        &a,
        b"{\"type\":\"file_chunk_start\",\"data\":{\"file_id\":\"half\",\"file_name\":\"half.bin\",\"total_size\":10,\"total_chunks\":2,\"checksum\":\"00\",\"from_ip\":\"127.0.0.2\"}}\n",
    )
    .await;
    stream
        .write_all(b"{\"type\":\"file_chunk_data\",\"data\":{\"file_id\":\"half\",\"chunk_index\":0,\"data\":\"aGVsbG8=\"}}\n")
        .await
        .unwrap();

    assert!(matches!(a.next_event().await, SessionEvent::Connected { is_initiator: false, .. }));
    assert!(matches!(a.next_event().await, SessionEvent::ChunkStart { .. }));
    match a.next_event().await {
        SessionEvent::ChunkData { progress, .. } => assert_eq!(progress.received, 1),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(a.manager.incoming_transfers().await, 1);

    stream
        .write_all(b"{\"type\":\"disconnect\",\"data\":{\"from_ip\":\"127.0.0.2\",\"reason\":\"User disconnected\"}}\n")
        .await
        .unwrap();

    match a.next_event().await {
        SessionEvent::ChunkComplete { from, outcome } => {
            assert_eq!(from, peer);
            assert!(matches!(
                outcome,
                Err(TransferError::Incomplete { received: 1, expected: 2, .. })
            ));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(matches!(
        a.next_event().await,
        SessionEvent::Disconnected { reason: DisconnectReason::UserDisconnected, .. }
    ));
    assert_eq!(a.manager.incoming_transfers().await, 0);
}

#[tokio::test]
async fn test_oversized_transfer_does_not_end_session() {
    let mut a = Node::bind(1, 0, SessionConfig::default()).await;

    let mut stream = raw_peer(
        &a,
        b"{\"type\":\"file_chunk_start\",\"data\":{\"file_id\":\"huge\",\"file_name\":\"huge.bin\",\"total_size\":18446744073709551615,\"total_chunks\":0,\"checksum\":\"00\",\"from_ip\":\"127.0.0.2\"}}\n",
    )
    .await;
    stream
        .write_all(b"{\"type\":\"file_chunk_complete\",\"data\":{\"file_id\":\"huge\",\"checksum\":\"00\"}}\n")
        .await
        .unwrap();
    stream
        .write_all(b"{\"type\":\"clipboard\",\"data\":{\"from_ip\":\"127.0.0.2\",\"content\":\"after\",\"timestamp\":1}}\n")
        .await
        .unwrap();

    assert!(matches!(a.next_event().await, SessionEvent::Connected { .. }));
    match a.next_event().await {
        SessionEvent::ClipboardReceived { data, .. } => assert_eq!(data.content, "after"),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(a.manager.incoming_transfers().await, 0);
}

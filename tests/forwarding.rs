//! End-to-end scenarios over loopback: an in-process ingress (trunk client
//! plus accept loop) and egress (trunk server plus dial factory), optionally
//! separated by a mangling UDP relay for loss and reordering tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time;

use byte_stacker::connect_id::PointId;
use byte_stacker::out_link::OutLink;
use byte_stacker::packet::{TrunkCommand, TrunkPacket};
use byte_stacker::trunk::{TrunkClient, TrunkServer};

const POINT: PointId = 1;

async fn start_egress(target_port: u16) -> Arc<TrunkServer> {
    TrunkServer::new(
        &["127.0.0.1:0".parse().unwrap()],
        Box::new(move |point| {
            (point == POINT).then(|| OutLink::from_address("127.0.0.1", target_port))
        }),
    )
    .await
    .unwrap()
}

/// Trunk client plus an accept loop on an ephemeral local point. Returns the
/// client and the TCP address to connect to.
async fn start_ingress(trunk_addr: SocketAddr) -> (Arc<TrunkClient>, SocketAddr) {
    let client = TrunkClient::new(&[trunk_addr]).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ingress_addr = listener.local_addr().unwrap();

    let accept_client = client.clone();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            accept_client
                .add_connect(POINT, OutLink::from_socket(socket))
                .await;
        }
    });

    (client, ingress_addr)
}

struct Bridge {
    _client: Arc<TrunkClient>,
    _server: Arc<TrunkServer>,
    ingress_addr: SocketAddr,
    target_listener: TcpListener,
}

async fn start_bridge() -> Bridge {
    let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = start_egress(target_listener.local_addr().unwrap().port()).await;
    let trunk_addr = server.local_addrs()[0];
    let (client, ingress_addr) = start_ingress(trunk_addr).await;
    Bridge {
        _client: client,
        _server: server,
        ingress_addr,
        target_listener,
    }
}

/// UDP relay between ingress and egress. Client-to-server datagrams pass
/// through `mangle`, which returns the datagrams to forward in their place
/// (empty = drop). Server-to-client datagrams pass through untouched.
async fn start_relay(
    server_addr: SocketAddr,
    mangle: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = socket.local_addr().unwrap();
    tokio::spawn(run_relay(socket, server_addr, mangle));
    relay_addr
}

async fn run_relay(
    socket: UdpSocket,
    server_addr: SocketAddr,
    mut mangle: impl FnMut(&[u8]) -> Vec<Vec<u8>>,
) {
    let mut client_addr: Option<SocketAddr> = None;
    let mut buf = [0u8; 1000];
    loop {
        let Ok((len, from)) = socket.recv_from(&mut buf).await else {
            break;
        };
        if from == server_addr {
            if let Some(client) = client_addr {
                let _ = socket.send_to(&buf[..len], client).await;
            }
        } else {
            client_addr = Some(from);
            for datagram in mangle(&buf[..len]) {
                let _ = socket.send_to(&datagram, server_addr).await;
            }
        }
    }
}

fn command_of(datagram: &[u8]) -> Option<TrunkCommand> {
    TrunkPacket::try_deser(datagram)
        .ok()
        .map(|(_, packet)| packet.command())
}

async fn expect_eof(socket: &mut TcpStream, within: Duration) {
    let mut probe = [0u8; 16];
    let n = time::timeout(within, socket.read(&mut probe))
        .await
        .expect("timed out waiting for EOF")
        .expect("expected a clean EOF");
    assert_eq!(n, 0, "unexpected {} extra bytes before EOF", n);
}

#[tokio::test]
async fn test_connection_forwarding() {
    let bridge = start_bridge().await;

    let _client_sock = TcpStream::connect(bridge.ingress_addr).await.unwrap();

    time::timeout(Duration::from_secs(2), bridge.target_listener.accept())
        .await
        .expect("no forwarded connection within 2 seconds")
        .unwrap();
}

#[tokio::test]
async fn test_close_propagation() {
    let bridge = start_bridge().await;

    let client_sock = TcpStream::connect(bridge.ingress_addr).await.unwrap();
    let (mut accepted, _) = time::timeout(Duration::from_secs(2), bridge.target_listener.accept())
        .await
        .expect("no forwarded connection within 2 seconds")
        .unwrap();

    drop(client_sock);

    expect_eof(&mut accepted, Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_single_byte_transfer() {
    let bridge = start_bridge().await;

    let mut client_sock = TcpStream::connect(bridge.ingress_addr).await.unwrap();
    let (mut accepted, _) = time::timeout(Duration::from_secs(2), bridge.target_listener.accept())
        .await
        .expect("no forwarded connection within 2 seconds")
        .unwrap();

    client_sock.write_all(&[0xAA]).await.unwrap();
    drop(client_sock);

    let mut byte = [0u8; 1];
    time::timeout(Duration::from_secs(2), accepted.read_exact(&mut byte))
        .await
        .expect("byte did not arrive within 2 seconds")
        .unwrap();
    assert_eq!(byte[0], 0xAA);

    expect_eof(&mut accepted, Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_data_flows_in_both_directions() {
    let bridge = start_bridge().await;

    let mut client_sock = TcpStream::connect(bridge.ingress_addr).await.unwrap();
    let (mut accepted, _) = time::timeout(Duration::from_secs(2), bridge.target_listener.accept())
        .await
        .expect("no forwarded connection within 2 seconds")
        .unwrap();

    client_sock.write_all(b"ping").await.unwrap();
    let mut request = [0u8; 4];
    time::timeout(Duration::from_secs(2), accepted.read_exact(&mut request))
        .await
        .expect("request did not arrive within 2 seconds")
        .unwrap();
    assert_eq!(&request, b"ping");

    accepted.write_all(b"pong!").await.unwrap();
    let mut response = [0u8; 5];
    time::timeout(Duration::from_secs(2), client_sock.read_exact(&mut response))
        .await
        .expect("response did not arrive within 2 seconds")
        .unwrap();
    assert_eq!(&response, b"pong!");
}

#[tokio::test]
async fn test_lost_create_is_retried() {
    let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = start_egress(target_listener.local_addr().unwrap().port()).await;

    let mut dropped = false;
    let relay_addr = start_relay(server.local_addrs()[0], move |datagram| {
        if !dropped && command_of(datagram) == Some(TrunkCommand::CreateConnect) {
            dropped = true;
            return Vec::new();
        }
        vec![datagram.to_vec()]
    })
    .await;
    let (_client, ingress_addr) = start_ingress(relay_addr).await;

    let _client_sock = TcpStream::connect(ingress_addr).await.unwrap();

    // the first create is swallowed; the retransmit 300 ms later gets through
    time::timeout(Duration::from_secs(2), target_listener.accept())
        .await
        .expect("no forwarded connection within 2 seconds")
        .unwrap();
}

#[tokio::test]
async fn test_reordered_chunks_are_delivered_in_order() {
    let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = start_egress(target_listener.local_addr().unwrap().port()).await;

    // hold the first data packet back until the one behind it has passed
    let mut stash: Option<Vec<u8>> = None;
    let mut first_data_seen = false;
    let relay_addr = start_relay(server.local_addrs()[0], move |datagram| {
        if command_of(datagram) == Some(TrunkCommand::DataOut) {
            if !first_data_seen {
                first_data_seen = true;
                stash = Some(datagram.to_vec());
                return Vec::new();
            }
            if let Some(held) = stash.take() {
                return vec![datagram.to_vec(), held];
            }
        }
        vec![datagram.to_vec()]
    })
    .await;
    let (_client, ingress_addr) = start_ingress(relay_addr).await;

    let mut client_sock = TcpStream::connect(ingress_addr).await.unwrap();
    let (mut accepted, _) = time::timeout(Duration::from_secs(2), target_listener.accept())
        .await
        .expect("no forwarded connection within 2 seconds")
        .unwrap();

    client_sock.write_all(b"A").await.unwrap();
    time::sleep(Duration::from_millis(150)).await;
    client_sock.write_all(b"B").await.unwrap();

    let mut received = [0u8; 2];
    time::timeout(Duration::from_secs(3), accepted.read_exact(&mut received))
        .await
        .expect("bytes did not arrive within 3 seconds")
        .unwrap();
    assert_eq!(&received, b"AB");
}

#[tokio::test]
async fn test_dead_peer_fails_the_connection_on_deadline() {
    // a trunk endpoint nobody listens on
    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = probe.local_addr().unwrap();
    drop(probe);

    let (_client, ingress_addr) = start_ingress(dead_addr).await;

    let mut client_sock = TcpStream::connect(ingress_addr).await.unwrap();
    client_sock.write_all(b"ping").await.unwrap();

    // the unanswered create runs into its 2 s deadline and the local socket
    // is closed
    let mut probe_buf = [0u8; 16];
    let result = time::timeout(Duration::from_secs(4), client_sock.read(&mut probe_buf))
        .await
        .expect("connection was not torn down within 4 seconds");
    match result {
        Ok(n) => assert_eq!(n, 0, "expected EOF, got {} bytes", n),
        Err(_) => {} // a reset is just as acceptable
    }
}

//! Fallback client talking to a fallback server over loopback TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use trellis_core::{ChunkCodec, Decoded};
use trellis_services::fallback::STATUS_REPLY;
use trellis_services::{
    aggregate, FallbackClient, FallbackServer, MessageSplitter, ReassemblyBuffer, ServerOptions,
};

use crate::*;

const MAX_FRAME: usize = 1024 * 1024;

struct Pair {
    client: FallbackClient<Arc<UdpSocket>>,
    client_rx: mpsc::Receiver<(SocketAddr, Bytes)>,
    server: FallbackServer<Arc<UdpSocket>>,
    server_rx: mpsc::Receiver<(SocketAddr, Bytes)>,
    server_addr: SocketAddr,
    /// The super peer's primary endpoint. Never answers.
    super_udp: Arc<UdpSocket>,
    _shutdown: broadcast::Sender<()>,
}

async fn pair(timeout: Duration) -> Pair {
    let (server_tx, server_rx) = mpsc::channel(256);
    let server = FallbackServer::new(
        loopback_udp().await.unwrap(),
        ServerOptions { idle_timeout: Duration::from_secs(60), status_enabled: true, max_frame: MAX_FRAME },
        server_tx,
    );
    let listener = FallbackServer::<Arc<UdpSocket>>::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let server_addr = listener.local_addr().unwrap();
    let (shutdown, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(server.clone().serve(listener, shutdown_rx));

    let super_udp = loopback_udp().await.unwrap();
    let (client_tx, client_rx) = mpsc::channel(256);
    let client = FallbackClient::new(
        loopback_udp().await.unwrap(),
        [super_udp.local_addr().unwrap()],
        server_addr,
        timeout,
        MAX_FRAME,
        client_tx,
    );

    Pair { client, client_rx, server, server_rx, server_addr, super_udp, _shutdown: shutdown }
}

impl Pair {
    fn super_addr(&self) -> SocketAddr {
        self.super_udp.local_addr().unwrap()
    }
}

fn overlay(body: &[u8]) -> Bytes {
    let mut v = trellis_core::wire::OVERLAY_MAGIC.to_be_bytes().to_vec();
    v.extend_from_slice(body);
    v.into()
}

#[tokio::test]
async fn silence_reroutes_through_server_and_recovery_switches_back() {
    let mut p = pair(Duration::from_millis(200)).await;
    let super_addr = p.super_addr();

    // inside the timeout: primary only
    p.client.send(super_addr, overlay(b"1")).await.unwrap();
    recv_datagrams(&p.super_udp, 1).await.unwrap();
    assert_eq!(p.client.connect_attempts(), 0);

    tokio::time::sleep(Duration::from_millis(250)).await;
    p.client.send(super_addr, overlay(b"2")).await.unwrap();
    recv_datagrams(&p.super_udp, 1).await.unwrap();
    wait_for("fallback connection", || p.client.is_connected()).await.unwrap();
    wait_for("server registration", || p.server.client_count() == 1).await.unwrap();

    // client → server over TCP
    p.client.send(super_addr, overlay(b"3")).await.unwrap();
    let (client_addr, frame) = p.server_rx.recv().await.unwrap();
    assert_eq!(frame, overlay(b"3"));
    assert!(p.server.has_client(&client_addr));

    // server → client over the same connection
    p.server.send(client_addr, overlay(b"4")).await.unwrap();
    let (from, frame) = p.client_rx.recv().await.unwrap();
    assert_eq!(from, p.server_addr);
    assert_eq!(frame, overlay(b"4"));

    // primary traffic from the super peer tears the fallback down
    p.client.on_inbound(super_addr);
    assert!(!p.client.is_connected());
    wait_for("server eviction", || p.server.client_count() == 0).await.unwrap();

    p.client.send(super_addr, overlay(b"5")).await.unwrap();
    let (_, d) = recv_datagrams(&p.super_udp, 1).await.unwrap().remove(0);
    assert_eq!(d, overlay(b"5"));
    assert_eq!(p.client.connections_opened(), 1);
}

#[tokio::test]
async fn concurrent_sends_open_a_single_connection() {
    let p = pair(Duration::from_millis(100)).await;
    let super_addr = p.super_addr();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let sends: Vec<_> = (0..32)
        .map(|i| {
            let client = p.client.clone();
            tokio::spawn(async move { client.send(super_addr, overlay(&[i as u8])).await })
        })
        .collect();
    for s in sends {
        s.await.unwrap().unwrap();
    }

    wait_for("fallback connection", || p.client.is_connected()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(p.client.connect_attempts(), 1);
    assert_eq!(p.client.connections_opened(), 1);
    assert_eq!(p.server.client_count(), 1);
}

#[tokio::test]
async fn chunked_message_crosses_the_fallback() {
    let mut p = pair(Duration::from_millis(50)).await;
    let super_addr = p.super_addr();
    tokio::time::sleep(Duration::from_millis(80)).await;
    p.client.send(super_addr, overlay(b"wake")).await.unwrap();
    wait_for("fallback connection", || p.client.is_connected()).await.unwrap();

    let splitter = MessageSplitter::new(ChunkCodec::new(2).unwrap(), 1400, MAX_FRAME).unwrap();
    let content = payload(20_000);
    let datagrams = splitter.split_encoded(content.clone()).unwrap();
    let n = datagrams.len();
    for d in datagrams {
        p.client.send(super_addr, d).await.unwrap();
    }

    let mut buffer = ReassemblyBuffer::new(MAX_FRAME, Duration::from_secs(60));
    let mut done = None;
    for _ in 0..n {
        let (_, frame) = tokio::time::timeout(STEP_TIMEOUT, p.server_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let Decoded::Chunk(chunk) = splitter.codec().decode(frame) else {
            panic!("expected a chunk");
        };
        let out = buffer.on_chunk(chunk).unwrap();
        if !out.is_empty() {
            done = Some(aggregate(out));
        }
    }
    assert_eq!(done, Some(content));
}

#[tokio::test]
async fn http_probe_gets_status_reply() {
    let p = pair(Duration::from_secs(60)).await;
    let mut probe = TcpStream::connect(p.server_addr).await.unwrap();
    probe
        .write_all(b"GET /health HTTP/1.1\r\nHost: trellis\r\n\r\n")
        .await
        .unwrap();

    let mut reply = Vec::new();
    tokio::time::timeout(STEP_TIMEOUT, probe.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, STATUS_REPLY);
    wait_for("probe eviction", || p.server.client_count() == 0).await.unwrap();
}

#[tokio::test]
async fn server_passes_unknown_destinations_to_primary() {
    let p = pair(Duration::from_secs(60)).await;
    let outsider = loopback_udp().await.unwrap();
    p.server
        .send(outsider.local_addr().unwrap(), overlay(b"direct"))
        .await
        .unwrap();
    let (_, d) = recv_datagrams(&outsider, 1).await.unwrap().remove(0);
    assert_eq!(d, overlay(b"direct"));
}

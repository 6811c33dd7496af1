//! Inbound data plane.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use trellis_core::config::TrellisConfig;
use trellis_core::{ChunkCodec, Decoded, PeerId};
use trellis_services::{
    aggregate, FallbackClient, Path, PathKind, PeerRegistry, ReassemblyBuffer,
};

use super::Datagram;
use crate::liveness::{decode_keepalive, encode_keepalive, KeepaliveKind, PathTracker};

/// Largest datagram read off the socket.
const MAX_DATAGRAM: usize = 65_535;
const EXPIRY_INTERVAL: Duration = Duration::from_secs(1);

pub struct ChunkReceiver {
    socket: Arc<UdpSocket>,
    tcp_rx: mpsc::Receiver<Datagram>,
    codec: ChunkCodec,
    max_content_length: usize,
    transfer_timeout: Duration,
    /// One reassembly buffer per channel.
    buffers: HashMap<Path, ReassemblyBuffer>,
    fallback: Option<FallbackClient<Arc<UdpSocket>>>,
    local: PeerId,
    is_super_peer: bool,
    super_peer: Option<PeerId>,
    super_endpoints: HashSet<SocketAddr>,
    tracker: PathTracker,
    outbound: mpsc::Sender<Datagram>,
    delivery: mpsc::Sender<Datagram>,
    shutdown: broadcast::Receiver<()>,
}

impl ChunkReceiver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &TrellisConfig,
        local: PeerId,
        socket: Arc<UdpSocket>,
        tcp_rx: mpsc::Receiver<Datagram>,
        registry: PeerRegistry,
        fallback: Option<FallbackClient<Arc<UdpSocket>>>,
        outbound: mpsc::Sender<Datagram>,
        delivery: mpsc::Sender<Datagram>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let codec = ChunkCodec::new(config.chunking.chunk_number_width)
            .context("invalid chunk number width")?;
        Ok(Self {
            socket,
            tcp_rx,
            codec,
            max_content_length: config.chunking.max_content_length,
            transfer_timeout: config.chunking.transfer_timeout(),
            buffers: HashMap::new(),
            fallback,
            local,
            is_super_peer: config.super_peer.enabled,
            super_peer: config.super_peer.public_key,
            super_endpoints: config.super_peer.endpoints.iter().copied().collect(),
            tracker: PathTracker::new(registry, config.fallback.client_timeout()),
            outbound,
            delivery,
            shutdown,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut expiry = tokio::time::interval(EXPIRY_INTERVAL);

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(in_flight = self.buffers.len(), "chunk receiver shutting down");
                    return Ok(());
                }

                result = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                    };
                    let bytes = Bytes::copy_from_slice(&buf[..len]);
                    self.on_datagram(Path::udp(from), bytes).await;
                }

                Some((from, bytes)) = self.tcp_rx.recv() => {
                    self.on_datagram(Path::tcp_fallback(from), bytes).await;
                }

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.fire_timeouts(Instant::now());
                }

                _ = expiry.tick() => {
                    let withdrawn = self.tracker.expire(Instant::now());
                    if withdrawn > 0 {
                        tracing::debug!(withdrawn, "silent paths withdrawn");
                    }
                }
            }
        }
    }

    async fn on_datagram(&mut self, path: Path, bytes: Bytes) {
        if path.kind == PathKind::Udp {
            if let Some(client) = &self.fallback {
                client.on_inbound(path.endpoint);
            }
        }
        if let Some(super_peer) = self.super_peer {
            if self.is_super_peer_path(&path) {
                self.tracker.super_peer_seen(super_peer, path, Instant::now());
            }
        }

        let chunk = match self.codec.decode(bytes) {
            Decoded::Passthrough(bytes) => return self.on_message(path, bytes).await,
            Decoded::Chunk(chunk) => chunk,
        };
        tracing::trace!(
            from = %path.endpoint,
            msg_id = chunk.msg_id,
            number = chunk.number(),
            last = chunk.is_last(),
            len = chunk.payload.len(),
            "chunk received"
        );

        let (max, timeout) = (self.max_content_length, self.transfer_timeout);
        let buffer = self
            .buffers
            .entry(path)
            .or_insert_with(|| ReassemblyBuffer::new(max, timeout));
        match buffer.on_chunk(chunk) {
            Ok(done) if done.is_empty() => {}
            Ok(done) => {
                self.buffers.remove(&path);
                let payload = aggregate(done);
                self.on_message(path, payload).await;
            }
            Err(e) => {
                self.buffers.remove(&path);
                tracing::warn!(from = %path.endpoint, kind = ?path.kind, error = %e, "chunked message rejected");
            }
        }
    }

    async fn on_message(&mut self, path: Path, payload: Bytes) {
        if let Some((kind, sender)) = decode_keepalive(&payload) {
            match kind {
                KeepaliveKind::Ping => {
                    if self.is_super_peer {
                        self.tracker.child_seen(sender, path, Instant::now());
                    }
                    let pong = encode_keepalive(KeepaliveKind::Pong, &self.local);
                    if self.outbound.send((path.endpoint, pong)).await.is_err() {
                        tracing::debug!("outbound queue closed, pong dropped");
                    }
                }
                KeepaliveKind::Pong => {
                    tracing::trace!(from = %path.endpoint, sender = %sender.short(), "pong");
                }
            }
            return;
        }

        tracing::debug!(from = %path.endpoint, len = payload.len(), "message received");
        if self.delivery.send((path.endpoint, payload)).await.is_err() {
            tracing::debug!("delivery channel closed, message dropped");
        }
    }

    fn is_super_peer_path(&self, path: &Path) -> bool {
        match path.kind {
            PathKind::Udp => self.super_endpoints.contains(&path.endpoint),
            PathKind::TcpFallback => self
                .fallback
                .as_ref()
                .is_some_and(|c| c.target() == path.endpoint),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.buffers
            .values()
            .filter_map(|b| b.pending_timeout())
            .map(|t| t.deadline())
            .min()
    }

    fn fire_timeouts(&mut self, now: Instant) {
        for buffer in self.buffers.values_mut() {
            if let Some(ticket) = buffer.pending_timeout() {
                if ticket.deadline() <= now {
                    buffer.on_timeout(ticket);
                }
            }
        }
        self.buffers.retain(|_, b| !b.is_idle());
    }
}

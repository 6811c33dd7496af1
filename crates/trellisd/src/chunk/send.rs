//! Outbound data plane: split, encode, route.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use trellis_core::config::ChunkingConfig;
use trellis_core::wire::OVERLAY_MAGIC;
use trellis_core::ChunkCodec;
use trellis_services::{MessageSplitter, Outbound};

use super::Datagram;

pub struct SendWorker {
    route: Arc<dyn Outbound>,
    codec: ChunkCodec,
    mtu: usize,
    max_content_length: usize,
    /// Message ids are allocated per destination.
    splitters: HashMap<SocketAddr, MessageSplitter>,
    outbound_rx: mpsc::Receiver<Datagram>,
    shutdown: broadcast::Receiver<()>,
}

impl SendWorker {
    pub fn new(
        chunking: &ChunkingConfig,
        route: Arc<dyn Outbound>,
        outbound_rx: mpsc::Receiver<Datagram>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let codec = ChunkCodec::new(chunking.chunk_number_width)
            .context("invalid chunk number width")?;
        Ok(Self {
            route,
            codec,
            mtu: chunking.mtu,
            max_content_length: chunking.max_content_length,
            splitters: HashMap::new(),
            outbound_rx,
            shutdown,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("send worker shutting down");
                    return Ok(());
                }

                msg = self.outbound_rx.recv() => {
                    let (dest, payload) = match msg {
                        Some(m) => m,
                        None => {
                            tracing::info!("outbound queue dropped, send worker exiting");
                            return Ok(());
                        }
                    };
                    let len = payload.len();
                    if let Err(e) = self.send(dest, payload).await {
                        tracing::warn!(%dest, len, error = %format_args!("{e:#}"), "send failed");
                    }
                }
            }
        }
    }

    /// Every queued payload must be an overlay message, i.e. start with
    /// `OVERLAY_MAGIC`; fallback servers hang up on anything else.
    async fn send(&mut self, dest: SocketAddr, payload: Bytes) -> Result<()> {
        ensure!(
            payload.starts_with(&OVERLAY_MAGIC.to_be_bytes()),
            "payload is not an overlay message"
        );

        let splitter = match self.splitters.entry(dest) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(
                MessageSplitter::new(self.codec, self.mtu, self.max_content_length)
                    .context("cannot build message splitter")?,
            ),
        };

        if splitter.fits_unchunked(payload.len()) {
            return self
                .route
                .send(dest, payload)
                .await
                .context("failed to send datagram");
        }

        let datagrams = splitter
            .split_encoded(payload)
            .context("failed to split message")?;
        let count = datagrams.len();
        for datagram in datagrams {
            self.route
                .send(dest, datagram)
                .await
                .context("failed to send chunk")?;
        }
        tracing::debug!(%dest, chunks = count, "chunked message sent");
        Ok(())
    }
}

//! Fallback server: accepts TCP connections from peers that cannot use the
//! primary transport and bridges them into the overlay.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use trellis_core::wire::is_overlay_frame;

use super::{frame_codec, FallbackError, STATUS_REPLY};
use crate::transport::{Outbound, PrimaryTransport, SendError};

const CLIENT_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub idle_timeout: Duration,
    pub status_enabled: bool,
    pub max_frame: usize,
}

struct ClientHandle {
    id: u64,
    writer: mpsc::Sender<Bytes>,
}

struct Inner<T> {
    primary: T,
    options: ServerOptions,
    clients: DashMap<SocketAddr, ClientHandle>,
    inbound: mpsc::Sender<(SocketAddr, Bytes)>,
    next_id: AtomicU64,
}

pub struct FallbackServer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for FallbackServer<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: PrimaryTransport> FallbackServer<T> {
    /// Frames received from clients are delivered on `inbound`, tagged with
    /// the client's remote address.
    pub fn new(primary: T, options: ServerOptions, inbound: mpsc::Sender<(SocketAddr, Bytes)>) -> Self {
        Self {
            inner: Arc::new(Inner {
                primary,
                options,
                clients: DashMap::new(),
                inbound,
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub async fn bind(addr: SocketAddr) -> Result<TcpListener, FallbackError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| FallbackError::Bind { addr, source })
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    pub fn has_client(&self, addr: &SocketAddr) -> bool {
        self.inner.clients.contains_key(addr)
    }

    /// Accept loop. Runs until `shutdown` fires.
    pub async fn serve(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "fallback server listening");
        }
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(clients = self.client_count(), "fallback server shutting down");
                    self.inner.clients.clear();
                    return;
                }
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "fallback accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(error = %e, "failed to set TCP_NODELAY");
                    }
                    let (writer, writes) = mpsc::channel(CLIENT_QUEUE);
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    self.inner.clients.insert(remote, ClientHandle { id, writer });
                    tracing::info!(%remote, "fallback client connected");
                    tokio::spawn(Inner::handle_client(self.inner.clone(), id, stream, remote, writes));
                }
            }
        }
    }

    /// Route one datagram. Addresses with a fallback connection get the
    /// datagram over TCP; a full queue or a closed connection is an error,
    /// not a silent drop. Unknown addresses go over the primary transport.
    pub async fn send(&self, dest: SocketAddr, bytes: Bytes) -> Result<(), SendError> {
        let writer = self.inner.clients.get(&dest).map(|c| c.writer.clone());
        match writer {
            Some(writer) => writer.try_send(bytes).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::NotWritable(dest),
                mpsc::error::TrySendError::Closed(_) => SendError::Closed(dest),
            }),
            None => self
                .inner
                .primary
                .send_to(dest, bytes)
                .await
                .map_err(|source| SendError::Primary { dest, source }),
        }
    }
}

impl<T: PrimaryTransport> Inner<T> {
    async fn handle_client(
        this: Arc<Self>,
        id: u64,
        stream: TcpStream,
        remote: SocketAddr,
        mut writes: mpsc::Receiver<Bytes>,
    ) {
        let idle_timeout = this.options.idle_timeout;
        let mut framed = Framed::new(stream, frame_codec(this.options.max_frame));
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        let reason = loop {
            tokio::select! {
                _ = &mut idle => break "idle",
                write = writes.recv() => {
                    let Some(bytes) = write else { break "evicted" };
                    if let Err(e) = framed.send(bytes).await {
                        tracing::debug!(%remote, error = %e, "fallback write failed");
                        break "write failed";
                    }
                }
                frame = framed.next() => match frame {
                    Some(Ok(frame)) if is_overlay_frame(&frame) => {
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                        if this.inbound.send((remote, frame.freeze())).await.is_err() {
                            break "inbound receiver dropped";
                        }
                    }
                    Some(Ok(_)) => {
                        this.reject(&mut framed, remote).await;
                        break "not an overlay message";
                    }
                    Some(Err(e)) => {
                        tracing::debug!(%remote, error = %e, "fallback frame rejected");
                        this.reject(&mut framed, remote).await;
                        break "malformed frame";
                    }
                    None => break "closed by client",
                },
            }
        };

        this.clients.remove_if(&remote, |_, c| c.id == id);
        tracing::info!(%remote, reason, "fallback client disconnected");
    }

    async fn reject(&self, framed: &mut Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>, remote: SocketAddr) {
        if !self.options.status_enabled {
            return;
        }
        let stream = framed.get_mut();
        if let Err(e) = stream.write_all(STATUS_REPLY).await {
            tracing::debug!(%remote, error = %e, "failed to write status reply");
            return;
        }
        let _ = stream.shutdown().await;
    }
}

#[async_trait]
impl<T: PrimaryTransport> Outbound for FallbackServer<T> {
    async fn send(&self, dest: SocketAddr, bytes: Bytes) -> Result<(), SendError> {
        FallbackServer::send(self, dest, bytes).await
    }
}

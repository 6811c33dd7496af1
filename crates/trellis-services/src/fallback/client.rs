//! Fallback client: reroutes super-peer traffic over TCP while the primary
//! transport is silent.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::Framed;

use super::{frame_codec, FallbackError};
use crate::transport::{Outbound, PrimaryTransport, SendError};

const WRITE_QUEUE: usize = 64;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type Write = (Bytes, oneshot::Sender<io::Result<()>>);

enum ConnState {
    Idle,
    Connecting { id: u64 },
    Connected { id: u64, writer: mpsc::Sender<Write>, task: JoinHandle<()> },
}

struct Inner<T> {
    primary: T,
    super_peers: HashSet<SocketAddr>,
    target: SocketAddr,
    timeout: Duration,
    max_frame: usize,
    inbound: mpsc::Sender<(SocketAddr, Bytes)>,
    last_response: Mutex<Instant>,
    state: Mutex<ConnState>,
    retry: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
    attempts: AtomicUsize,
    opened: AtomicUsize,
}

/// Cheap to clone; all clones share one connection.
pub struct FallbackClient<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for FallbackClient<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

fn lock<V>(m: &Mutex<V>) -> MutexGuard<'_, V> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl<T: PrimaryTransport> FallbackClient<T> {
    /// `super_peers` are the primary-transport addresses whose traffic counts
    /// as a sign of life. Frames arriving over the fallback connection are
    /// delivered on `inbound`, tagged with `target`.
    pub fn new(
        primary: T,
        super_peers: impl IntoIterator<Item = SocketAddr>,
        target: SocketAddr,
        timeout: Duration,
        max_frame: usize,
        inbound: mpsc::Sender<(SocketAddr, Bytes)>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                primary,
                super_peers: super_peers.into_iter().collect(),
                target,
                timeout,
                max_frame,
                inbound,
                last_response: Mutex::new(Instant::now()),
                state: Mutex::new(ConnState::Idle),
                retry: Mutex::new(None),
                next_id: AtomicU64::new(0),
                attempts: AtomicUsize::new(0),
                opened: AtomicUsize::new(0),
            }),
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.inner.target
    }

    pub fn is_super_peer(&self, addr: &SocketAddr) -> bool {
        self.inner.super_peers.contains(addr)
    }

    pub fn is_connected(&self) -> bool {
        matches!(*lock(&self.inner.state), ConnState::Connected { .. })
    }

    pub fn is_connecting(&self) -> bool {
        matches!(*lock(&self.inner.state), ConnState::Connecting { .. })
    }

    /// Connection attempts started so far.
    pub fn connect_attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    /// Connections successfully established so far.
    pub fn connections_opened(&self) -> usize {
        self.inner.opened.load(Ordering::Relaxed)
    }

    /// Primary-transport traffic arrived from `sender`. Traffic from a super
    /// peer resets the silence timer and closes the fallback connection.
    pub fn on_inbound(&self, sender: SocketAddr) {
        if !self.inner.super_peers.contains(&sender) {
            return;
        }
        *lock(&self.inner.last_response) = Instant::now();
        if let Some(h) = lock(&self.inner.retry).take() {
            h.abort();
        }
        self.inner.close("primary transport recovered");
    }

    /// Route one datagram. Super-peer traffic goes over the fallback
    /// connection when one is open; everything else, and super-peer traffic
    /// without a connection, goes over the primary transport.
    pub async fn send(&self, dest: SocketAddr, bytes: Bytes) -> Result<(), SendError> {
        if !self.inner.super_peers.contains(&dest) {
            return self.send_primary(dest, bytes).await;
        }

        let writer = match &*lock(&self.inner.state) {
            ConnState::Connected { writer, .. } => Some(writer.clone()),
            _ => None,
        };
        if let Some(writer) = writer {
            let (ack, done) = oneshot::channel();
            let target = self.inner.target;
            writer
                .send((bytes, ack))
                .await
                .map_err(|_| SendError::Closed(target))?;
            return match done.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(source)) => Err(SendError::Fallback { dest: target, source }),
                Err(_) => Err(SendError::Closed(target)),
            };
        }

        let result = self.send_primary(dest, bytes).await;
        Inner::check_timeout(&self.inner);
        result
    }

    /// Close the fallback connection and cancel any pending retry.
    pub fn shutdown(&self) {
        if let Some(h) = lock(&self.inner.retry).take() {
            h.abort();
        }
        self.inner.close("shutting down");
    }

    async fn send_primary(&self, dest: SocketAddr, bytes: Bytes) -> Result<(), SendError> {
        self.inner
            .primary
            .send_to(dest, bytes)
            .await
            .map_err(|source| SendError::Primary { dest, source })
    }
}

impl<T: PrimaryTransport> Inner<T> {
    fn check_timeout(this: &Arc<Self>) {
        let silent = lock(&this.last_response).elapsed();
        if silent < this.timeout {
            return;
        }

        let id = {
            let mut state = lock(&this.state);
            if !matches!(*state, ConnState::Idle) {
                return;
            }
            let id = this.next_id.fetch_add(1, Ordering::Relaxed);
            *state = ConnState::Connecting { id };
            // at most one attempt per timeout window
            *lock(&this.last_response) = Instant::now();
            id
        };
        this.attempts.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            server = %this.target,
            silent_ms = silent.as_millis() as u64,
            "no super peer traffic, opening fallback connection"
        );
        tokio::spawn(Self::connect(this.clone(), id));
    }

    async fn connect(this: Arc<Self>, id: u64) {
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(this.target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                this.connect_failed(id, FallbackError::Connect { addr: this.target, source });
                return;
            }
            Err(_) => {
                let source = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
                this.connect_failed(id, FallbackError::Connect { addr: this.target, source });
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
        }

        let mut state = lock(&this.state);
        if !matches!(*state, ConnState::Connecting { id: current } if current == id) {
            tracing::debug!(server = %this.target, "fallback connection no longer wanted, dropping");
            return;
        }
        let (writer, writes) = mpsc::channel(WRITE_QUEUE);
        let framed = Framed::new(stream, frame_codec(this.max_frame));
        let task = tokio::spawn(Self::drive(this.clone(), id, framed, writes));
        *state = ConnState::Connected { id, writer, task };
        this.opened.fetch_add(1, Ordering::Relaxed);
        tracing::info!(server = %this.target, "fallback connection established");
    }

    fn connect_failed(self: &Arc<Self>, id: u64, error: FallbackError) {
        tracing::warn!(error = %error, "fallback connection failed");
        {
            let mut state = lock(&self.state);
            if matches!(*state, ConnState::Connecting { id: current } if current == id) {
                *state = ConnState::Idle;
            }
        }

        let mut retry = lock(&self.retry);
        if let Some(h) = retry.take() {
            h.abort();
        }
        let this = self.clone();
        *retry = Some(tokio::spawn(async move {
            tokio::time::sleep(this.timeout).await;
            Self::check_timeout(&this);
        }));
    }

    /// Owns the TCP stream: writes queued frames, delivers received ones.
    async fn drive(
        this: Arc<Self>,
        id: u64,
        mut framed: Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>,
        mut writes: mpsc::Receiver<Write>,
    ) {
        let reason = loop {
            tokio::select! {
                write = writes.recv() => {
                    let Some((bytes, ack)) = write else { break "writer dropped" };
                    let result = framed.send(bytes).await;
                    let failed = result.is_err();
                    let _ = ack.send(result);
                    if failed {
                        break "write failed";
                    }
                }
                frame = framed.next() => match frame {
                    Some(Ok(frame)) => {
                        if this.inbound.send((this.target, frame.freeze())).await.is_err() {
                            break "inbound receiver dropped";
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "fallback read failed");
                        break "read failed";
                    }
                    None => break "closed by server",
                },
            }
        };

        let mut state = lock(&this.state);
        if matches!(*state, ConnState::Connected { id: current, .. } if current == id) {
            *state = ConnState::Idle;
            tracing::info!(server = %this.target, reason, "fallback connection closed");
        }
    }

    fn close(&self, reason: &'static str) {
        let previous = std::mem::replace(&mut *lock(&self.state), ConnState::Idle);
        match previous {
            ConnState::Connected { task, .. } => {
                task.abort();
                tracing::info!(server = %self.target, reason, "fallback connection closed");
            }
            ConnState::Connecting { .. } => {
                tracing::debug!(server = %self.target, reason, "fallback connect abandoned");
            }
            ConnState::Idle => {}
        }
    }
}

#[async_trait]
impl<T: PrimaryTransport> Outbound for FallbackClient<T> {
    async fn send(&self, dest: SocketAddr, bytes: Bytes) -> Result<(), SendError> {
        FallbackClient::send(self, dest, bytes).await
    }
}

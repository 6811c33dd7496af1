//! Transport seams.
//!
//! [`PrimaryTransport`] is the datagram socket the node normally talks over.
//! [`Outbound`] is what the send path routes through; the fallback client and
//! server implement it by wrapping a primary transport, and [`Direct`] is the
//! plain pass-through used when no fallback is configured.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;

#[async_trait]
pub trait PrimaryTransport: Send + Sync + 'static {
    async fn send_to(&self, dest: SocketAddr, bytes: Bytes) -> io::Result<()>;
}

#[async_trait]
impl PrimaryTransport for UdpSocket {
    async fn send_to(&self, dest: SocketAddr, bytes: Bytes) -> io::Result<()> {
        let sent = UdpSocket::send_to(self, &bytes, dest).await?;
        if sent != bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("datagram truncated: {sent} of {} bytes sent", bytes.len()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl<T: PrimaryTransport + ?Sized> PrimaryTransport for Arc<T> {
    async fn send_to(&self, dest: SocketAddr, bytes: Bytes) -> io::Result<()> {
        (**self).send_to(dest, bytes).await
    }
}

/// Route for one outbound datagram.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send(&self, dest: SocketAddr, bytes: Bytes) -> Result<(), SendError>;
}

/// Sends everything over the primary transport.
#[derive(Debug, Clone)]
pub struct Direct<T>(pub T);

#[async_trait]
impl<T: PrimaryTransport> Outbound for Direct<T> {
    async fn send(&self, dest: SocketAddr, bytes: Bytes) -> Result<(), SendError> {
        self.0
            .send_to(dest, bytes)
            .await
            .map_err(|source| SendError::Primary { dest, source })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("primary transport send to {dest} failed: {source}")]
    Primary {
        dest: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("fallback write to {dest} failed: {source}")]
    Fallback {
        dest: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("fallback connection to {0} is not writable")]
    NotWritable(SocketAddr),

    #[error("fallback connection to {0} is closed")]
    Closed(SocketAddr),
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every datagram instead of sending it.
    #[derive(Debug, Default)]
    pub struct RecordingTransport {
        sent: Mutex<Vec<(SocketAddr, Bytes)>>,
    }

    impl RecordingTransport {
        pub fn sent(&self) -> Vec<(SocketAddr, Bytes)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PrimaryTransport for RecordingTransport {
        async fn send_to(&self, dest: SocketAddr, bytes: Bytes) -> io::Result<()> {
            self.sent.lock().unwrap().push((dest, bytes));
            Ok(())
        }
    }
}

//! Trellis integration test harness.
//!
//! Everything runs over loopback on OS-assigned ports, so no privileges or
//! network setup are needed:
//!
//!   cargo test --test integration

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::net::UdpSocket;

mod chunking;
mod fallback;
mod registry;

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long any single wait in a test may take before it counts as a hang.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind a UDP socket on 127.0.0.1 with an OS-assigned port.
pub async fn loopback_udp() -> Result<Arc<UdpSocket>> {
    let socket = UdpSocket::bind("127.0.0.1:0")
        .await
        .context("failed to bind loopback UDP socket")?;
    Ok(Arc::new(socket))
}

/// Receive exactly `n` datagrams, or fail after `STEP_TIMEOUT` of silence.
pub async fn recv_datagrams(socket: &UdpSocket, n: usize) -> Result<Vec<(SocketAddr, Bytes)>> {
    let mut buf = vec![0u8; 65_535];
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let (len, from) = match tokio::time::timeout(STEP_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(r) => r.context("recv_from failed")?,
            Err(_) => bail!("timed out after {} of {n} datagrams", out.len()),
        };
        out.push((from, Bytes::copy_from_slice(&buf[..len])));
    }
    Ok(out)
}

/// Poll `cond` until it holds, or fail after `STEP_TIMEOUT`.
pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) -> Result<()> {
    let result = tokio::time::timeout(STEP_TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    match result {
        Ok(()) => Ok(()),
        Err(_) => bail!("timed out waiting for {what}"),
    }
}

/// Deterministic, non-repeating test payload.
pub fn payload(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
}

//! TCP fallback for nodes whose primary transport has gone quiet.
//!
//! A regular node runs a [`FallbackClient`]: once no datagram from any super
//! peer has arrived for the configured timeout, it opens one TCP connection
//! to the fallback address and pushes super-peer traffic through it until
//! the primary transport delivers again. A super peer runs a
//! [`FallbackServer`] that accepts those connections and bridges them.
//!
//! Both ends exchange length-delimited frames, one frame per overlay
//! datagram.

mod client;
mod server;

use std::io;
use std::net::SocketAddr;

use tokio_util::codec::LengthDelimitedCodec;

pub use client::FallbackClient;
pub use server::{FallbackServer, ServerOptions};

/// Written to clients that do not speak the overlay protocol, so plain
/// HTTP health checks against the fallback port succeed.
pub const STATUS_REPLY: &[u8] = b"HTTP/1.1 200 OK\nContent-Length:0";

fn frame_codec(max_frame: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame)
        .new_codec()
}

#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    #[error("failed to bind fallback server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to fallback server {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("fallback client enabled but no fallback address is configured")]
    NoTarget,
}

//! The data plane: chunked messages in and out of the primary transport.
//!
//! Inbound datagrams (UDP, or frames bridged over the TCP fallback) are
//! decoded, reassembled per sender and delivered upward. Outbound payloads
//! are split to fit the MTU, encoded and routed.

pub mod receive;
pub mod send;

use std::net::SocketAddr;

use bytes::Bytes;

/// A payload and the remote address it came from or goes to.
pub type Datagram = (SocketAddr, Bytes);

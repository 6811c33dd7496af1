//! Super-peer liveness.
//!
//! Regular nodes ping their super peer's endpoints; any traffic back from an
//! endpoint marks that path live and the super peer online. A super peer
//! records the nodes that ping it as children. Paths that stay silent for
//! longer than the timeout are withdrawn from the registry.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use trellis_core::wire::OVERLAY_MAGIC;
use trellis_core::PeerId;
use trellis_services::{Path, PeerInformation, PeerRegistry};

pub const PING_INTERVAL: Duration = Duration::from_secs(5);

// ── Keepalive frame ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveKind {
    Ping,
    Pong,
}

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct Keepalive {
    magic: [u8; 4],
    kind: u8,
    sender: [u8; 32],
}

const _: () = assert!(std::mem::size_of::<Keepalive>() == 37);

pub fn encode_keepalive(kind: KeepaliveKind, sender: &PeerId) -> Bytes {
    let frame = Keepalive {
        magic: OVERLAY_MAGIC.to_be_bytes(),
        kind: match kind {
            KeepaliveKind::Ping => 0,
            KeepaliveKind::Pong => 1,
        },
        sender: *sender.as_bytes(),
    };
    Bytes::copy_from_slice(frame.as_bytes())
}

pub fn decode_keepalive(buf: &[u8]) -> Option<(KeepaliveKind, PeerId)> {
    let frame = Keepalive::read_from(buf)?;
    if u32::from_be_bytes(frame.magic) != OVERLAY_MAGIC {
        return None;
    }
    let kind = match frame.kind {
        0 => KeepaliveKind::Ping,
        1 => KeepaliveKind::Pong,
        _ => return None,
    };
    Some((kind, PeerId::from_bytes(frame.sender)))
}

// ── Path tracking ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    SuperPeer,
    Child,
}

#[derive(Debug)]
struct Seen {
    peer: PeerId,
    role: Role,
    at: Instant,
}

pub struct PathTracker {
    registry: PeerRegistry,
    timeout: Duration,
    seen: HashMap<Path, Seen>,
}

impl PathTracker {
    pub fn new(registry: PeerRegistry, timeout: Duration) -> Self {
        Self {
            registry,
            timeout,
            seen: HashMap::new(),
        }
    }

    pub fn super_peer_seen(&mut self, peer: PeerId, path: Path, now: Instant) {
        if self.touch(&path, now) {
            return;
        }
        tracing::debug!(peer = %peer.short(), endpoint = %path.endpoint, kind = ?path.kind, "super peer path up");
        self.registry.set_peer_information_and_add_path_and_set_super_peer(
            peer,
            PeerInformation::of([path.endpoint]),
            path,
        );
        self.seen.insert(path, Seen { peer, role: Role::SuperPeer, at: now });
    }

    pub fn child_seen(&mut self, peer: PeerId, path: Path, now: Instant) {
        if self.touch(&path, now) {
            return;
        }
        tracing::debug!(peer = %peer.short(), endpoint = %path.endpoint, kind = ?path.kind, "child path up");
        self.registry.set_peer_information_and_add_path_and_children(
            peer,
            PeerInformation::of([path.endpoint]),
            path,
        );
        self.seen.insert(path, Seen { peer, role: Role::Child, at: now });
    }

    /// Withdraw every path silent since `now - timeout`. Returns how many
    /// were withdrawn.
    pub fn expire(&mut self, now: Instant) -> usize {
        let stale: Vec<Path> = self
            .seen
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.at) > self.timeout)
            .map(|(p, _)| *p)
            .collect();

        for path in &stale {
            let Some(seen) = self.seen.remove(path) else { continue };
            let others = self
                .seen
                .values()
                .any(|s| s.peer == seen.peer && s.role == seen.role);
            tracing::debug!(peer = %seen.peer.short(), endpoint = %path.endpoint, role = ?seen.role, "path silent, withdrawing");
            match (seen.role, others) {
                (_, true) => self.registry.remove_path(&seen.peer, path),
                (Role::SuperPeer, false) => self.registry.unset_super_peer_and_remove_path(path),
                (Role::Child, false) => self.registry.remove_children_and_path(&seen.peer, path),
            }
        }
        stale.len()
    }

    fn touch(&mut self, path: &Path, now: Instant) -> bool {
        match self.seen.get_mut(path) {
            Some(s) => {
                s.at = now;
                true
            }
            None => false,
        }
    }
}

//! Peer reachability registry. It tracks which peers we can reach directly, which
//! only through a relay, and who our own super peer is.
//!
//! A peer is *direct* iff it has at least one path. It is *relayed* iff it is
//! known, has no path, and either we have a super peer or the peer is one of
//! our children. Direct always wins.
//!
//! Every mutation holds the write lock for its whole check-then-act sequence
//! and publishes its events before releasing it, so subscribers see events in
//! mutation order and never a transition computed from a stale view. Events
//! go into a broadcast channel; no subscriber code runs under the lock.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;
use trellis_core::PeerId;

/// Buffered events per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 1024;

/// Transport a path runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathKind {
    /// The primary UDP transport.
    Udp,
    /// A TCP fallback connection.
    TcpFallback,
}

/// One concrete communication channel to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Path {
    pub kind: PathKind,
    pub endpoint: SocketAddr,
}

impl Path {
    pub fn udp(endpoint: SocketAddr) -> Self {
        Self {
            kind: PathKind::Udp,
            endpoint,
        }
    }

    pub fn tcp_fallback(endpoint: SocketAddr) -> Self {
        Self {
            kind: PathKind::TcpFallback,
            endpoint,
        }
    }
}

/// Endpoints a peer can be reached at, as learned from discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInformation {
    pub endpoints: HashSet<SocketAddr>,
}

impl PeerInformation {
    pub fn of(endpoints: impl IntoIterator<Item = SocketAddr>) -> Self {
        Self {
            endpoints: endpoints.into_iter().collect(),
        }
    }
}

/// Everything the registry knows about a peer apart from its paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub endpoints: HashSet<SocketAddr>,
}

impl PeerRecord {
    fn empty(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            endpoints: HashSet::new(),
        }
    }
}

/// A copy of one peer's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub record: PeerRecord,
    pub paths: HashSet<Path>,
}

/// Reachability transitions published by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityEvent {
    /// The peer gained its first direct path.
    PeerDirect(PeerId),
    /// The peer is known and reachable, but only through a relay.
    PeerRelayed(PeerId),
    /// We have a super peer.
    NodeOnline,
    /// We lost our super peer.
    NodeOffline,
}

/// Current reachability of a single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Direct,
    Relayed,
    Unreachable,
}

#[derive(Debug, Default)]
struct RegistryState {
    peers: HashMap<PeerId, PeerRecord>,
    paths: HashMap<PeerId, HashSet<Path>>,
    children: HashSet<PeerId>,
    super_peer: Option<PeerId>,
}

impl RegistryState {
    fn has_path(&self, peer: &PeerId) -> bool {
        self.paths.get(peer).is_some_and(|p| !p.is_empty())
    }

    fn qualifies_as_relayed(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
            && !self.has_path(peer)
            && (self.super_peer.is_some() || self.children.contains(peer))
    }

    fn reachability(&self, peer: &PeerId) -> Reachability {
        if self.has_path(peer) {
            Reachability::Direct
        } else if self.qualifies_as_relayed(peer) {
            Reachability::Relayed
        } else {
            Reachability::Unreachable
        }
    }

    fn merge_information(&mut self, peer: PeerId, info: PeerInformation) {
        self.peers
            .entry(peer)
            .or_insert_with(|| PeerRecord::empty(peer))
            .endpoints
            .extend(info.endpoints);
    }

    /// Returns true if `path` is the peer's first path.
    fn add_path(&mut self, peer: PeerId, path: Path) -> bool {
        let set = self.paths.entry(peer).or_default();
        let first = set.is_empty();
        set.insert(path) && first
    }

    /// Returns true if removing `path` left the peer without any path.
    fn remove_path(&mut self, peer: &PeerId, path: &Path) -> bool {
        let Some(set) = self.paths.get_mut(peer) else {
            return false;
        };
        let emptied = set.remove(path) && set.is_empty();
        if set.is_empty() {
            self.paths.remove(peer);
        }
        emptied
    }
}

/// The reachability registry, shared between the transport, the fallback
/// endpoints and path-establishment logic. Cloning shares the same state.
#[derive(Clone)]
pub struct PeerRegistry {
    state: Arc<RwLock<RegistryState>>,
    events: broadcast::Sender<ReachabilityEvent>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
            events,
        }
    }

    /// Subscribe to reachability events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ReachabilityEvent> {
        self.events.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: ReachabilityEvent) {
        tracing::debug!(?event, "reachability changed");
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    // ── Mutations ────────────────────────────────────────────────────────────

    /// Make `peer` known with no endpoints. Silent.
    pub fn add_peer(&self, peer: PeerId) {
        if self.read().peers.contains_key(&peer) {
            return;
        }
        let mut state = self.write();
        state
            .peers
            .entry(peer)
            .or_insert_with(|| PeerRecord::empty(peer));
    }

    /// Merge endpoints into the peer's record. A peer without paths that is
    /// reachable through a relay is reported as relayed.
    pub fn set_peer_information(&self, peer: PeerId, info: PeerInformation) {
        let mut state = self.write();
        state.merge_information(peer, info);
        if state.qualifies_as_relayed(&peer) {
            self.publish(ReachabilityEvent::PeerRelayed(peer));
        }
    }

    /// Add a path. Reports the peer as direct if it is the first one.
    pub fn add_path(&self, peer: PeerId, path: Path) {
        let mut state = self.write();
        state
            .peers
            .entry(peer)
            .or_insert_with(|| PeerRecord::empty(peer));
        if state.add_path(peer, path) {
            self.publish(ReachabilityEvent::PeerDirect(peer));
        }
    }

    /// Remove a path. If it was the last one and the peer is still reachable
    /// through a relay, the peer is reported as relayed.
    pub fn remove_path(&self, peer: &PeerId, path: &Path) {
        let mut state = self.write();
        if state.remove_path(peer, path) && state.qualifies_as_relayed(peer) {
            self.publish(ReachabilityEvent::PeerRelayed(*peer));
        }
    }

    /// Atomically record `peer` as our super peer, reachable over `path`.
    pub fn set_peer_information_and_add_path_and_set_super_peer(
        &self,
        peer: PeerId,
        info: PeerInformation,
        path: Path,
    ) {
        let mut state = self.write();
        state.merge_information(peer, info);
        if state.add_path(peer, path) {
            self.publish(ReachabilityEvent::PeerDirect(peer));
        }
        let was_online = state.super_peer.replace(peer).is_some();
        if !was_online {
            tracing::info!(super_peer = %peer.short(), "node online");
            self.publish(ReachabilityEvent::NodeOnline);
        }
    }

    /// Forget our super peer.
    pub fn unset_super_peer(&self) {
        let mut state = self.write();
        if let Some(peer) = state.super_peer.take() {
            tracing::info!(super_peer = %peer.short(), "node offline");
            self.publish(ReachabilityEvent::NodeOffline);
        }
    }

    /// Atomically forget our super peer and drop `path` from its path set.
    pub fn unset_super_peer_and_remove_path(&self, path: &Path) {
        let mut state = self.write();
        let Some(peer) = state.super_peer.take() else {
            return;
        };
        tracing::info!(super_peer = %peer.short(), "node offline");
        self.publish(ReachabilityEvent::NodeOffline);
        if state.remove_path(&peer, path) && state.qualifies_as_relayed(&peer) {
            self.publish(ReachabilityEvent::PeerRelayed(peer));
        }
    }

    /// Atomically record `peer` as our child, reachable over `path`. Only a
    /// first path is reported; redundant paths are silent.
    pub fn set_peer_information_and_add_path_and_children(
        &self,
        peer: PeerId,
        info: PeerInformation,
        path: Path,
    ) {
        let mut state = self.write();
        state.merge_information(peer, info);
        if state.add_path(peer, path) {
            self.publish(ReachabilityEvent::PeerDirect(peer));
        }
        state.children.insert(peer);
    }

    /// Atomically drop `peer` from our children and remove `path`. If that
    /// was its last path and we still have a super peer to relay through,
    /// the peer is reported as relayed.
    pub fn remove_children_and_path(&self, peer: &PeerId, path: &Path) {
        let mut state = self.write();
        state.children.remove(peer);
        if state.remove_path(peer, path) && state.qualifies_as_relayed(peer) {
            self.publish(ReachabilityEvent::PeerRelayed(*peer));
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn get_peers(&self) -> HashMap<PeerId, PeerRecord> {
        self.read().peers.clone()
    }

    pub fn get_children(&self) -> HashMap<PeerId, PeerRecord> {
        let state = self.read();
        state
            .children
            .iter()
            .filter_map(|id| state.peers.get(id).map(|r| (*id, r.clone())))
            .collect()
    }

    pub fn get_peer(&self, peer: &PeerId) -> Option<PeerSnapshot> {
        let state = self.read();
        let record = state.peers.get(peer)?.clone();
        let paths = state.paths.get(peer).cloned().unwrap_or_default();
        Some(PeerSnapshot { record, paths })
    }

    pub fn get_super_peer_key(&self) -> Option<PeerId> {
        self.read().super_peer
    }

    pub fn get_children_keys(&self) -> HashSet<PeerId> {
        self.read().children.clone()
    }

    pub fn get_paths(&self, peer: &PeerId) -> HashSet<Path> {
        self.read().paths.get(peer).cloned().unwrap_or_default()
    }

    pub fn is_direct_path_present(&self, peer: &PeerId) -> bool {
        self.read().has_path(peer)
    }

    pub fn reachability(&self, peer: &PeerId) -> Reachability {
        self.read().reachability(peer)
    }
}

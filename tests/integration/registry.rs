//! Reachability registry under concurrent use, observed through its event
//! channel.

use std::net::SocketAddr;

use tokio::sync::broadcast;
use trellis_core::PeerId;
use trellis_services::{Path, PeerInformation, PeerRegistry, Reachability, ReachabilityEvent};

use crate::*;

fn peer(b: u8) -> PeerId {
    PeerId::from_bytes([b; 32])
}

fn udp(port: u16) -> Path {
    Path::udp(SocketAddr::from(([127, 0, 0, 1], port)))
}

async fn next_event(rx: &mut broadcast::Receiver<ReachabilityEvent>) -> ReachabilityEvent {
    tokio::time::timeout(STEP_TIMEOUT, rx.recv())
        .await
        .expect("no event in time")
        .expect("event channel closed")
}

#[tokio::test]
async fn subscriber_can_query_the_registry_while_handling_events() {
    let registry = PeerRegistry::new();
    let mut rx = registry.subscribe();

    let observer = {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while seen.len() < 4 {
                let event = next_event(&mut rx).await;
                // calling back into the registry from the handler must not block
                let state = match event {
                    ReachabilityEvent::PeerDirect(p) | ReachabilityEvent::PeerRelayed(p) => {
                        Some(registry.reachability(&p))
                    }
                    _ => None,
                };
                seen.push((event, state));
            }
            seen
        })
    };

    let info = PeerInformation::of([SocketAddr::from(([127, 0, 0, 1], 1))]);
    registry.set_peer_information_and_add_path_and_set_super_peer(peer(1), info, udp(1));
    registry.add_path(peer(2), udp(2));
    registry.remove_path(&peer(2), &udp(2));

    let seen = observer.await.unwrap();
    assert_eq!(seen[0].0, ReachabilityEvent::PeerDirect(peer(1)));
    assert_eq!(seen[1].0, ReachabilityEvent::NodeOnline);
    assert_eq!(seen[2].0, ReachabilityEvent::PeerDirect(peer(2)));
    assert_eq!(seen[3], (ReachabilityEvent::PeerRelayed(peer(2)), Some(Reachability::Relayed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_first_paths_report_direct_once_per_peer() {
    let registry = PeerRegistry::new();
    let mut rx = registry.subscribe();

    let tasks: Vec<_> = (0..64u16)
        .map(|i| {
            let registry = registry.clone();
            tokio::spawn(async move {
                let p = peer((i % 4) as u8);
                registry.set_peer_information_and_add_path_and_children(
                    p,
                    PeerInformation::default(),
                    udp(1000 + i),
                );
            })
        })
        .collect();
    for t in tasks {
        t.await.unwrap();
    }

    let mut direct = Vec::new();
    while let Ok(event) = rx.try_recv() {
        direct.push(event);
    }
    direct.sort_by_key(|e| match e {
        ReachabilityEvent::PeerDirect(p) => *p,
        other => panic!("unexpected event {other:?}"),
    });
    assert_eq!(
        direct,
        (0..4).map(|b| ReachabilityEvent::PeerDirect(peer(b))).collect::<Vec<_>>()
    );
    assert_eq!(registry.get_children_keys().len(), 4);
    for b in 0..4 {
        assert_eq!(registry.get_paths(&peer(b)).len(), 16);
    }
}

#[tokio::test]
async fn without_super_peer_only_children_become_relayed() {
    let registry = PeerRegistry::new();
    registry.set_peer_information_and_add_path_and_children(peer(7), PeerInformation::default(), udp(7));
    registry.add_path(peer(8), udp(8));
    let mut rx = registry.subscribe();

    // no super peer: a child still qualifies as relayed, an ordinary peer does not
    registry.remove_path(&peer(7), &udp(7));
    registry.remove_path(&peer(8), &udp(8));
    assert_eq!(next_event(&mut rx).await, ReachabilityEvent::PeerRelayed(peer(7)));
    assert!(rx.try_recv().is_err());
    assert_eq!(registry.reachability(&peer(8)), Reachability::Unreachable);
}

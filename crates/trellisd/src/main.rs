//! trellisd: the Trellis overlay node daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};

use trellis_core::config::TrellisConfig;
use trellis_core::PeerId;
use trellis_services::{
    Direct, FallbackClient, FallbackError, FallbackServer, Outbound, PeerRegistry, ServerOptions,
};

mod chunk;
mod liveness;
mod socket;

use liveness::{encode_keepalive, KeepaliveKind, PING_INTERVAL};

const QUEUE_DEPTH: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = TrellisConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TrellisConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TrellisConfig::default()
    });

    let local = match config.identity.public_key {
        Some(id) => id,
        None => {
            let id = PeerId::from_bytes(rand::random());
            tracing::warn!(peer = %id.short(), "no identity configured, using an ephemeral id");
            id
        }
    };
    tracing::info!(
        peer = %local.short(),
        super_peer = config.super_peer.enabled,
        fallback = config.fallback.enabled,
        "trellisd starting"
    );

    // Primary transport
    let socket = Arc::new(socket::bind_udp(config.network.bind_addr())?);
    tracing::info!(addr = %socket.local_addr()?, "primary transport bound");

    let registry = PeerRegistry::new();
    let (outbound_tx, outbound_rx) = mpsc::channel::<chunk::Datagram>(QUEUE_DEPTH);
    let (delivery_tx, mut delivery_rx) = mpsc::channel::<chunk::Datagram>(QUEUE_DEPTH);
    let (tcp_tx, tcp_rx) = mpsc::channel::<chunk::Datagram>(QUEUE_DEPTH);

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Outbound route ───────────────────────────────────────────────────────
    // Frames carry whole chunked datagrams or unchunked messages up to the MTU.
    let max_frame = config.chunking.mtu.max(config.chunking.max_content_length);
    let mut fallback_client = None;
    let mut server_task = None;

    let route: Arc<dyn Outbound> = if !config.fallback.enabled {
        Arc::new(Direct(socket.clone()))
    } else if config.super_peer.enabled {
        let server = FallbackServer::new(
            socket.clone(),
            ServerOptions {
                idle_timeout: config.fallback.server_idle_timeout(),
                status_enabled: config.fallback.status_enabled,
                max_frame,
            },
            tcp_tx.clone(),
        );
        let listener = FallbackServer::<Arc<UdpSocket>>::bind(config.fallback.server_bind_addr()).await?;
        server_task = Some(tokio::spawn(server.clone().serve(listener, shutdown_tx.subscribe())));
        Arc::new(server)
    } else {
        match config.fallback.client_target(&config.super_peer) {
            Some(target) => {
                tracing::info!(%target, timeout_ms = config.fallback.client_timeout_ms, "fallback client armed");
                let client = FallbackClient::new(
                    socket.clone(),
                    config.super_peer.endpoints.iter().copied(),
                    target,
                    config.fallback.client_timeout(),
                    max_frame,
                    tcp_tx.clone(),
                );
                fallback_client = Some(client.clone());
                Arc::new(client)
            }
            None => {
                tracing::warn!(error = %FallbackError::NoTarget, "running without fallback");
                Arc::new(Direct(socket.clone()))
            }
        }
    };
    drop(tcp_tx);

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let receiver_task = tokio::spawn(
        chunk::receive::ChunkReceiver::new(
            &config,
            local,
            socket.clone(),
            tcp_rx,
            registry.clone(),
            fallback_client.clone(),
            outbound_tx.clone(),
            delivery_tx,
            shutdown_tx.subscribe(),
        )?
        .run(),
    );

    let send_task = tokio::spawn(
        chunk::send::SendWorker::new(&config.chunking, route, outbound_rx, shutdown_tx.subscribe())?
            .run(),
    );

    let event_logger = {
        let mut events = registry.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => tracing::info!(?event, "reachability changed"),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "reachability event logger lagging")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    let delivery_task = tokio::spawn(async move {
        while let Some((from, payload)) = delivery_rx.recv().await {
            tracing::info!(%from, len = payload.len(), "message delivered");
        }
    });

    let pinger = {
        let endpoints = if config.super_peer.enabled {
            Vec::new()
        } else {
            config.super_peer.endpoints.clone()
        };
        let outbound = outbound_tx.clone();
        tokio::spawn(async move {
            if endpoints.is_empty() {
                return std::future::pending().await;
            }
            let mut interval = tokio::time::interval(PING_INTERVAL);
            loop {
                interval.tick().await;
                for ep in &endpoints {
                    let ping = encode_keepalive(KeepaliveKind::Ping, &local);
                    if outbound.send((*ep, ping)).await.is_err() {
                        return;
                    }
                }
            }
        })
    };

    let registry_printer = {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let peers = registry.get_peers();
                let direct = peers
                    .keys()
                    .filter(|p| registry.is_direct_path_present(p))
                    .count();
                tracing::debug!(
                    peers = peers.len(),
                    direct,
                    children = registry.get_children().len(),
                    super_peer = ?registry.get_super_peer_key().map(|p| p.short()),
                    "registry snapshot"
                );
            }
        })
    };

    let server_task = async {
        match server_task {
            Some(handle) => handle.await,
            None => std::future::pending().await,
        }
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()   => tracing::info!("shutting down"),
        r = receiver_task        => tracing::error!("chunk receiver exited: {:?}", r),
        r = send_task            => tracing::error!("send worker exited: {:?}", r),
        r = event_logger         => tracing::error!("event logger exited: {:?}", r),
        r = delivery_task        => tracing::error!("delivery task exited: {:?}", r),
        r = pinger               => tracing::error!("pinger exited: {:?}", r),
        r = registry_printer     => tracing::error!("registry printer exited: {:?}", r),
        r = server_task          => tracing::error!("fallback server exited: {:?}", r),
    }

    if let Some(client) = fallback_client {
        client.shutdown();
    }
    Ok(())
}

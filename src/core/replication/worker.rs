// src/core/replication/worker.rs

//! The replica-side reconnect loop (§4.7.8): resolves the current
//! primary through service discovery, opens a replication transport
//! connection, performs the sync handshake, and streams the apply path.

use futures::{SinkExt, StreamExt};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{info, warn};

use crate::core::replication::manager::ReplicationManager;
use crate::core::replication::transport::{ReplMessage, ReplTransportCodec};

const PRIMARY_SEARCH_RETRIES: u32 = 10;
const PRIMARY_CONNECT_RETRIES: u32 = 5;
const LOOPBACK_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Guards against overlapping connect attempts: at most one in-flight
/// connect per node.
pub struct ReconnectGuard {
    connecting: AtomicBool,
}

impl Default for ReconnectGuard {
    fn default() -> Self {
        Self {
            connecting: AtomicBool::new(false),
        }
    }
}

impl ReconnectGuard {
    /// Returns `true` if this call acquired the guard.
    fn try_acquire(&self) -> bool {
        self.connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn release(&self) {
        self.connecting.store(false, Ordering::SeqCst);
    }
}

/// Spawns the reconnect loop. It wakes on every message sent to `trigger`
/// (role transitions, master-change notifications) and otherwise
/// re-checks every keepalive interval, per the spec's 5 s keepalive
/// probe that resets `connected_to_master` on a dead transport.
pub fn spawn_reconnect_loop(
    manager: Arc<ReplicationManager>,
    mut trigger_rx: mpsc::UnboundedReceiver<()>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    let guard = Arc::new(ReconnectGuard::default());
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                _ = trigger_rx.recv() => {},
                _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => {},
            }

            if manager.is_connected_to_master() {
                continue;
            }
            if !guard.try_acquire() {
                continue;
            }
            let manager = manager.clone();
            let guard2 = guard.clone();
            tokio::spawn(async move {
                if let Err(e) = connect_and_stream(&manager).await {
                    warn!(error = %e, "replica connect/stream cycle failed, will retry");
                }
                manager.set_connected_to_master(false, None);
                guard2.release();
            });
        }
    })
}

async fn connect_and_stream(manager: &Arc<ReplicationManager>) -> anyhow::Result<()> {
    manager.flush_all_for_reconnect();

    let (host, port) = resolve_primary(manager).await?;
    let stream = connect_with_retry(&host, port).await?;
    let mut framed = Framed::new(stream, ReplTransportCodec);

    let self_addr = format!("{}:{}", manager.advertise_host, manager.advertise_port);
    framed.send(ReplMessage::InitiateSync(self_addr)).await?;
    manager.begin_replica_sync();

    match framed.next().await {
        Some(Ok(ReplMessage::FullResync { repl_id, offset })) => {
            info!(repl_id, offset, "full resync accepted");
        }
        Some(Ok(other)) => anyhow::bail!("expected FULLRESYNC, got {other:?}"),
        Some(Err(e)) => return Err(e.into()),
        None => anyhow::bail!("connection closed before handshake completed"),
    }

    manager.set_connected_to_master(true, Some((host.clone(), port)));

    while let Some(msg) = framed.next().await {
        let msg = msg?;
        match msg {
            ReplMessage::Snapshot(blob) => {
                let offset = manager.apply_snapshot(blob)?;
                framed.send(ReplMessage::Ack(offset)).await?;
            }
            ReplMessage::Command(envelope) => {
                let offset = manager.apply_replicated_command(envelope)?;
                framed.send(ReplMessage::Ack(offset)).await?;
            }
            ReplMessage::Heartbeat => {
                framed.send(ReplMessage::Heartbeat).await?;
            }
            other => {
                warn!(?other, "unexpected message on replication stream");
            }
        }
    }

    anyhow::bail!("replication connection to primary closed")
}

async fn resolve_primary(manager: &Arc<ReplicationManager>) -> anyhow::Result<(String, u16)> {
    for attempt in 1..=PRIMARY_SEARCH_RETRIES {
        if let Some(addr) = manager.current_master_address().await {
            if addr.0 != manager.advertise_host || addr.1 != manager.advertise_port {
                return Ok(addr);
            }
        }
        tokio::time::sleep(RETRY_BASE_DELAY * attempt).await;
    }
    anyhow::bail!("could not resolve primary via service discovery")
}

async fn connect_with_retry(host: &str, port: u16) -> anyhow::Result<TcpStream> {
    for attempt in 1..=PRIMARY_CONNECT_RETRIES {
        match TcpStream::connect((host, port)).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                warn!(host, port, attempt, error = %e, "primary connect attempt failed");
                tokio::time::sleep(RETRY_BASE_DELAY * attempt).await;
            }
        }
    }

    // On repeated refusal, also try the loopback alias.
    let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
    for attempt in 1..=LOOPBACK_RETRIES {
        match TcpStream::connect(loopback).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                warn!(%loopback, attempt, error = %e, "loopback connect attempt failed");
                tokio::time::sleep(RETRY_BASE_DELAY * attempt).await;
            }
        }
    }

    anyhow::bail!("exhausted connect retries against {host}:{port}")
}


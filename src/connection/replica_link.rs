// src/connection/replica_link.rs

//! The primary-side half of a replica connection: once a replica is
//! registered (either via a client-port `SYNC`/`PSYNC` handoff or by
//! connecting straight to the protocol port), this loop pumps outbound
//! `ReplMessage`s to the socket and feeds inbound `Ack`s back to the
//! replication manager.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::core::replication::{ReplMessage, ReplTransportCodec};
use crate::core::state::ServerState;

/// Drives one replica connection until it closes or the server shuts
/// down. `framed` already carries any handshake bytes already written
/// (the caller is responsible for having sent the initial `FULLRESYNC`,
/// whichever channel it went out on).
pub async fn run(
    state: Arc<ServerState>,
    client_id: u64,
    addr: SocketAddr,
    mut framed: Framed<TcpStream, ReplTransportCodec>,
    mut transport_rx: mpsc::UnboundedReceiver<ReplMessage>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    info!(%addr, client_id, "replica link established");
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                debug!(%addr, "replica link shutting down");
                break;
            }
            outgoing = transport_rx.recv() => {
                match outgoing {
                    Some(msg) => {
                        if let Err(e) = framed.send(msg).await {
                            warn!(%addr, error = %e, "failed to send to replica, dropping link");
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = framed.next() => {
                match incoming {
                    Some(Ok(ReplMessage::Ack(offset))) => {
                        state.replication.handle_ack(client_id, offset);
                    }
                    Some(Ok(ReplMessage::Heartbeat)) => {}
                    Some(Ok(other)) => {
                        warn!(%addr, ?other, "unexpected message from replica");
                    }
                    Some(Err(e)) => {
                        warn!(%addr, error = %e, "replica link read error");
                        break;
                    }
                    None => {
                        debug!(%addr, "replica link closed by peer");
                        break;
                    }
                }
            }
        }
    }
}

/// Accepts one connection on the protocol port: expects an `InitiateSync`
/// message first, registers the sender as a replica, replies with the
/// `FullResync` handshake, and hands off into `run`.
pub async fn accept_protocol_connection(
    state: Arc<ServerState>,
    client_id: u64,
    addr: SocketAddr,
    stream: TcpStream,
    shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    let mut framed = Framed::new(stream, ReplTransportCodec);

    let peer = match framed.next().await {
        Some(Ok(ReplMessage::InitiateSync(peer_addr))) => peer_addr,
        Some(Ok(other)) => {
            warn!(%addr, ?other, "expected InitiateSync as the first protocol-port message");
            return;
        }
        Some(Err(e)) => {
            warn!(%addr, error = %e, "malformed protocol-port handshake");
            return;
        }
        None => return,
    };

    let (peer_host, peer_port) = match peer.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(addr.port())),
        None => (addr.ip().to_string(), addr.port()),
    };

    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let fullresync = state
        .replication
        .begin_full_resync(client_id, peer_host, peer_port, transport_tx);

    let Some(repl_id) = fullresync.split_ascii_whitespace().nth(1) else {
        warn!("begin_full_resync produced an unparsable FULLRESYNC line");
        return;
    };
    if let Err(e) = framed
        .send(ReplMessage::FullResync {
            repl_id: repl_id.to_string(),
            offset: 0,
        })
        .await
    {
        warn!(%addr, error = %e, "failed to send FULLRESYNC handshake");
        return;
    }

    run(state, client_id, addr, framed, transport_rx, shutdown_rx).await;
}

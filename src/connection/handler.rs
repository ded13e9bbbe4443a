// src/connection/handler.rs

//! Manages the lifecycle of a single client command-port connection:
//! frame decoding, command dispatch, the `SYNC`/`PSYNC` handoff into the
//! replication transport, and the `MASTERINFO` master-change subscription
//! (§4.7.6: a client that asks for the current primary's address is kept
//! registered and pushed every subsequent master-changed notification).

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use super::guard::ConnectionGuard;
use super::replica_link;
use crate::core::command::Command;
use crate::core::dispatcher::{self, DispatchContext};
use crate::core::errors::CoreError;
use crate::core::protocol::frame::{Reply, WireCodec};
use crate::core::replication::ReplTransportCodec;
use crate::core::state::ServerState;

/// Awaits the next value from `rx` if it exists, otherwise never resolves
/// — lets the optional master-info subscription sit as one `select!` arm
/// without a separate "has a subscription" flag controlling the loop.
async fn recv_or_pending(rx: &mut Option<mpsc::UnboundedReceiver<Reply>>) -> Option<Reply> {
    match rx {
        Some(r) => r.recv().await,
        None => std::future::pending().await,
    }
}

pub struct ConnectionHandler {
    framed: Framed<TcpStream, WireCodec>,
    addr: SocketAddr,
    state: Arc<ServerState>,
    client_id: u64,
    shutdown_rx: broadcast::Receiver<()>,
    master_info_rx: Option<mpsc::UnboundedReceiver<Reply>>,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        state: Arc<ServerState>,
        client_id: u64,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            framed: Framed::new(stream, WireCodec),
            addr,
            state,
            client_id,
            shutdown_rx,
            master_info_rx: None,
        }
    }

    pub async fn run(mut self) {
        let mut guard = ConnectionGuard::new(self.state.clone(), self.client_id, self.addr);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    let _ = self.framed.send(Reply::Error("ERR server is shutting down".into())).await;
                    break;
                }
                push = recv_or_pending(&mut self.master_info_rx) => {
                    match push {
                        Some(reply) => {
                            if self.framed.send(reply).await.is_err() {
                                break;
                            }
                        }
                        None => self.master_info_rx = None,
                    }
                }
                result = self.framed.next() => {
                    match result {
                        Some(Ok(frame)) => {
                            match self.handle_frame(frame, &mut guard).await {
                                Ok(true) => continue,
                                Ok(false) => break,
                                Err(e) => {
                                    warn!(addr = %self.addr, error = %e, "connection error");
                                    break;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            let _ = self.framed.send(Reply::Error(e.to_string())).await;
                            break;
                        }
                        None => {
                            debug!(addr = %self.addr, "client closed connection");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Returns `Ok(true)` to keep reading, `Ok(false)` when the
    /// connection is done (closed normally or handed off).
    async fn handle_frame(
        &mut self,
        frame: crate::core::protocol::frame::RespFrame,
        guard: &mut ConnectionGuard,
    ) -> Result<bool, crate::core::errors::CoreError> {
        let cmd = match Command::from_frame(frame, self.client_id) {
            Ok(cmd) => cmd,
            Err(e) => {
                self.framed.send(Reply::Error(e.to_string())).await?;
                return Ok(true);
            }
        };

        if cmd.name == "MASTERINFO" {
            return self.handle_master_info().await;
        }

        let is_sync = matches!(cmd.name.as_str(), "SYNC" | "PSYNC");
        let (transport_tx, transport_rx) = if is_sync {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let ctx = DispatchContext {
            peer_addr: self.addr,
            replica_transport_tx: transport_tx,
        };
        let reply = dispatcher::dispatch(cmd, &self.state, &ctx);
        self.framed.send(reply.clone()).await?;

        if is_sync && matches!(&reply, Reply::Status(s) if s.starts_with("FULLRESYNC")) {
            self.framed.flush().await?;
            guard.set_handed_off();
            self.hand_off_to_replica_link(transport_rx.expect("sync always allocates a channel"))
                .await;
            return Ok(false);
        }

        Ok(true)
    }

    /// Handles the "get-master-info" request (§4.7.6): replies with the
    /// current primary's address and registers this connection to
    /// receive a push every time the primary subsequently changes.
    async fn handle_master_info(&mut self) -> Result<bool, CoreError> {
        let session = self.state.sessions.get(self.client_id);
        if self.state.config.password.is_some() && !session.authenticated {
            self.framed
                .send(Reply::Error(CoreError::AuthRequired.to_string()))
                .await?;
            return Ok(true);
        }

        let reply = match self.state.replication.current_master_address().await {
            Some((host, port)) => Reply::from_bytes(format!("{host}:{port}")),
            None => Reply::nil(),
        };
        self.framed.send(reply).await?;
        self.master_info_rx = Some(self.state.replication.subscribe_master_info(self.client_id));
        Ok(true)
    }

    async fn hand_off_to_replica_link(
        self,
        transport_rx: mpsc::UnboundedReceiver<crate::core::replication::ReplMessage>,
    ) {
        let addr = self.addr;
        let client_id = self.client_id;
        let state = self.state.clone();
        let shutdown_rx = self.shutdown_rx.resubscribe();
        let stream = self.framed.into_inner();
        let framed = Framed::new(stream, ReplTransportCodec);
        replica_link::run(state, client_id, addr, framed, transport_rx, shutdown_rx).await;
    }
}

// src/server/context.rs

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::core::state::ServerState;

/// Holds all the initialized state required to run the server's main
/// loops. Two listeners: the client command port and the replication
/// protocol port (§4.7.8 — always distinct).
pub struct ServerContext {
    pub state: Arc<ServerState>,
    pub client_listener: TcpListener,
    pub protocol_listener: TcpListener,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<()>,
}

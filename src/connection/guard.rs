// src/connection/guard.rs

//! An RAII guard ensuring a client's session-table entry and client-info
//! record are cleaned up exactly once, however the connection task exits.

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

use crate::core::metrics;
use crate::core::state::ServerState;

pub struct ConnectionGuard {
    state: Arc<ServerState>,
    client_id: u64,
    addr: SocketAddr,
    /// Set when the connection is handed off to the replication link loop
    /// after a `SYNC`/`PSYNC`; cleanup then belongs to that loop instead.
    handed_off: bool,
}

impl ConnectionGuard {
    pub fn new(state: Arc<ServerState>, client_id: u64, addr: SocketAddr) -> Self {
        metrics::CONNECTIONS_ACCEPTED.inc();
        metrics::CONNECTIONS_ACTIVE.inc();
        state.register_client(client_id, addr);
        Self {
            state,
            client_id,
            addr,
            handed_off: false,
        }
    }

    pub fn set_handed_off(&mut self) {
        self.handed_off = true;
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        metrics::CONNECTIONS_ACTIVE.dec();
        if self.handed_off {
            debug!(addr = %self.addr, "connection handed off, skipping client-map cleanup");
            return;
        }
        debug!(addr = %self.addr, client_id = self.client_id, "cleaning up connection");
        self.state.deregister_client(self.client_id);
    }
}

// src/core/state.rs

//! `ServerState`: the single struct threaded through every connection and
//! background task. Trimmed from the teacher's `core::state` module
//! family down to what this core actually needs — no cache/persistence
//! sub-states, since those concerns belong to the external engine.

use dashmap::{DashMap, DashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::config::Config;
use crate::core::discovery::ServiceRegistry;
use crate::core::engine::Engine;
use crate::core::replication::ReplicationManager;
use crate::core::role::RoleManager;
use crate::core::session::SessionTable;

/// What's known about one live client connection, independent of the
/// per-command `Session` (authentication/db-index) tracked separately.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub addr: SocketAddr,
    pub client_id: u64,
    pub name: Option<String>,
    pub created: Instant,
}

pub type ClientMap = Arc<DashMap<u64, ClientInfo>>;

/// Process-lifetime counters surfaced through `INFO`.
#[derive(Debug, Default)]
pub struct StatsState {
    pub total_connections: AtomicU64,
    pub total_commands: AtomicU64,
}

impl StatsState {
    pub fn record_connection(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command(&self) {
        self.total_commands.fetch_add(1, Ordering::Relaxed);
    }
}

/// The central, `Arc`-wrapped bag of shared state. Every connection task
/// and every background task holds a clone of the `Arc`.
pub struct ServerState {
    pub config: Config,
    pub engine: Arc<dyn Engine>,
    pub role_manager: Arc<RoleManager>,
    pub discovery: Arc<dyn ServiceRegistry>,
    pub replication: Arc<ReplicationManager>,
    pub sessions: Arc<SessionTable>,
    pub clients: ClientMap,
    pub live_client_ids: Arc<DashSet<u64>>,
    pub stats: Arc<StatsState>,
    pub start_time: Instant,
    next_client_id: AtomicU64,
}

impl ServerState {
    pub fn new(
        config: Config,
        engine: Arc<dyn Engine>,
        role_manager: Arc<RoleManager>,
        discovery: Arc<dyn ServiceRegistry>,
        replication: Arc<ReplicationManager>,
    ) -> Self {
        Self {
            config,
            engine,
            role_manager,
            discovery,
            replication,
            sessions: Arc::new(SessionTable::new()),
            clients: Arc::new(DashMap::new()),
            live_client_ids: Arc::new(DashSet::new()),
            stats: Arc::new(StatsState::default()),
            start_time: Instant::now(),
            next_client_id: AtomicU64::new(1),
        }
    }

    pub fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register_client(&self, client_id: u64, addr: SocketAddr) {
        self.live_client_ids.insert(client_id);
        self.clients.insert(
            client_id,
            ClientInfo {
                addr,
                client_id,
                name: None,
                created: Instant::now(),
            },
        );
        self.sessions.create(client_id);
        self.stats.record_connection();
    }

    pub fn deregister_client(&self, client_id: u64) {
        self.live_client_ids.remove(&client_id);
        self.clients.remove(&client_id);
        self.sessions.remove(client_id);
    }

    pub fn connected_clients(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::discovery::InMemoryServiceRegistry;
    use crate::core::engine::InMemoryEngine;
    use crate::core::role::InMemoryElectionClient;
    use std::net::{IpAddr, Ipv4Addr};

    fn make_state() -> ServerState {
        let config = Config::default();
        let engine = Arc::new(InMemoryEngine::new(config.databases));
        let election = Arc::new(InMemoryElectionClient::new(true));
        let role_manager = Arc::new(RoleManager::new(election));
        let discovery = Arc::new(InMemoryServiceRegistry::new());
        let replication = Arc::new(ReplicationManager::new(
            engine.clone(),
            role_manager.clone(),
            discovery.clone(),
            config.node_id.clone(),
            config.host.clone(),
            config.port,
            config.protocol_port,
        ));
        ServerState::new(config, engine, role_manager, discovery, replication)
    }

    #[test]
    fn register_then_deregister_round_trips() {
        let state = make_state();
        let id = state.next_client_id();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1234);
        state.register_client(id, addr);
        assert_eq!(state.connected_clients(), 1);
        assert!(state.sessions.contains(id));
        state.deregister_client(id);
        assert_eq!(state.connected_clients(), 0);
        assert!(!state.sessions.contains(id));
    }

    #[test]
    fn client_ids_increase_monotonically() {
        let state = make_state();
        let a = state.next_client_id();
        let b = state.next_client_id();
        assert!(b > a);
    }
}

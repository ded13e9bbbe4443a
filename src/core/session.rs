// src/core/session.rs

//! The session table (C3): per-connection authentication and
//! logical-database state, keyed by client id.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Per-connection state. Created on accept, removed on disconnect (either
/// synchronously by the connection's own guard, or by the periodic
/// sweeper if that path is skipped).
#[derive(Debug, Clone, Copy)]
pub struct Session {
    pub authenticated: bool,
    pub db_index: usize,
}

impl Default for Session {
    fn default() -> Self {
        Session {
            authenticated: false,
            db_index: 0,
        }
    }
}

/// How often the session sweeper runs.
pub const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// The live session table plus the set of currently-connected client ids,
/// so the sweeper can tell a stale session from a live one without
/// depending on the connection layer directly.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: DashMap<u64, Session>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, client_id: u64) {
        self.sessions.insert(client_id, Session::default());
    }

    pub fn remove(&self, client_id: u64) {
        self.sessions.remove(&client_id);
    }

    pub fn get(&self, client_id: u64) -> Session {
        self.sessions
            .get(&client_id)
            .map(|s| *s)
            .unwrap_or_default()
    }

    pub fn set_authenticated(&self, client_id: u64, authenticated: bool) {
        self.sessions
            .entry(client_id)
            .or_default()
            .authenticated = authenticated;
    }

    pub fn set_db_index(&self, client_id: u64, db_index: usize) {
        self.sessions.entry(client_id).or_default().db_index = db_index;
    }

    pub fn contains(&self, client_id: u64) -> bool {
        self.sessions.contains_key(&client_id)
    }

    /// Removes every session whose client id is not in `live_ids`.
    pub fn sweep(&self, live_ids: &dashmap::DashSet<u64>) {
        let stale: Vec<u64> = self
            .sessions
            .iter()
            .map(|e| *e.key())
            .filter(|id| !live_ids.contains(id))
            .collect();
        for id in stale {
            debug!(client_id = id, "sweeping stale session");
            self.sessions.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Spawns the periodic session sweeper. Runs until `shutdown_rx` fires.
pub fn spawn_sweeper(
    sessions: Arc<SessionTable>,
    live_ids: Arc<dashmap::DashSet<u64>>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => sessions.sweep(&live_ids),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_removes_only_dead_sessions() {
        let table = SessionTable::new();
        table.create(1);
        table.create(2);
        let live = dashmap::DashSet::new();
        live.insert(1);
        table.sweep(&live);
        assert!(table.contains(1));
        assert!(!table.contains(2));
    }

    #[test]
    fn new_connection_with_same_id_starts_unauthenticated() {
        let table = SessionTable::new();
        table.create(7);
        table.set_authenticated(7, true);
        table.remove(7);
        table.create(7);
        assert!(!table.get(7).authenticated);
    }
}

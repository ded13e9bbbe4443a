// src/core/role.rs

//! The role manager (C4): tracks this node's role, driven by an injected
//! election client, and notifies listeners on transition.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

/// How often the role manager re-samples the election client to recover
/// from a missed watch event.
pub const ROLE_RECHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    None,
    Primary,
    Replica,
}

/// External collaborator answering "am I the elected leader?". Backed by
/// whatever consensus store the deployment uses; this crate only depends
/// on the trait.
#[async_trait]
pub trait ElectionClient: Send + Sync {
    async fn is_leader(&self) -> bool;
}

/// A election client for standalone operation and tests: a shared flag a
/// caller can flip directly, with no external dependency.
#[derive(Debug, Default)]
pub struct InMemoryElectionClient {
    leader: AtomicBool,
}

impl InMemoryElectionClient {
    pub fn new(is_leader: bool) -> Self {
        Self {
            leader: AtomicBool::new(is_leader),
        }
    }

    pub fn set_leader(&self, is_leader: bool) {
        self.leader.store(is_leader, Ordering::SeqCst);
    }
}

#[async_trait]
impl ElectionClient for InMemoryElectionClient {
    async fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }
}

type Listener = Box<dyn Fn(Role, Role) + Send + Sync>;

/// Maintains the current role and announces transitions to registered
/// listeners. Listeners are invoked outside the internal lock so they may
/// themselves call back into the role manager.
pub struct RoleManager {
    role: RwLock<Role>,
    election: Arc<dyn ElectionClient>,
    listeners: RwLock<Vec<Listener>>,
}

impl RoleManager {
    pub fn new(election: Arc<dyn ElectionClient>) -> Self {
        Self {
            role: RwLock::new(Role::None),
            election,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn role(&self) -> Role {
        *self.role.read()
    }

    pub fn on_transition(&self, listener: impl Fn(Role, Role) + Send + Sync + 'static) {
        self.listeners.write().push(Box::new(listener));
    }

    fn transition_to(&self, new_role: Role) {
        let old_role = {
            let mut role = self.role.write();
            if *role == new_role {
                return;
            }
            let old = *role;
            *role = new_role;
            old
        };
        info!(?old_role, ?new_role, "role transition");
        for listener in self.listeners.read().iter() {
            listener(old_role, new_role);
        }
    }

    /// Re-samples the election client and transitions if the observed
    /// leadership state disagrees with the current role.
    pub async fn recheck(&self) {
        let is_leader = self.election.is_leader().await;
        let desired = if is_leader { Role::Primary } else { Role::Replica };
        if self.role() != desired {
            self.transition_to(desired);
        }
    }

    /// Manual override for SLAVEOF-style reconfiguration. A no-op if `r`
    /// is already the current role.
    pub fn set_role(&self, r: Role) {
        self.transition_to(r);
    }
}

/// Spawns the periodic role re-check task. Runs until `shutdown_rx` fires.
pub fn spawn_role_recheck(
    manager: Arc<RoleManager>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ROLE_RECHECK_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => manager.recheck().await,
            }
        }
    })
}

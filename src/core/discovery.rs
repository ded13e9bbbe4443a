// src/core/discovery.rs

//! The service discovery adapter (C6): registers this node, finds the
//! current primary, and fans out master-change notifications.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::core::errors::CoreError;

/// A node's registration record. `is_master` MUST be the field consumers
/// key selection on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub protocol_port: u16,
    pub is_master: bool,
    pub node_id: String,
}

impl ServiceInfo {
    /// Service id is derived deterministically so the registry does not
    /// leak entries across restarts: `"{node_id}-cache"` when configured,
    /// else `"{host}:{port}"`.
    pub fn derive_id(node_id: &Option<String>, host: &str, port: u16) -> String {
        match node_id {
            Some(id) if !id.is_empty() => format!("{id}-cache"),
            _ => format!("{host}:{port}"),
        }
    }
}

type MasterChangeCallback = Box<dyn Fn(ServiceInfo) + Send + Sync>;

/// External collaborator wrapping the deployment's service registry
/// (etcd/consul/similar). This crate depends only on the trait; the
/// concrete backend is an integrator's concern.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn register(&self, info: ServiceInfo) -> Result<(), CoreError>;
    async fn deregister(&self, service_id: &str) -> Result<(), CoreError>;
    async fn find_master(&self) -> Option<ServiceInfo>;
    /// Restart-safe: calling this twice retains only the latest callback
    /// and establishes only one underlying watch.
    fn watch_master_change(&self, callback: MasterChangeCallback);
}

/// An in-process registry for standalone operation and tests. Suppresses
/// duplicate master-changed notifications when host/port did not change.
#[derive(Default)]
pub struct InMemoryServiceRegistry {
    entries: DashMap<String, ServiceInfo>,
    callback: Mutex<Option<MasterChangeCallback>>,
    last_master: Mutex<Option<(String, u16)>>,
}

impl InMemoryServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify_if_master_changed(&self, info: &ServiceInfo) {
        if !info.is_master {
            return;
        }
        let mut last = self.last_master.lock();
        let changed_key = (info.host.clone(), info.port);
        if last.as_ref() == Some(&changed_key) {
            return;
        }
        *last = Some(changed_key);
        drop(last);
        if let Some(cb) = self.callback.lock().as_ref() {
            cb(info.clone());
        }
    }
}

#[async_trait]
impl ServiceRegistry for InMemoryServiceRegistry {
    async fn register(&self, info: ServiceInfo) -> Result<(), CoreError> {
        self.entries.insert(info.id.clone(), info.clone());
        self.notify_if_master_changed(&info);
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<(), CoreError> {
        self.entries.remove(service_id);
        Ok(())
    }

    async fn find_master(&self) -> Option<ServiceInfo> {
        self.entries.iter().find(|e| e.is_master).map(|e| e.clone())
    }

    fn watch_master_change(&self, callback: MasterChangeCallback) {
        *self.callback.lock() = Some(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn info(host: &str, port: u16, is_master: bool) -> ServiceInfo {
        ServiceInfo {
            id: ServiceInfo::derive_id(&None, host, port),
            host: host.into(),
            port,
            protocol_port: port + 1,
            is_master,
            node_id: "node".into(),
        }
    }

    #[test]
    fn service_id_prefers_node_id() {
        assert_eq!(
            ServiceInfo::derive_id(&Some("abc".into()), "10.0.0.1", 6379),
            "abc-cache"
        );
        assert_eq!(
            ServiceInfo::derive_id(&None, "10.0.0.1", 6379),
            "10.0.0.1:6379"
        );
    }

    #[tokio::test]
    async fn find_master_scans_for_is_master_flag() {
        let registry = InMemoryServiceRegistry::new();
        registry.register(info("a", 1, false)).await.unwrap();
        registry.register(info("b", 2, true)).await.unwrap();
        let master = registry.find_master().await.unwrap();
        assert_eq!(master.host, "b");
    }

    #[tokio::test]
    async fn duplicate_host_port_suppressed() {
        let registry = InMemoryServiceRegistry::new();
        let count = Arc::new(AtomicU32::new(0));
        let count2 = count.clone();
        registry.watch_master_change(Box::new(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        registry.register(info("b", 2, true)).await.unwrap();
        registry.register(info("b", 2, true)).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        registry.register(info("c", 3, true)).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}

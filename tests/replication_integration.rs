// tests/replication_integration.rs

//! Black-box integration coverage for the end-to-end scenarios in the
//! replication design: a primary and replica `ReplicationManager` wired
//! together over channels standing in for the replication transport,
//! exercising snapshot bootstrap, command propagation, idempotent
//! re-delivery, and failover promotion exactly as a real two-node
//! deployment would observe them.

use bytes::Bytes;
use cachecore::core::discovery::InMemoryServiceRegistry;
use cachecore::core::engine::{Engine, InMemoryEngine};
use cachecore::core::replication::{ReplMessage, ReplicationManager};
use cachecore::core::role::{InMemoryElectionClient, Role, RoleManager};
use cachecore::core::command::Command;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn make_node(
    role: Role,
    host: &str,
    port: u16,
) -> (Arc<ReplicationManager>, Arc<InMemoryEngine>, Arc<RoleManager>) {
    let engine = Arc::new(InMemoryEngine::new(16));
    let election = Arc::new(InMemoryElectionClient::new(role == Role::Primary));
    let role_manager = Arc::new(RoleManager::new(election));
    role_manager.set_role(role);
    let discovery = Arc::new(InMemoryServiceRegistry::new());
    let manager = Arc::new(ReplicationManager::new(
        engine.clone(),
        role_manager.clone(),
        discovery,
        None,
        host.to_string(),
        port,
        port + 10000,
    ));
    (manager, engine, role_manager)
}

fn set_command(key: &str, value: &str) -> Command {
    Command {
        name: "SET".into(),
        args: vec![Bytes::copy_from_slice(key.as_bytes()), Bytes::copy_from_slice(value.as_bytes())],
        client_id: 1,
        db_index: 0,
        reply_tx: None,
    }
}

/// Pumps every message the primary sends to `client_id`'s transport
/// channel into the replica manager, mirroring what `replica_link`/the
/// reconnect worker do over a real socket, and returns once the channel
/// is drained (the test drives the handshake manually, not in a loop).
async fn drain_to_replica(rx: &mut mpsc::UnboundedReceiver<ReplMessage>, replica: &ReplicationManager) {
    while let Ok(msg) = rx.try_recv() {
        match msg {
            ReplMessage::Snapshot(blob) => {
                replica.apply_snapshot(blob).unwrap();
            }
            ReplMessage::Command(envelope) => {
                replica.apply_replicated_command(envelope).unwrap();
            }
            other => panic!("unexpected message on primary->replica channel: {other:?}"),
        }
    }
}

#[tokio::test]
async fn two_node_replication_of_a_single_set() {
    let (primary, primary_engine, _) = make_node(Role::Primary, "127.0.0.1", 7001);
    let (replica, replica_engine, _) = make_node(Role::Replica, "127.0.0.1", 7002);

    let (tx, mut rx) = mpsc::unbounded_channel();
    primary.begin_full_resync(1, "127.0.0.1".into(), 7002, tx);
    // Nothing written yet: drain the (empty) snapshot handshake first.
    tokio::time::sleep(Duration::from_millis(10)).await;
    drain_to_replica(&mut rx, &replica).await;

    primary.handle_replicated_command(&set_command("k", "v"));
    drain_to_replica(&mut rx, &replica).await;

    assert_eq!(
        replica_engine.dispatch(0, "GET", &[Bytes::from_static(b"k")]).unwrap(),
        primary_engine.dispatch(0, "GET", &[Bytes::from_static(b"k")]).unwrap(),
    );
    assert_eq!(replica.master_offset(), primary.master_offset());
}

#[tokio::test]
async fn snapshot_bootstrap_of_a_hundred_keys() {
    let (primary, primary_engine, _) = make_node(Role::Primary, "127.0.0.1", 7003);
    let (replica, replica_engine, _) = make_node(Role::Replica, "127.0.0.1", 7004);

    for i in 0..100 {
        primary_engine
            .dispatch(
                0,
                "SET",
                &[
                    Bytes::from(format!("key_{i}")),
                    Bytes::from(format!("value_{i}")),
                ],
            )
            .unwrap();
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    primary.begin_full_resync(2, "127.0.0.1".into(), 7004, tx);
    tokio::time::sleep(Duration::from_millis(20)).await;
    drain_to_replica(&mut rx, &replica).await;

    assert_eq!(replica_engine.dbsize(0), 100);
    assert_eq!(
        replica_engine.dispatch(0, "GET", &[Bytes::from_static(b"key_42")]).unwrap(),
        primary_engine.dispatch(0, "GET", &[Bytes::from_static(b"key_42")]).unwrap(),
    );
}

#[tokio::test]
async fn duplicate_envelope_delivery_is_idempotent() {
    let (replica, replica_engine, _) = make_node(Role::Replica, "127.0.0.1", 7005);

    let cmd = Command {
        name: "INCR".into(),
        args: vec![Bytes::from_static(b"counter")],
        client_id: 1,
        db_index: 0,
        reply_tx: None,
    };
    let envelope = cachecore::core::replication::ReplCommand {
        db_index: 0,
        offset: 0,
        command: cmd.wire_bytes(),
    };

    let first = replica.apply_replicated_command(envelope.clone()).unwrap();
    let second = replica.apply_replicated_command(envelope).unwrap();

    assert_eq!(first, second);
    assert_eq!(
        replica_engine.dispatch(0, "GET", &[Bytes::from_static(b"counter")]).unwrap(),
        cachecore::core::protocol::frame::Reply::Bulk(Some(Bytes::from_static(b"1"))),
    );
}

#[tokio::test]
async fn failover_promotion_rotates_id_and_publishes_master_change() {
    let (node, _, role_manager) = make_node(Role::Replica, "127.0.0.1", 7006);
    node.install_role_listener();
    let old_id = node.replication_id();

    let mut rx = node.subscribe_master_info(9);
    role_manager.set_role(Role::Primary);
    node.publish_master_change("127.0.0.1", 7006);

    assert_ne!(node.replication_id(), old_id);
    let push = rx.try_recv().expect("expected a master-changed push");
    match push {
        cachecore::core::protocol::frame::Reply::Array(items) => {
            assert_eq!(items.len(), 2);
        }
        other => panic!("expected an array push, got {other:?}"),
    }
}

#[tokio::test]
async fn replica_rejects_writes_end_to_end() {
    use cachecore::config::Config;
    use cachecore::core::dispatcher::{self, DispatchContext};
    use cachecore::core::state::ServerState;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    let (replica, engine, role_manager) = make_node(Role::Replica, "127.0.0.1", 7007);
    let discovery = Arc::new(InMemoryServiceRegistry::new());
    let state = ServerState::new(Config::default(), engine.clone(), role_manager, discovery, replica);
    state.register_client(1, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4444));

    let ctx = DispatchContext {
        peer_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4444),
        replica_transport_tx: None,
    };
    let reply = dispatcher::dispatch(set_command("k", "v"), &state, &ctx);
    assert_eq!(
        reply,
        cachecore::core::protocol::frame::Reply::Error(
            "ERR can't write against a read only slave".into()
        )
    );
    assert_eq!(engine.dbsize(0), 0);
}

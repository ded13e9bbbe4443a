// src/core/interceptor.rs

//! The command interceptor (C8): the pre-dispatch filter that rejects
//! writes on a replica, routes replication-control commands to the
//! replication manager, and feeds primary-side writes into propagation.

use std::net::SocketAddr;
use tokio::sync::mpsc;

use crate::core::command::Command;
use crate::core::errors::CoreError;
use crate::core::protocol::frame::Reply;
use crate::core::replication::ReplMessage;
use crate::core::role::Role;
use crate::core::state::ServerState;

/// Carries what the connection layer already knows about the peer
/// issuing a `SYNC`/`PSYNC`: its advertised address and the outbound
/// channel the connection handler will pump replication messages
/// through once it hands the socket over to the replication transport.
pub struct SyncContext {
    pub addr: SocketAddr,
    pub transport_tx: mpsc::UnboundedSender<ReplMessage>,
}

/// `true` if `cmd` must go through `process` rather than straight to the
/// engine.
pub fn should_intercept(cmd: &Command, role: Role, state: &ServerState) -> bool {
    let name = cmd.name.as_str();
    if crate::core::command::is_replication_control(name) {
        return true;
    }
    if cmd.is_write() && role != Role::Primary {
        return true;
    }
    if role == Role::Primary && state.replication.should_replicate(cmd) {
        return true;
    }
    false
}

/// Runs the interceptor. Returns `Some(reply)` when the command is fully
/// handled here; `None` means "continue to the engine" (the primary
/// write-propagation path always falls into this case).
pub fn process(
    cmd: &Command,
    state: &ServerState,
    sync_ctx: Option<SyncContext>,
) -> Option<Reply> {
    match cmd.name.as_str() {
        "REPLCONF" => Some(process_replconf(cmd, state)),
        "SYNC" | "PSYNC" => Some(process_sync(cmd, state, sync_ctx)),
        _ => {
            if cmd.is_write() {
                let role = state.role_manager.role();
                if role != Role::Primary {
                    return Some(Reply::Error(CoreError::ReadOnlyReplica.to_string()));
                }
                state.replication.handle_replicated_command(cmd);
                None
            } else {
                None
            }
        }
    }
}

fn process_replconf(cmd: &Command, state: &ServerState) -> Reply {
    let sub = cmd
        .args
        .first()
        .map(|b| String::from_utf8_lossy(b).to_ascii_uppercase())
        .unwrap_or_default();

    match sub.as_str() {
        "LISTENING-PORT" => match cmd.args.get(1).and_then(|b| std::str::from_utf8(b).ok()) {
            Some(port_str) => match port_str.parse::<u16>() {
                Ok(port) => {
                    state.replication.record_listening_port(cmd.client_id, port);
                    Reply::ok()
                }
                Err(_) => Reply::Error(CoreError::Protocol("invalid listening port".into()).to_string()),
            },
            None => Reply::Error(CoreError::WrongArgumentCount("REPLCONF".into()).to_string()),
        },
        "ACK" => match cmd.args.get(1).and_then(|b| std::str::from_utf8(b).ok()) {
            Some(offset_str) => match offset_str.parse::<i64>() {
                Ok(offset) => {
                    state.replication.handle_ack(cmd.client_id, offset);
                    Reply::ok()
                }
                Err(_) => Reply::Error(CoreError::Protocol("invalid ack offset".into()).to_string()),
            },
            None => Reply::Error(CoreError::WrongArgumentCount("REPLCONF".into()).to_string()),
        },
        _ => Reply::Error(CoreError::Protocol(format!("unknown REPLCONF subcommand '{sub}'")).to_string()),
    }
}

fn process_sync(cmd: &Command, state: &ServerState, sync_ctx: Option<SyncContext>) -> Reply {
    let Some(ctx) = sync_ctx else {
        return Reply::Error(
            CoreError::Internal("SYNC requires an established replication transport".into())
                .to_string(),
        );
    };
    let fullresync = state.replication.begin_full_resync(
        cmd.client_id,
        ctx.addr.ip().to_string(),
        ctx.addr.port(),
        ctx.transport_tx,
    );
    Reply::Status(fullresync)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::discovery::InMemoryServiceRegistry;
    use crate::core::engine::InMemoryEngine;
    use crate::core::replication::ReplicationManager;
    use crate::core::role::InMemoryElectionClient;
    use crate::core::role::RoleManager;
    use bytes::Bytes;
    use std::sync::Arc;

    fn make_state(role: Role) -> ServerState {
        let config = crate::config::Config::default();
        let engine = Arc::new(InMemoryEngine::new(16));
        let election = Arc::new(InMemoryElectionClient::new(role == Role::Primary));
        let role_manager = Arc::new(RoleManager::new(election));
        role_manager.set_role(role);
        let discovery = Arc::new(InMemoryServiceRegistry::new());
        let replication = Arc::new(ReplicationManager::new(
            engine.clone(),
            role_manager.clone(),
            discovery.clone(),
            None,
            "127.0.0.1".into(),
            6379,
            16379,
        ));
        ServerState::new(config, engine, role_manager, discovery, replication)
    }

    fn set_command() -> Command {
        Command {
            name: "SET".into(),
            args: vec![Bytes::from_static(b"k"), Bytes::from_static(b"v")],
            client_id: 1,
            db_index: 0,
            reply_tx: None,
        }
    }

    #[test]
    fn write_on_replica_is_rejected() {
        let state = make_state(Role::Replica);
        let cmd = set_command();
        assert!(should_intercept(&cmd, Role::Replica, &state));
        let reply = process(&cmd, &state, None).unwrap();
        assert_eq!(reply, Reply::Error(CoreError::ReadOnlyReplica.to_string()));
    }

    #[test]
    fn write_on_primary_continues_to_engine() {
        let state = make_state(Role::Primary);
        let cmd = set_command();
        assert!(!should_intercept(&cmd, Role::Primary, &state));
        assert_eq!(process(&cmd, &state, None), None);
    }

    #[test]
    fn replconf_listening_port_replies_ok() {
        let state = make_state(Role::Primary);
        let cmd = Command {
            name: "REPLCONF".into(),
            args: vec![Bytes::from_static(b"LISTENING-PORT"), Bytes::from_static(b"6380")],
            client_id: 5,
            db_index: 0,
            reply_tx: None,
        };
        assert!(should_intercept(&cmd, Role::Primary, &state));
        assert_eq!(process(&cmd, &state, None), Some(Reply::ok()));
    }

    #[test]
    fn sync_without_context_errors() {
        let state = make_state(Role::Primary);
        let cmd = Command {
            name: "SYNC".into(),
            args: vec![],
            client_id: 9,
            db_index: 0,
            reply_tx: None,
        };
        let reply = process(&cmd, &state, None).unwrap();
        assert!(matches!(reply, Reply::Error(_)));
    }
}

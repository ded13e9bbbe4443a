// src/core/dispatcher.rs

//! The dispatcher (C9): assembles the wire codec, command value, session
//! table and interceptor, and hands whatever is left to the engine.

use std::net::SocketAddr;
use tokio::sync::mpsc;

use crate::core::command::Command;
use crate::core::errors::CoreError;
use crate::core::interceptor::{self, SyncContext};
use crate::core::metrics;
use crate::core::protocol::frame::Reply;
use crate::core::replication::ReplMessage;
use crate::core::role::Role;
use crate::core::state::ServerState;

/// Extra, connection-supplied context a handful of commands need: the
/// peer address (for `SYNC`/`PSYNC`) and an outbound replication-message
/// channel the connection will switch to pumping once promoted to a
/// replica link.
pub struct DispatchContext {
    pub peer_addr: SocketAddr,
    pub replica_transport_tx: Option<mpsc::UnboundedSender<ReplMessage>>,
}

/// Handles one command end to end and returns the reply to send on the
/// wire. Never returns `Err`: every failure path is folded into a
/// `Reply::Error` so the caller only has to write the reply and loop.
pub fn dispatch(mut cmd: Command, state: &ServerState, ctx: &DispatchContext) -> Reply {
    metrics::COMMANDS_PROCESSED.inc();
    state.stats.record_command();

    let session = state.sessions.get(cmd.client_id);
    cmd.db_index = session.db_index;

    let requires_auth = state.config.password.is_some();

    match cmd.name.as_str() {
        "AUTH" => return handle_auth(&cmd, state),
        "PING" => {
            if requires_auth && !session.authenticated {
                return Reply::Error(CoreError::AuthRequired.to_string());
            }
            return match cmd.args.first() {
                Some(msg) => Reply::Bulk(Some(msg.clone())),
                None => Reply::Status("PONG".into()),
            };
        }
        _ => {}
    }

    if requires_auth && !session.authenticated {
        return Reply::Error(CoreError::AuthRequired.to_string());
    }

    let role = state.role_manager.role();
    if role == Role::None {
        return Reply::Error(CoreError::Internal("node has no assigned role yet".into()).to_string());
    }

    match cmd.name.as_str() {
        "SELECT" => return handle_select(&cmd, state),
        "ROLE" => return handle_role(state),
        "INFO" => return handle_info(state),
        "SLAVEOF" => return handle_slaveof(&cmd, state),
        _ => {}
    }

    if interceptor::should_intercept(&cmd, role, state) {
        let sync_ctx = if matches!(cmd.name.as_str(), "SYNC" | "PSYNC") {
            ctx.replica_transport_tx.clone().map(|tx| SyncContext {
                addr: ctx.peer_addr,
                transport_tx: tx,
            })
        } else {
            None
        };
        if let Some(reply) = interceptor::process(&cmd, state, sync_ctx) {
            return reply;
        }
    }

    if cmd.name == "FLUSHALL" {
        state.engine.flush_all();
        return Reply::ok();
    }

    match state.engine.dispatch(cmd.db_index, &cmd.name, &cmd.args) {
        Ok(reply) => reply,
        Err(e) => Reply::Error(e.to_string()),
    }
}

fn handle_auth(cmd: &Command, state: &ServerState) -> Reply {
    let Some(supplied) = cmd.args.first() else {
        return Reply::Error(CoreError::WrongArgumentCount("AUTH".into()).to_string());
    };
    match &state.config.password {
        None => Reply::Error(CoreError::NoPasswordSet.to_string()),
        Some(expected) => {
            if supplied.as_ref() == expected.as_bytes() {
                state.sessions.set_authenticated(cmd.client_id, true);
                Reply::ok()
            } else {
                Reply::Error(CoreError::InvalidPassword.to_string())
            }
        }
    }
}

fn handle_select(cmd: &Command, state: &ServerState) -> Reply {
    let Some(arg) = cmd.args.first() else {
        return Reply::Error(CoreError::WrongArgumentCount("SELECT".into()).to_string());
    };
    let index: usize = match std::str::from_utf8(arg).ok().and_then(|s| s.parse().ok()) {
        Some(i) => i,
        None => return Reply::Error(CoreError::Protocol("invalid DB index".into()).to_string()),
    };
    if index >= state.config.databases {
        return Reply::Error(CoreError::Protocol("DB index is out of range".into()).to_string());
    }
    state.sessions.set_db_index(cmd.client_id, index);
    Reply::ok()
}

fn handle_role(state: &ServerState) -> Reply {
    let role = state.role_manager.role();
    let offset = state.replication.master_offset();
    let role_name = match role {
        Role::Primary => "master",
        Role::Replica => "slave",
        Role::None => "none",
    };
    Reply::Array(vec![
        Reply::from_bytes(role_name),
        Reply::Integer(offset),
    ])
}

fn handle_info(state: &ServerState) -> Reply {
    let role = state.role_manager.role();
    let role_name = match role {
        Role::Primary => "master",
        Role::Replica => "slave",
        Role::None => "none",
    };
    let text = format!(
        "# Replication\r\n\
         role:{role_name}\r\n\
         master_offset:{}\r\n\
         replication_id:{}\r\n\
         connected_clients:{}\r\n\
         uptime_in_seconds:{}\r\n",
        state.replication.master_offset(),
        state.replication.replication_id(),
        state.connected_clients(),
        state.start_time.elapsed().as_secs(),
    );
    Reply::from_bytes(text)
}

fn handle_slaveof(cmd: &Command, state: &ServerState) -> Reply {
    let (Some(host), Some(port)) = (cmd.args.first(), cmd.args.get(1)) else {
        return Reply::Error(CoreError::WrongArgumentCount("SLAVEOF".into()).to_string());
    };
    let host_str = String::from_utf8_lossy(host).to_string();
    let port_str = String::from_utf8_lossy(port).to_string();

    if host_str.eq_ignore_ascii_case("no") && port_str.eq_ignore_ascii_case("one") {
        state.replication.skip_next_replication_id_regen();
        state.role_manager.set_role(Role::Primary);
        return Reply::ok();
    }

    let port: u16 = match port_str.parse() {
        Ok(p) => p,
        Err(_) => return Reply::Error(CoreError::Protocol("invalid port".into()).to_string()),
    };
    state.replication.set_master_addr(host_str, port);
    state.role_manager.set_role(Role::Replica);
    Reply::ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::discovery::InMemoryServiceRegistry;
    use crate::core::engine::InMemoryEngine;
    use crate::core::replication::ReplicationManager;
    use crate::core::role::{InMemoryElectionClient, RoleManager};
    use bytes::Bytes;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    fn make_state(role: Role, password: Option<&str>) -> ServerState {
        let mut config = crate::config::Config::default();
        config.password = password.map(str::to_string);
        let engine = Arc::new(InMemoryEngine::new(config.databases));
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

    fn ctx() -> DispatchContext {
        DispatchContext {
            peer_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5555),
            replica_transport_tx: None,
        }
    }

    fn cmd(name: &str, args: Vec<&[u8]>, client_id: u64) -> Command {
        Command {
            name: name.into(),
            args: args.into_iter().map(Bytes::copy_from_slice).collect(),
            client_id,
            db_index: 0,
            reply_tx: None,
        }
    }

    #[test]
    fn unauthenticated_command_is_rejected_when_password_set() {
        let state = make_state(Role::Primary, Some("secret"));
        state.register_client(1, ctx().peer_addr);
        let reply = dispatch(cmd("GET", vec![b"k"], 1), &state, &ctx());
        assert_eq!(reply, Reply::Error(CoreError::AuthRequired.to_string()));
    }

    #[test]
    fn auth_then_command_succeeds() {
        let state = make_state(Role::Primary, Some("secret"));
        state.register_client(1, ctx().peer_addr);
        let auth_reply = dispatch(cmd("AUTH", vec![b"secret"], 1), &state, &ctx());
        assert_eq!(auth_reply, Reply::ok());
        let reply = dispatch(cmd("SET", vec![b"k", b"v"], 1), &state, &ctx());
        assert_eq!(reply, Reply::ok());
    }

    #[test]
    fn write_on_replica_is_rejected_by_dispatch() {
        let state = make_state(Role::Replica, None);
        state.register_client(1, ctx().peer_addr);
        let reply = dispatch(cmd("SET", vec![b"k", b"v"], 1), &state, &ctx());
        assert_eq!(reply, Reply::Error(CoreError::ReadOnlyReplica.to_string()));
    }

    #[test]
    fn slaveof_no_one_forces_primary() {
        let state = make_state(Role::Replica, None);
        state.register_client(1, ctx().peer_addr);
        let reply = dispatch(cmd("SLAVEOF", vec![b"NO", b"ONE"], 1), &state, &ctx());
        assert_eq!(reply, Reply::ok());
        assert_eq!(state.role_manager.role(), Role::Primary);
    }

    #[test]
    fn role_reports_master_for_primary() {
        let state = make_state(Role::Primary, None);
        state.register_client(1, ctx().peer_addr);
        let reply = dispatch(cmd("ROLE", vec![], 1), &state, &ctx());
        assert_eq!(
            reply,
            Reply::Array(vec![Reply::from_bytes("master"), Reply::Integer(0)])
        );
    }
}

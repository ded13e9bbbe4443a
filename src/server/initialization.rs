// src/server/initialization.rs

//! Builds every piece of shared state and binds both listeners before
//! the main loop starts.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::info;

use super::context::ServerContext;
use crate::config::{Config, ReplicationRoleConfig};
use crate::core::discovery::InMemoryServiceRegistry;
use crate::core::engine::InMemoryEngine;
use crate::core::replication::ReplicationManager;
use crate::core::role::{InMemoryElectionClient, RoleManager};
use crate::core::state::ServerState;

pub async fn setup(config: Config) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let engine = Arc::new(InMemoryEngine::new(config.databases));

    let starts_as_primary = matches!(config.replication, ReplicationRoleConfig::Primary);
    let election = Arc::new(InMemoryElectionClient::new(starts_as_primary));
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
    replication.install_role_listener();

    // Establish the initial role before accepting any connections, so the
    // first command sees a decided role rather than `None`.
    role_manager.recheck().await;

    if let ReplicationRoleConfig::Replica {
        primary_host,
        primary_port,
    } = &config.replication
    {
        replication.set_master_addr(primary_host.clone(), *primary_port);
    }

    let client_listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("failed to bind client port {}:{}", config.host, config.port))?;
    info!(host = %config.host, port = config.port, "client command port bound");

    let protocol_listener = TcpListener::bind((config.host.as_str(), config.protocol_port))
        .await
        .with_context(|| {
            format!(
                "failed to bind replication protocol port {}:{}",
                config.host, config.protocol_port
            )
        })?;
    info!(host = %config.host, port = config.protocol_port, "replication protocol port bound");

    let state = Arc::new(ServerState::new(
        config,
        engine,
        role_manager,
        discovery,
        replication,
    ));

    state.replication.start().await;

    Ok(ServerContext {
        state,
        client_listener,
        protocol_listener,
        shutdown_tx,
        background_tasks: JoinSet::new(),
    })
}

fn log_startup_info(config: &Config) {
    info!(
        databases = config.databases,
        max_clients = config.max_clients,
        "core configuration loaded"
    );
    match &config.replication {
        ReplicationRoleConfig::Primary => info!("starting in PRIMARY role"),
        ReplicationRoleConfig::Replica {
            primary_host,
            primary_port,
        } => info!(primary_host, primary_port, "starting in REPLICA role"),
    }
}

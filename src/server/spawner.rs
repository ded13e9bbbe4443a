// src/server/spawner.rs

//! Spawns every long-running background task: the periodic sweepers, the
//! role re-checker, the master-change watch, and the replica reconnect
//! loop.

use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

use super::context::ServerContext;
use crate::core::metrics;
use crate::core::replication::worker;
use crate::core::role::{self, Role};
use crate::core::session;

const PROCESSED_CMDS_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);
const DEAD_SUBSCRIBER_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEAD_SUBSCRIBER_MAX_IDLE: Duration = Duration::from_secs(2 * 60);

pub fn spawn_all(ctx: &mut ServerContext) {
    let state = ctx.state.clone();

    // Session sweeper (C3, every 30 s).
    let shutdown_rx = ctx.shutdown_tx.subscribe();
    let sessions = state.sessions.clone();
    let live_ids = state.live_client_ids.clone();
    ctx.background_tasks.spawn(async move {
        session::spawn_sweeper(sessions, live_ids, shutdown_rx).await.ok();
    });

    // Role re-check (C4, every 5 s).
    let shutdown_rx = ctx.shutdown_tx.subscribe();
    let role_manager = state.role_manager.clone();
    ctx.background_tasks.spawn(async move {
        role::spawn_role_recheck(role_manager, shutdown_rx).await.ok();
    });

    // Replica reconnect loop, woken by the keepalive timer and by the
    // triggers registered below.
    let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
    let shutdown_rx = ctx.shutdown_tx.subscribe();
    let replication = state.replication.clone();
    ctx.background_tasks.spawn(async move {
        worker::spawn_reconnect_loop(replication, trigger_rx, shutdown_rx).await.ok();
    });

    // Wake the reconnect loop promptly on every Primary->Replica edge.
    let trigger_tx_for_role = trigger_tx.clone();
    state.role_manager.on_transition(move |_old, new| {
        if new == Role::Replica {
            let _ = trigger_tx_for_role.send(());
        }
    });

    // Forward master-change notifications into metrics/log and wake the
    // reconnect loop so a failover is picked up without waiting out the
    // full keepalive interval.
    let trigger_tx_for_discovery = trigger_tx;
    let replication_for_discovery = state.replication.clone();
    state.discovery.watch_master_change(Box::new(move |info| {
        info!(host = %info.host, port = info.port, "primary changed");
        replication_for_discovery.publish_master_change(&info.host, info.port);
        let _ = trigger_tx_for_discovery.send(());
    }));

    // Dead-subscriber / dead-replica sweep (every 5 min).
    let shutdown_rx = ctx.shutdown_tx.subscribe();
    let replication = state.replication.clone();
    ctx.background_tasks.spawn(async move {
        let mut shutdown_rx = shutdown_rx;
        let mut interval = tokio::time::interval(DEAD_SUBSCRIBER_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => replication.sweep_dead_subscribers(DEAD_SUBSCRIBER_MAX_IDLE),
            }
        }
    });

    // processed_cmds TTL sweep (every 30 min).
    let shutdown_rx = ctx.shutdown_tx.subscribe();
    let replication = state.replication.clone();
    ctx.background_tasks.spawn(async move {
        let mut shutdown_rx = shutdown_rx;
        let mut interval = tokio::time::interval(PROCESSED_CMDS_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => replication.sweep_processed_cmds(),
            }
        }
    });

    // Master-offset gauge refresh, cheap enough to just poll.
    let shutdown_rx = ctx.shutdown_tx.subscribe();
    let replication = state.replication.clone();
    ctx.background_tasks.spawn(async move {
        let mut shutdown_rx = shutdown_rx;
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => metrics::MASTER_OFFSET.set(replication.master_offset()),
            }
        }
    });
}

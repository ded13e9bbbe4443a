// src/server/connection_loop.rs

//! The main accept loop: client connections on one listener, replica
//! protocol-port connections on the other, plus signal-driven graceful
//! shutdown.

use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::context::ServerContext;
use crate::connection::{self, ConnectionHandler};

#[cfg(windows)]
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => info!("SIGINT received, shutting down"),
            _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        }
    }
    #[cfg(windows)]
    {
        let _ = signal::ctrl_c().await;
        info!("Ctrl-C received, shutting down");
    }
}

pub async fn run(mut ctx: ServerContext) {
    let mut next_session_id: u64 = 1;
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = await_shutdown_signal() => break,

            Some(res) = ctx.background_tasks.join_next() => {
                if let Err(e) = res {
                    if e.is_panic() {
                        error!("background task panicked: {e:?}");
                    }
                }
            }

            accepted = ctx.client_listener.accept() => {
                match accepted {
                    Ok((socket, addr)) => {
                        let client_id = next_session_id;
                        next_session_id = next_session_id.wrapping_add(1);
                        info!(%addr, client_id, "client connected");
                        let state = ctx.state.clone();
                        let shutdown_rx = ctx.shutdown_tx.subscribe();
                        tasks.spawn(async move {
                            let handler = ConnectionHandler::new(socket, addr, state, client_id, shutdown_rx);
                            handler.run().await;
                        });
                    }
                    Err(e) => error!(error = %e, "failed to accept client connection"),
                }
            }

            accepted = ctx.protocol_listener.accept() => {
                match accepted {
                    Ok((socket, addr)) => {
                        let client_id = next_session_id;
                        next_session_id = next_session_id.wrapping_add(1);
                        info!(%addr, client_id, "replica connected on protocol port");
                        let state = ctx.state.clone();
                        let shutdown_rx = ctx.shutdown_tx.subscribe();
                        tasks.spawn(async move {
                            connection::accept_protocol_connection(state, client_id, addr, socket, shutdown_rx).await;
                        });
                    }
                    Err(e) => error!(error = %e, "failed to accept replication connection"),
                }
            }

            Some(res) = tasks.join_next() => {
                if let Err(e) = res {
                    if e.is_panic() {
                        error!("connection task panicked: {e:?}");
                    }
                }
            }
        }
    }

    info!("shutting down, signalling background and connection tasks");
    let _ = ctx.shutdown_tx.send(());
    ctx.state.replication.stop().await;

    if tokio::time::timeout(Duration::from_secs(10), async {
        while tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("timed out waiting for connections to close");
    }

    if tokio::time::timeout(Duration::from_secs(5), async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("timed out waiting for background tasks to finish");
    }

    info!("shutdown complete");
}

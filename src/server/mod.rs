// src/server/mod.rs

use anyhow::Result;

mod connection_loop;
mod context;
mod initialization;
mod spawner;

use crate::config::Config;

/// The main server startup function, orchestrating setup, background
/// task spawning, and the accept loop.
pub async fn run(config: Config) -> Result<()> {
    let mut ctx = initialization::setup(config).await?;
    spawner::spawn_all(&mut ctx);
    connection_loop::run(ctx).await;
    Ok(())
}

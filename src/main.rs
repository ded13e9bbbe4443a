// src/main.rs

//! Entry point for the standalone node binary: load configuration, set up
//! tracing, and run the server until a shutdown signal arrives.

use anyhow::Result;
use cachecore::config::Config;
use cachecore::server;
use std::env;
use tracing::error;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("cachecore version {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");

    let mut config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    if let Some(port_index) = args.iter().position(|arg| arg == "--port") {
        match args.get(port_index + 1).map(|s| s.parse::<u16>()) {
            Some(Ok(port)) => config.port = port,
            _ => {
                eprintln!("--port flag requires a valid port number");
                std::process::exit(1);
            }
        }
    }

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .compact()
        .init();

    if let Err(e) = server::run(config).await {
        error!("server runtime error: {e}");
        return Err(e);
    }

    Ok(())
}

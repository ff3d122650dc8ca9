// src/main.rs

//! The main entry point for the QuartzKV server application.

use anyhow::Result;
use quartzkv::config::Config;
use quartzkv::core::engine::{MemoryEngine, MemorySnapshots, NullPubSub};
use quartzkv::server;
use std::env;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("QuartzKV version {VERSION}");
        return Ok(());
    }

    // The configuration path can be provided via a --config flag; otherwise,
    // it defaults to "config.toml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");

    // A startup configuration error is unrecoverable; exit code 1.
    let mut config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    // Override port if provided as a command-line argument.
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
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    // The core runs against its collaborator traits; the stand-alone binary
    // wires in the in-memory implementations.
    let engine = Arc::new(MemoryEngine::new());
    let pubsub = Arc::new(NullPubSub);
    let snapshots = Arc::new(MemorySnapshots::default());

    if let Err(e) = server::run(config, engine, pubsub, snapshots).await {
        error!("Server runtime error: {}", e);
        // Lock and corruption failures surface here during startup.
        std::process::exit(1);
    }
    Ok(())
}

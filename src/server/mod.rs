// src/server/mod.rs

use crate::config::Config;
use crate::core::engine::{KeyspaceEngine, PubSubBridge, SnapshotProvider};
use anyhow::Result;
use std::sync::Arc;

mod connection_loop;
mod context;
mod initialization;
mod spawner;
mod stream;

pub use stream::AnyStream;

/// The main server startup function, orchestrating all setup phases.
pub async fn run(
    config: Config,
    engine: Arc<dyn KeyspaceEngine>,
    pubsub: Arc<dyn PubSubBridge>,
    snapshots: Arc<dyn SnapshotProvider>,
) -> Result<()> {
    // 1. Initialize server state, listener, TLS, the cluster config lock.
    let mut server_context = initialization::setup(config, engine, pubsub, snapshots).await?;

    // 2. Spawn the background tasks (cluster bus, replication supervisor).
    spawner::spawn_all(&mut server_context).await?;

    // 3. Accept connections until shutdown.
    connection_loop::run(server_context).await;

    Ok(())
}

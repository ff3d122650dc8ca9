// src/server/spawner.rs

//! Spawns all of the server's long-running background tasks.

use super::context::ServerContext;
use crate::core::cluster;
use crate::core::replication;
use anyhow::Result;
use tracing::info;

/// Spawns the cluster bus worker and the replication supervisor.
pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let state = ctx.state.clone();

    if state.cluster.is_some() {
        tokio::spawn(cluster::gossip::run(
            state.clone(),
            state.shutdown_tx.subscribe(),
        ));
        info!("Cluster bus worker spawned.");
    }

    tokio::spawn(replication::run_replication(
        state.clone(),
        state.shutdown_tx.subscribe(),
    ));
    info!("Replication supervisor spawned.");

    Ok(())
}

// src/core/replication/mod.rs

//! This module orchestrates the replication subsystem: the shared backlog,
//! the primary-side replica handling, and the replica-side worker, switching
//! between roles as the configuration changes.

use crate::config::ReplicationConfig;
use crate::core::protocol::RespFrame;
use crate::core::state::ServerState;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

pub mod backlog;
pub mod handler;
pub mod sync;
pub mod worker;

/// Supervises the role-dependent replication machinery. A primary has no
/// dedicated task (writes are fed into the backlog at execution time and
/// replica connections are handled per-socket); a replica runs the worker.
/// Every reconfigure signal re-evaluates the role, which is how a failover
/// flips the machinery around.
pub async fn run_replication(state: Arc<ServerState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut reconfigure_rx = state.replication_reconfigure_tx.subscribe();
    loop {
        let is_replica = {
            let config = state.config.lock().await;
            matches!(config.replication, ReplicationConfig::Replica { .. })
        };
        if is_replica {
            let worker = worker::ReplicaWorker::new(state.clone());
            // The worker returns when the role changes or on shutdown.
            worker
                .run(
                    state.shutdown_tx.subscribe(),
                    state.replication_reconfigure_tx.subscribe(),
                )
                .await;
            info!("Replica worker exited; re-evaluating replication role.");
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return,
                _ = tokio::time::sleep(std::time::Duration::from_millis(10)) => {}
            }
        } else {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = reconfigure_rx.recv() => {
                    info!("Replication role change signalled.");
                }
            }
        }
    }
}

/// Demands an immediate offset report from every attached replica by feeding
/// `REPLCONF GETACK *` through the replication stream. Used while writes are
/// paused for a manual failover, so offsets converge quickly.
pub fn request_acks(state: &Arc<ServerState>) {
    if state.replicas.is_empty() {
        return;
    }
    let frame = RespFrame::command(&[b"REPLCONF", b"GETACK", b"*"]);
    if let Ok(encoded) = frame.encode_to_vec() {
        state.feed_replication_stream(&encoded);
    }
}

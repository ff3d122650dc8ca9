// src/core/cluster/admin.rs

//! State-machine entry points for the CLUSTER administrative commands. The
//! command surface itself (parsing, reply formatting) lives outside the
//! core; these functions are the operations it invokes.

use crate::core::QuartzError;
use crate::core::cluster::epoch;
use crate::core::cluster::failover;
use crate::core::cluster::node::{ClusterNode, NODE_ID_LEN, NodeFlags, NodeRuntime};
use crate::core::cluster::state::{ClusterState, TodoFlags};
use crate::core::state::ServerState;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

/// The `CLUSTER SETSLOT` sub-operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetSlotOp {
    Migrating(String),
    Importing(String),
    Stable,
    Node(String),
}

fn cluster_of(state: &Arc<ServerState>) -> Result<Arc<ClusterState>, QuartzError> {
    state
        .cluster
        .clone()
        .ok_or_else(|| QuartzError::InvalidState("this instance is not in cluster mode".into()))
}

/// `CLUSTER MEET ip port [bus-port]`: seed a handshake toward an unknown
/// peer. The real node id is learned when the peer answers.
pub async fn meet(
    state: &Arc<ServerState>,
    ip: &str,
    port: u16,
    bus_port: Option<u16>,
) -> Result<(), QuartzError> {
    let cluster = cluster_of(state)?;
    let bus_port = bus_port.unwrap_or(port.wrapping_add(10000));

    let already_known = cluster
        .registry
        .nodes
        .iter()
        .any(|e| e.value().info.ip == ip && e.value().info.bus_port == bus_port);
    if already_known {
        return Ok(());
    }

    let mut node = ClusterNode::new(
        crate::core::random_hex_id(),
        NodeFlags::HANDSHAKE | NodeFlags::MEET,
    );
    node.ip = ip.to_string();
    node.port = port;
    node.bus_port = bus_port;
    info!("Starting handshake with {ip}:{port}@{bus_port}");
    cluster.registry.insert(NodeRuntime::new(node));
    Ok(())
}

/// `CLUSTER FORGET id`: remove a node and blacklist its id so gossip cannot
/// immediately re-introduce it.
pub async fn forget(state: &Arc<ServerState>, node_id: &str) -> Result<(), QuartzError> {
    let cluster = cluster_of(state)?;
    if node_id == cluster.my_id {
        return Err(QuartzError::InvalidState("I tried hard but I can't forget myself".into()));
    }
    if cluster.my_primary_id().as_deref() == Some(node_id) {
        return Err(QuartzError::InvalidState(
            "can't forget my primary while replicating it".into(),
        ));
    }
    if !cluster.registry.contains(node_id) {
        return Err(QuartzError::Cluster(format!("unknown node {node_id}")));
    }
    cluster.registry.blacklist_add(node_id);
    cluster.registry.remove(node_id);
    cluster.recompute_size();
    cluster.schedule_save(false);
    cluster.schedule(TodoFlags::UPDATE_STATE);
    info!("Forgot node {node_id}");
    Ok(())
}

/// `CLUSTER REPLICATE id`: reconfigure this node as a replica of `id`.
pub async fn replicate(state: &Arc<ServerState>, node_id: &str) -> Result<(), QuartzError> {
    let cluster = cluster_of(state)?;
    if node_id == cluster.my_id {
        return Err(QuartzError::InvalidState("can't replicate myself".into()));
    }
    let Some(target) = cluster.registry.get(node_id).map(|rt| rt.info.clone()) else {
        return Err(QuartzError::Cluster(format!("unknown node {node_id}")));
    };
    if !target.is_primary() {
        return Err(QuartzError::InvalidState(format!(
            "node {node_id} is not a primary"
        )));
    }
    let myself = cluster.myself_info();
    if myself.is_primary() && myself.num_slots > 0 {
        return Err(QuartzError::InvalidState(
            "to set a replica the node must be empty of slots".into(),
        ));
    }

    cluster.set_myself_replica_of(node_id);
    cluster.schedule_save(true);
    {
        let mut config = state.config.lock().await;
        config.replication = crate::config::ReplicationConfig::Replica {
            primary_host: target.ip.clone(),
            primary_port: target.port,
            tls_enabled: false,
        };
    }
    let _ = state.replication_reconfigure_tx.send(());
    Ok(())
}

/// `CLUSTER FAILOVER [FORCE|TAKEOVER]`.
pub async fn manual_failover(
    state: &Arc<ServerState>,
    force: bool,
    takeover: bool,
) -> Result<(), QuartzError> {
    let cluster = cluster_of(state)?;
    failover::start_manual_failover(state, &cluster, force, takeover).await
}

/// `CLUSTER SETSLOT slot (MIGRATING|IMPORTING|STABLE|NODE) [id]`.
pub async fn setslot(
    state: &Arc<ServerState>,
    slot: u16,
    op: SetSlotOp,
) -> Result<(), QuartzError> {
    let cluster = cluster_of(state)?;
    if !cluster.is_myself_primary() {
        return Err(QuartzError::InvalidState("only primaries hold slot state".into()));
    }
    match op {
        SetSlotOp::Migrating(target) => {
            if !cluster.i_own_slot(slot) {
                return Err(QuartzError::Cluster(format!(
                    "I'm not the owner of hash slot {slot}"
                )));
            }
            if !cluster.registry.contains(&target) || target == cluster.my_id {
                return Err(QuartzError::Cluster(format!("invalid migration target {target}")));
            }
            cluster.migrating_to.insert(slot, target);
        }
        SetSlotOp::Importing(source) => {
            if cluster.i_own_slot(slot) {
                return Err(QuartzError::Cluster(format!(
                    "I'm already the owner of hash slot {slot}"
                )));
            }
            if cluster.slot_owner(slot).as_deref() != Some(source.as_str()) {
                return Err(QuartzError::Cluster(format!(
                    "node {source} is not the owner of hash slot {slot}"
                )));
            }
            cluster.importing_from.insert(slot, source);
        }
        SetSlotOp::Stable => {
            cluster.migrating_to.remove(&slot);
            cluster.importing_from.remove(&slot);
        }
        SetSlotOp::Node(target) => {
            if !cluster.registry.contains(&target) {
                return Err(QuartzError::Cluster(format!("unknown node {target}")));
            }
            let owner = cluster.slot_owner(slot);
            if owner.as_deref() == Some(cluster.my_id.as_str())
                && target != cluster.my_id
                && state.engine.count_keys_in_slot(slot) > 0
            {
                return Err(QuartzError::InvalidState(format!(
                    "can't assign hash slot {slot} away while it still holds keys"
                )));
            }
            let finalizing_import =
                cluster.importing_from.remove(&slot).is_some() && target == cluster.my_id;
            if target != cluster.my_id {
                cluster.migrating_to.remove(&slot);
            }
            cluster.rebind_slot(slot, &target);
            if owner.as_deref() == Some(cluster.my_id.as_str()) && target != cluster.my_id {
                state.pubsub.unsubscribe_shard_slot(slot);
            }
            // Finalizing an import is the moment the slot changes shards for
            // real; the new ownership needs an epoch nothing else carries.
            if finalizing_import {
                epoch::bump_epoch_without_consensus(&cluster);
            }
        }
    }
    cluster.schedule_save(true);
    cluster.schedule(TodoFlags::UPDATE_STATE);
    Ok(())
}

/// `CLUSTER ADDSLOTS slot [slot ...]`: all-or-nothing claim of unassigned
/// slots for this node.
pub async fn addslots(state: &Arc<ServerState>, slots: &[u16]) -> Result<(), QuartzError> {
    let cluster = cluster_of(state)?;
    if !cluster.is_myself_primary() {
        return Err(QuartzError::InvalidState("only primaries can own slots".into()));
    }
    for &slot in slots {
        if let Some(owner) = cluster.slot_owner(slot) {
            return Err(QuartzError::Cluster(format!(
                "slot {slot} is already busy (owned by {owner})"
            )));
        }
    }
    let my_id = cluster.my_id.clone();
    for &slot in slots {
        cluster.add_slot(&my_id, slot)?;
    }
    cluster.recompute_size();
    cluster.schedule_save(true);
    cluster.schedule(TodoFlags::UPDATE_STATE);
    Ok(())
}

/// `CLUSTER DELSLOTS slot [slot ...]`.
pub async fn delslots(state: &Arc<ServerState>, slots: &[u16]) -> Result<(), QuartzError> {
    let cluster = cluster_of(state)?;
    for &slot in slots {
        if cluster.slot_owner(slot).is_none() {
            return Err(QuartzError::Cluster(format!("slot {slot} is already unassigned")));
        }
    }
    for &slot in slots {
        let previous = cluster.del_slot(slot)?;
        if previous == cluster.my_id {
            state.pubsub.unsubscribe_shard_slot(slot);
        }
    }
    cluster.recompute_size();
    cluster.schedule_save(true);
    cluster.schedule(TodoFlags::UPDATE_STATE);
    Ok(())
}

/// `CLUSTER RESET [HARD|SOFT]`. A primary still holding keys refuses to
/// reset unless the reset is HARD, which empties the dataset first.
pub async fn reset(state: &Arc<ServerState>, hard: bool) -> Result<(), QuartzError> {
    let cluster = cluster_of(state)?;
    let myself = cluster.myself_info();
    let holds_keys = (0..crate::core::cluster::slot::NUM_SLOTS as u16)
        .any(|s| state.engine.count_keys_in_slot(s) > 0);
    if myself.is_primary() && holds_keys && !hard {
        return Err(QuartzError::InvalidState(
            "CLUSTER RESET can't be called with master nodes containing keys".into(),
        ));
    }
    if hard {
        state.engine.empty_all_data().await;
    }

    // Drop every peer and every slot binding.
    let others: Vec<String> = cluster
        .registry
        .nodes
        .iter()
        .filter(|e| !e.value().info.is_myself())
        .map(|e| e.key().clone())
        .collect();
    for id in others {
        cluster.registry.remove(&id);
    }
    for slot in 0..crate::core::cluster::slot::NUM_SLOTS as u16 {
        if cluster.slot_owner(slot).is_some() {
            let _ = cluster.del_slot(slot);
        }
    }
    cluster.migrating_to.clear();
    cluster.importing_from.clear();
    cluster.owner_not_claiming.lock().clear_all();
    cluster.manual_failover.lock().reset();
    cluster.election.lock().reset();

    if myself.is_replica() {
        cluster.set_myself_primary(myself.config_epoch);
        let mut config = state.config.lock().await;
        config.replication = crate::config::ReplicationConfig::Primary(Default::default());
        drop(config);
        let _ = state.replication_reconfigure_tx.send(());
    }

    if hard {
        cluster.current_epoch.store(0, Ordering::Release);
        cluster.last_vote_epoch.store(0, Ordering::Release);
        if let Some(mut rt) = cluster.registry.get_mut(&cluster.my_id) {
            rt.info.config_epoch = 0;
            rt.info.repl_offset = 0;
            // A hard reset also discards the shard lineage; a fresh shard id
            // keeps former siblings from treating us as a returning member.
            rt.info.shard_id = crate::core::random_hex_id();
        }
        warn!("Hard reset: epochs zeroed and shard id regenerated");
    }

    cluster.recompute_size();
    cluster.schedule_save(true);
    cluster.schedule(TodoFlags::UPDATE_STATE);
    info!("Cluster state was reset ({})", if hard { "hard" } else { "soft" });
    Ok(())
}

/// `CLUSTER BUMPEPOCH`.
pub async fn bumpepoch(state: &Arc<ServerState>) -> Result<u64, QuartzError> {
    let cluster = cluster_of(state)?;
    Ok(epoch::bump_epoch_without_consensus(&cluster))
}

/// `CLUSTER COUNT-FAILURE-REPORTS id`.
pub async fn count_failure_reports(
    state: &Arc<ServerState>,
    node_id: &str,
) -> Result<usize, QuartzError> {
    let cluster = cluster_of(state)?;
    let node_timeout = state.config.lock().await.cluster.node_timeout;
    cluster
        .registry
        .get_mut(node_id)
        .map(|mut rt| rt.expire_fail_reports(node_timeout))
        .ok_or_else(|| QuartzError::Cluster(format!("unknown node {node_id}")))
}

/// Validates an id argument before registry lookups.
pub fn check_node_id(raw: &str) -> Result<(), QuartzError> {
    if raw.len() != NODE_ID_LEN || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(QuartzError::Cluster(format!("invalid node id '{raw}'")));
    }
    Ok(())
}

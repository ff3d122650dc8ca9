// src/core/cluster/epoch.rs

//! The epoch and slot-configuration engine: config-epoch collision
//! resolution, slot rebinding on newer-epoch claims, dirty-slot cleanup, and
//! the shard-level promotion that follows a completed migration.

use crate::core::cluster::gossip;
use crate::core::cluster::message::{ClusterPacket, MsgHeader, MsgPayload, MsgType};
use crate::core::cluster::node::NodeFlags;
use crate::core::cluster::slot::{NUM_SLOTS, SlotBitmap};
use crate::core::cluster::state::{ClusterState, TodoFlags};
use crate::core::state::ServerState;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

/// Resolves a config-epoch collision between two primaries: the one with the
/// lexicographically larger id bumps `current_epoch` and adopts it, while
/// the smaller id keeps its claim untouched. The new epoch is persisted with
/// fsync before anything else advertises it.
pub async fn handle_epoch_collision(
    state: &Arc<ServerState>,
    cluster: &Arc<ClusterState>,
    header: &MsgHeader,
) {
    let myself = cluster.myself_info();
    if !myself.is_primary()
        || !header.sender_flags.contains(NodeFlags::PRIMARY)
        || header.config_epoch != myself.config_epoch
        || header.sender == cluster.my_id
    {
        return;
    }
    // Only the larger id moves; the smaller id is the stable side.
    if cluster.my_id.as_str() <= header.sender.as_str() {
        return;
    }
    let new_epoch = cluster.bump_epoch();
    if let Some(mut rt) = cluster.registry.get_mut(&cluster.my_id) {
        rt.info.config_epoch = new_epoch;
    }
    warn!(
        "Config epoch collision with {} at epoch {}; adopting new epoch {}",
        header.sender, header.config_epoch, new_epoch
    );
    gossip::flush_config_with_fsync(cluster);
    let _ = state;
}

/// Increments `current_epoch` and adopts it as our own config epoch without
/// agreement from other nodes. Used only to finalize a slot import and after
/// a forced manual failover. This can transiently create epoch collisions;
/// collision resolution restores uniqueness within a few ping rounds.
pub fn bump_epoch_without_consensus(cluster: &Arc<ClusterState>) -> u64 {
    let new_epoch = cluster.bump_epoch();
    if let Some(mut rt) = cluster.registry.get_mut(&cluster.my_id) {
        rt.info.config_epoch = new_epoch;
    }
    info!("Bumped config epoch to {new_epoch} without consensus");
    cluster.schedule_save(true);
    new_epoch
}

/// Handles an UPDATE payload: a peer telling us `node_id` owns `slots` at
/// `config_epoch`, because our own claims looked stale to it.
pub async fn handle_update(
    state: &Arc<ServerState>,
    cluster: &Arc<ClusterState>,
    node_id: &str,
    config_epoch: u64,
    slots: &SlotBitmap,
) {
    cluster.observe_epoch(config_epoch);
    let updated = {
        let Some(mut rt) = cluster.registry.get_mut(node_id) else {
            return;
        };
        if rt.info.config_epoch < config_epoch {
            rt.info.config_epoch = config_epoch;
            true
        } else {
            false
        }
    };
    if updated {
        cluster.schedule_save(true);
    }
    update_slots_from_claim(state, cluster, node_id, config_epoch, slots).await;
}

/// Applies a primary's slot-ownership claim carried by a PING/PONG/UPDATE.
///
/// For every slot set in the claim: the slot rebinds to the claimer when it
/// is unclaimed, owned under a strictly older epoch, or flagged as no longer
/// claimed by its owner. For every slot the claimer owned but stopped
/// claiming: nothing unbinds immediately; the slot is only flagged, which
/// avoids ownership flapping while a migration settles.
pub async fn update_slots_from_claim(
    state: &Arc<ServerState>,
    cluster: &Arc<ClusterState>,
    claimer_id: &str,
    claimed_epoch: u64,
    claimed: &SlotBitmap,
) {
    let my_id = cluster.my_id.clone();
    let myself_is_primary = cluster.is_myself_primary();
    let my_context = if myself_is_primary {
        Some(my_id.clone())
    } else {
        cluster.my_primary_id()
    };

    let mut dirty_slots: Vec<u16> = Vec::new();
    let mut moved_from_context = 0usize;
    let mut stale_claim = false;
    let mut changed = false;
    let mut import_finalized = false;

    for slot in 0..NUM_SLOTS as u16 {
        if claimed.test(slot) {
            let owner = cluster.slot_owner(slot);
            if owner.as_deref() == Some(claimer_id) {
                cluster.owner_not_claiming.lock().clear(slot);
                continue;
            }

            let owner_epoch = owner
                .as_deref()
                .and_then(|id| cluster.registry.get(id))
                .map(|rt| rt.info.config_epoch);
            let owner_released = cluster.owner_not_claiming.lock().test(slot);

            let accept = match owner_epoch {
                None => true,
                Some(epoch) => epoch < claimed_epoch || owner_released,
            };
            if !accept {
                // The claim is older than what we know; the claimer needs a
                // refresher about the real owner.
                stale_claim = true;
                continue;
            }

            if owner.as_deref() == Some(my_id.as_str())
                && state.engine.count_keys_in_slot(slot) > 0
            {
                dirty_slots.push(slot);
            }
            if owner.as_deref() == my_context.as_deref() {
                moved_from_context += 1;
            }

            adjust_migration_markers(cluster, slot, claimer_id);
            cluster.rebind_slot(slot, claimer_id);
            if owner.as_deref() == Some(my_id.as_str()) {
                state.pubsub.unsubscribe_shard_slot(slot);
            }
            changed = true;
        } else {
            // Claimer stopped claiming a slot it owns in our table.
            if cluster.slot_owner(slot).as_deref() == Some(claimer_id) {
                if cluster
                    .importing_from
                    .get(&slot)
                    .is_some_and(|src| src.value() == claimer_id)
                    && myself_is_primary
                {
                    // The source of our import released the slot: finalize
                    // the import on our side.
                    cluster.importing_from.remove(&slot);
                    cluster.rebind_slot(slot, &my_id);
                    import_finalized = true;
                    changed = true;
                    info!("Import of slot {slot} finalized; source released its claim.");
                } else {
                    cluster.owner_not_claiming.lock().set(slot);
                }
            }
        }
    }

    if import_finalized {
        bump_epoch_without_consensus(cluster);
    }

    if stale_claim {
        send_ownership_refresh(cluster, claimer_id, claimed).await;
    }

    if !dirty_slots.is_empty() {
        warn!(
            "Lost {} slots that still hold local keys; purging them.",
            dirty_slots.len()
        );
        for slot in dirty_slots {
            let removed = state.engine.delete_keys_in_slot(slot).await;
            warn!("Deleted {removed} keys from transferred slot {slot}");
        }
    }

    if changed {
        cluster.schedule_save(true);
        cluster.schedule(TodoFlags::UPDATE_STATE);
    }

    maybe_follow_claimer(state, cluster, claimer_id, my_context, moved_from_context).await;
}

/// Keeps migration overlays coherent with an ownership move of `slot` to
/// `claimer`.
fn adjust_migration_markers(cluster: &Arc<ClusterState>, slot: u16, claimer_id: &str) {
    // Migrating marker: the destination taking ownership completes the
    // migration; a same-shard failover of the destination keeps it alive; a
    // cross-shard move means an operator re-routed the slot and the old
    // intent is void.
    if let Some(target) = cluster.migrating_to.get(&slot).map(|t| t.value().clone()) {
        if target == claimer_id {
            info!("Migration of slot {slot} to {claimer_id} completed.");
            cluster.migrating_to.remove(&slot);
        } else if !same_shard(cluster, &target, claimer_id) {
            info!("Cancelling migration of slot {slot}: ownership moved off-shard.");
            cluster.migrating_to.remove(&slot);
        }
    }
    // Importing marker: follow the source's failover within its shard,
    // otherwise the operator moved it and the import is void.
    if let Some(src) = cluster.importing_from.get(&slot).map(|s| s.value().clone())
        && src != claimer_id
    {
        if same_shard(cluster, &src, claimer_id) {
            cluster.importing_from.insert(slot, claimer_id.to_string());
        } else {
            info!("Cancelling import of slot {slot}: source replaced off-shard.");
            cluster.importing_from.remove(&slot);
        }
    }
}

/// Tells a node with stale claims who really owns the contested slots.
async fn send_ownership_refresh(
    cluster: &Arc<ClusterState>,
    claimer_id: &str,
    claimed: &SlotBitmap,
) {
    // Group the contested slots by their real owner and send one UPDATE per
    // owner.
    let mut owners: std::collections::HashMap<String, SlotBitmap> =
        std::collections::HashMap::new();
    for slot in claimed.iter_ones() {
        if let Some(owner) = cluster.slot_owner(slot)
            && owner != claimer_id
        {
            owners.entry(owner).or_default().set(slot);
        }
    }
    for (owner_id, _) in owners {
        let Some(owner) = cluster.registry.get(&owner_id).map(|rt| rt.info.clone()) else {
            continue;
        };
        let packet = ClusterPacket::Full(
            MsgHeader {
                mtype: MsgType::Update,
                port: 0,
                pport: 0,
                cport: 0,
                current_epoch: cluster.current_epoch.load(Ordering::Acquire),
                config_epoch: cluster.myself_info().config_epoch,
                offset: 0,
                sender: cluster.my_id.clone(),
                myslots: SlotBitmap::new(),
                replicaof: None,
                myip: String::new(),
                sender_flags: cluster.myself_info().flags & !NodeFlags::MYSELF,
                state_ok: cluster.state_ok.load(Ordering::Acquire),
                mflags: crate::core::cluster::message::MsgFlags::empty(),
            },
            MsgPayload::Update {
                config_epoch: owner.config_epoch,
                node_id: owner.id.clone(),
                slots: owner.slots.clone(),
            },
        );
        gossip::send_packet_to_node(cluster, claimer_id, &packet);
    }
}

/// Shard-level promotion: if every slot our shard served migrated to the
/// claimer and the shard is now empty, this node follows the slots and
/// becomes a replica of the claimer. Cross-shard moves require the
/// allow-replica-migration knob; they imply a full resync.
async fn maybe_follow_claimer(
    state: &Arc<ServerState>,
    cluster: &Arc<ClusterState>,
    claimer_id: &str,
    my_context: Option<String>,
    moved_from_context: usize,
) {
    let Some(context_id) = my_context else {
        return;
    };
    if moved_from_context == 0 || claimer_id == cluster.my_id || context_id == claimer_id {
        return;
    }
    let context_empty = cluster
        .registry
        .get(&context_id)
        .map(|rt| rt.info.num_slots == 0)
        .unwrap_or(false);
    if !context_empty {
        return;
    }
    let allow_migration = state.config.lock().await.cluster.allow_replica_migration;
    let same = same_shard(cluster, &context_id, claimer_id);
    if !allow_migration && !same {
        return;
    }

    info!(
        "Shard lost its last slot to {claimer_id}; following it as a replica ({} resync expected).",
        if same { "partial" } else { "full" }
    );
    cluster.set_myself_replica_of(claimer_id);
    cluster.schedule_save(true);

    let target = cluster
        .registry
        .get(claimer_id)
        .map(|rt| (rt.info.ip.clone(), rt.info.port));
    if let Some((host, port)) = target {
        let mut config = state.config.lock().await;
        config.replication = crate::config::ReplicationConfig::Replica {
            primary_host: host,
            primary_port: port,
            tls_enabled: false,
        };
        drop(config);
        let _ = state.replication_reconfigure_tx.send(());
    }
}

pub fn same_shard(cluster: &Arc<ClusterState>, a: &str, b: &str) -> bool {
    let shard_a = cluster.registry.get(a).map(|rt| rt.info.shard_id.clone());
    let shard_b = cluster.registry.get(b).map(|rt| rt.info.shard_id.clone());
    match (shard_a, shard_b) {
        (Some(a), Some(b)) => !a.is_empty() && a == b,
        _ => false,
    }
}

// src/core/cluster/failover.rs

//! Implements the failover coordinator: replica-side elections with rank
//! based delays, primary-side voting, the manual failover handshake with
//! paused writes, and replica migration toward orphaned primaries.
//!
//! # Operational Requirements: Time Synchronization
//!
//! Election timing relies on wall-clock arithmetic across nodes. Clocks do
//! not need to be perfectly aligned, but significant skew can cause
//! premature or overlapping election windows. Running NTP on every cluster
//! node is strongly recommended.

use crate::core::cluster::epoch;
use crate::core::cluster::gossip;
use crate::core::cluster::message::{ClusterPacket, MsgFlags, MsgHeader, MsgPayload, MsgType};
use crate::core::cluster::node::NodeFlags;
use crate::core::cluster::state::{ClusterState, FailoverSkipReason, TodoFlags};
use crate::core::now_ms;
use crate::core::state::ServerState;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

/// Overall deadline for a manual failover handshake.
pub const MF_TIMEOUT_MS: u64 = 5000;

/// Writes stay paused for `MF_TIMEOUT_MS * MF_PAUSE_MULT` on the primary.
pub const MF_PAUSE_MULT: u64 = 2;

/// How long a primary must be observed orphaned before replicas migrate.
pub const REPLICA_MIGRATION_DELAY_MS: u64 = 5000;

fn auth_timeout(node_timeout: u64) -> u64 {
    (2 * node_timeout).max(2000)
}

fn auth_retry(node_timeout: u64) -> u64 {
    2 * auth_timeout(node_timeout)
}

/// Periodic failover duties, driven by the cluster cron.
pub async fn cron(state: &Arc<ServerState>, cluster: &Arc<ClusterState>) {
    let now = now_ms();

    // A manual failover that overruns its deadline is abandoned on both
    // sides.
    {
        let mut mf = cluster.manual_failover.lock();
        if mf.in_progress() && now > mf.end_time {
            warn!("Manual failover timed out; aborting.");
            mf.reset();
            drop(mf);
            state.resume_writes();
            cluster.election.lock().reset();
        }
    }

    let myself = cluster.myself_info();
    if myself.is_replica() {
        // Track convergence toward the frozen offset of a manual failover.
        let target_offset = {
            let mf = cluster.manual_failover.lock();
            if mf.in_progress() && !mf.can_start {
                mf.primary_offset
            } else {
                None
            }
        };
        if let Some(target) = target_offset {
            let processed = state
                .replication
                .primary_link
                .lock()
                .await
                .as_ref()
                .map_or(0, |info| info.processed_offset);
            if processed >= target {
                info!("Reached the paused primary offset {target}; election may start.");
                cluster.manual_failover.lock().can_start = true;
            }
        }
        replica_failover_cron(state, cluster).await;
    }
}

/// The replica-side election state machine, evaluated every cron tick.
async fn replica_failover_cron(state: &Arc<ServerState>, cluster: &Arc<ClusterState>) {
    let (node_timeout, ping_interval, validity_factor) = {
        let config = state.config.lock().await;
        (
            config.cluster.node_timeout,
            config.cluster.effective_ping_interval(),
            config.cluster.replica_validity_factor,
        )
    };
    let now = now_ms();
    let myself = cluster.myself_info();

    let manual = {
        let mf = cluster.manual_failover.lock();
        mf.in_progress() && mf.can_start
    };

    let Some(primary_id) = myself.replica_of.clone() else {
        cluster.election.lock().cant_failover_reason = FailoverSkipReason::NotReplica;
        return;
    };
    let Some((primary_failed, primary_slots, primary_data_received)) = cluster
        .registry
        .get(&primary_id)
        .map(|rt| {
            (
                rt.info.flags.contains(NodeFlags::FAIL),
                rt.info.num_slots,
                rt.data_received,
            )
        })
    else {
        return;
    };

    if !primary_failed && !manual {
        let mut election = cluster.election.lock();
        election.cant_failover_reason = FailoverSkipReason::UpstreamHealthy;
        if election.auth_time != 0 && !election.auth_sent {
            // The primary came back before we asked for votes.
            election.reset();
        }
        return;
    }
    if myself.flags.contains(NodeFlags::NOFAILOVER) && !manual {
        return;
    }
    if primary_slots == 0 && !manual {
        return;
    }

    let my_offset = state
        .replication
        .primary_link
        .lock()
        .await
        .as_ref()
        .map_or(0, |info| info.processed_offset);

    // Replicas with data too stale to represent the shard sit elections out.
    let data_age = now.saturating_sub(primary_data_received);
    if !manual && data_age > ping_interval + node_timeout * validity_factor {
        cluster.election.lock().cant_failover_reason = FailoverSkipReason::DataAge;
        return;
    }

    enum Step {
        Wait,
        AnnounceRank,
        RequestVotes(u64),
        Promote,
    }

    let step = {
        let mut election = cluster.election.lock();

        // Open a fresh election window if none is active or the previous one
        // fully expired past its retry time.
        if election.auth_time == 0
            || (election.auth_sent && now > election.auth_time + auth_retry(node_timeout))
        {
            let rank = if manual {
                0
            } else {
                failover_rank(cluster, &primary_id, my_offset)
            };
            let delay = if manual {
                0
            } else {
                500 + rand::thread_rng().gen_range(0..500) + rank as u64 * 1000
            };
            election.auth_time = now + delay;
            election.auth_sent = false;
            election.auth_count = 0;
            election.auth_rank = rank;
            election.cant_failover_reason = FailoverSkipReason::WaitingDelay;
            info!(
                "Scheduling failover election in {delay} ms (rank {rank}, offset {my_offset})"
            );
            Step::AnnounceRank
        } else if !election.auth_sent {
            // While waiting, keep the rank current: siblings ack offsets as
            // they catch up and our place in line moves accordingly.
            if !manual {
                let new_rank = failover_rank(cluster, &primary_id, my_offset);
                if new_rank != election.auth_rank {
                    let shift = new_rank as i64 - election.auth_rank as i64;
                    election.auth_time =
                        (election.auth_time as i64 + shift * 1000).max(now as i64) as u64;
                    info!(
                        "Election rank changed {} -> {new_rank}; delay adjusted.",
                        election.auth_rank
                    );
                    election.auth_rank = new_rank;
                }
            }
            if now < election.auth_time {
                election.cant_failover_reason = FailoverSkipReason::WaitingDelay;
                Step::Wait
            } else {
                let new_epoch = cluster.bump_epoch();
                election.auth_epoch = new_epoch;
                election.auth_sent = true;
                election.auth_count = 0;
                election.cant_failover_reason = FailoverSkipReason::WaitingVotes;
                Step::RequestVotes(new_epoch)
            }
        } else if election.auth_count >= cluster.quorum() {
            Step::Promote
        } else if now > election.auth_time + auth_timeout(node_timeout) {
            election.cant_failover_reason = FailoverSkipReason::ExpiredElection;
            Step::Wait
        } else {
            election.cant_failover_reason = FailoverSkipReason::WaitingVotes;
            Step::Wait
        }
    };

    match step {
        Step::Wait => {}
        Step::AnnounceRank => {
            // Siblings recompute their own rank from our advertised offset.
            if !manual {
                gossip::broadcast_pong_to_shard(state, cluster).await;
            }
        }
        Step::RequestVotes(epoch) => {
            info!("Starting failover election for epoch {epoch}");
            // The epoch bump must be durable before any vote can reference it.
            gossip::flush_config_with_fsync(cluster);
            let mut header = gossip::build_header(state, cluster, MsgType::FailoverAuthRequest).await;
            if manual {
                header.mflags |= MsgFlags::FORCEACK;
            }
            gossip::broadcast_packet(cluster, &ClusterPacket::Full(header, MsgPayload::Empty));
        }
        Step::Promote => {
            promote_after_election(state, cluster).await;
        }
    }
}

/// The number of same-primary replicas that should try before us: those with
/// a strictly greater replication offset, ties broken by lexicographic id.
pub fn failover_rank(cluster: &Arc<ClusterState>, primary_id: &str, my_offset: u64) -> usize {
    let siblings = cluster
        .registry
        .get(primary_id)
        .map(|rt| rt.info.replicas.clone())
        .unwrap_or_default();
    let mut rank = 0;
    for sibling in siblings {
        if sibling == cluster.my_id {
            continue;
        }
        let Some(rt) = cluster.registry.get(&sibling) else {
            continue;
        };
        if rt.info.flags.intersects(NodeFlags::FAIL | NodeFlags::PFAIL) {
            continue;
        }
        let offset = rt.info.repl_offset;
        if offset > my_offset || (offset == my_offset && sibling.as_str() < cluster.my_id.as_str())
        {
            rank += 1;
        }
    }
    rank
}

/// Primary-side voting. All conditions must hold before the AUTH_ACK leaves;
/// the vote record is persisted with fsync in the same pass.
pub async fn handle_auth_request(
    state: &Arc<ServerState>,
    cluster: &Arc<ClusterState>,
    header: &MsgHeader,
) {
    let node_timeout = state.config.lock().await.cluster.node_timeout;
    let myself = cluster.myself_info();
    if !myself.is_voting_primary() {
        return;
    }
    let requester_id = header.sender.clone();
    let current_epoch = cluster.current_epoch.load(Ordering::Acquire);
    let force = header.mflags.contains(MsgFlags::FORCEACK);

    // The request must reference the newest epoch we know of.
    if header.current_epoch < current_epoch {
        warn!(
            "Refusing vote for {requester_id}: request epoch {} < our {current_epoch}",
            header.current_epoch
        );
        return;
    }
    // One vote per epoch, ever.
    if cluster.last_vote_epoch.load(Ordering::Acquire) == current_epoch {
        warn!("Refusing vote for {requester_id}: already voted in epoch {current_epoch}");
        return;
    }

    // The requester must be a replica of a failed primary, unless forced.
    let Some(requester_primary) = cluster
        .registry
        .get(&requester_id)
        .map(|rt| rt.info.replica_of.clone())
    else {
        return;
    };
    let primary_failed = requester_primary
        .as_deref()
        .and_then(|id| cluster.registry.get(id))
        .map(|p| p.info.flags.contains(NodeFlags::FAIL))
        .unwrap_or(false);
    if !force {
        let Some(_primary) = requester_primary.as_deref() else {
            return;
        };
        if !primary_failed {
            warn!("Refusing vote for {requester_id}: its primary is not failing");
            return;
        }
    }

    // At most one vote per shard per 2 * node_timeout, so two replicas of
    // one primary cannot both collect our vote in overlapping elections.
    if let Some(primary_id) = requester_primary.as_deref()
        && let Some(primary_rt) = cluster.registry.get(primary_id)
        && now_ms().saturating_sub(primary_rt.voted_time) < 2 * node_timeout
    {
        warn!("Refusing vote for {requester_id}: voted about this shard too recently");
        return;
    }

    // Every slot the requester claims must be free or covered by an epoch no
    // newer than the request's.
    for slot in header.myslots.iter_ones() {
        let Some(owner) = cluster.slot_owner(slot) else {
            continue;
        };
        let owner_epoch = cluster
            .registry
            .get(&owner)
            .map(|rt| rt.info.config_epoch)
            .unwrap_or(0);
        if owner_epoch > header.config_epoch {
            warn!(
                "Refusing vote for {requester_id}: slot {slot} owned at epoch {owner_epoch} > {}",
                header.config_epoch
            );
            return;
        }
    }

    cluster.last_vote_epoch.store(current_epoch, Ordering::Release);
    if let Some(primary_id) = requester_primary.as_deref()
        && let Some(mut primary_rt) = cluster.registry.get_mut(primary_id)
    {
        primary_rt.voted_time = now_ms();
    }
    gossip::flush_config_with_fsync(cluster);

    info!("Voting for {requester_id} in epoch {current_epoch}");
    let ack_header = gossip::build_header(state, cluster, MsgType::FailoverAuthAck).await;
    gossip::send_packet_to_node(
        cluster,
        &requester_id,
        &ClusterPacket::Full(ack_header, MsgPayload::Empty),
    );
}

/// Replica-side vote counting.
pub async fn handle_auth_ack(
    state: &Arc<ServerState>,
    cluster: &Arc<ClusterState>,
    header: &MsgHeader,
) {
    let voter_is_voting_primary = cluster
        .registry
        .get(&header.sender)
        .is_some_and(|rt| rt.info.is_voting_primary());
    if !voter_is_voting_primary {
        return;
    }

    let promote = {
        let mut election = cluster.election.lock();
        if !election.auth_sent || header.current_epoch < election.auth_epoch {
            return;
        }
        election.auth_count += 1;
        info!(
            "Vote from {} accepted ({}/{} needed)",
            header.sender,
            election.auth_count,
            cluster.quorum()
        );
        election.auth_count >= cluster.quorum()
    };
    if promote {
        promote_after_election(state, cluster).await;
    }
}

/// Performs the promotion after a won election (or a TAKEOVER): adopt the
/// election epoch, claim the old primary's slots, rotate the replication id
/// so old-history replicas can partial-resync, and broadcast the new claim.
pub async fn promote_after_election(state: &Arc<ServerState>, cluster: &Arc<ClusterState>) {
    let auth_epoch = {
        let mut election = cluster.election.lock();
        if !election.auth_sent {
            return;
        }
        let epoch = election.auth_epoch;
        election.reset();
        epoch
    };
    let Some(old_primary) = cluster.my_primary_id() else {
        return;
    };

    info!("Election won; promoting to primary at epoch {auth_epoch}");
    cluster.set_myself_primary(auth_epoch);
    cluster.take_over_slots_from(&old_primary);
    state.replication.shift_replid();
    cluster.manual_failover.lock().reset();
    state.resume_writes();

    // Role flip: the replica worker stops, the primary machinery takes over.
    {
        let mut config = state.config.lock().await;
        config.replication =
            crate::config::ReplicationConfig::Primary(Default::default());
    }
    let _ = state.replication_reconfigure_tx.send(());

    cluster.recompute_size();
    cluster.schedule(TodoFlags::UPDATE_STATE);
    gossip::flush_config_with_fsync(cluster);

    let header = gossip::build_header(state, cluster, MsgType::Pong).await;
    gossip::broadcast_packet(
        cluster,
        &ClusterPacket::Full(header, MsgPayload::Gossip {
            entries: Vec::new(),
            extensions: Vec::new(),
        }),
    );
}

// --- Manual failover ---

/// Replica-side entry: `CLUSTER FAILOVER [FORCE|TAKEOVER]`.
pub async fn start_manual_failover(
    state: &Arc<ServerState>,
    cluster: &Arc<ClusterState>,
    force: bool,
    takeover: bool,
) -> Result<(), crate::core::QuartzError> {
    let myself = cluster.myself_info();
    if !myself.is_replica() || myself.replica_of.is_none() {
        return Err(crate::core::QuartzError::InvalidState(
            "only replicas can start a manual failover".into(),
        ));
    }

    if takeover {
        // No election, no agreement: claim the shard unilaterally.
        warn!("Manual failover with TAKEOVER: promoting without election.");
        let epoch = epoch::bump_epoch_without_consensus(cluster);
        {
            let mut election = cluster.election.lock();
            election.auth_epoch = epoch;
            election.auth_sent = true;
        }
        promote_after_election(state, cluster).await;
        return Ok(());
    }

    {
        let mut mf = cluster.manual_failover.lock();
        if mf.in_progress() {
            return Err(crate::core::QuartzError::InvalidState(
                "a manual failover is already in progress".into(),
            ));
        }
        mf.end_time = now_ms() + MF_TIMEOUT_MS;
        mf.can_start = force;
        mf.primary_offset = None;
        mf.replica = None;
    }

    if force {
        // The primary may be unreachable; skip the offset handshake and let
        // FORCEACK satisfy the voters.
        info!("Manual failover with FORCE: skipping the offset handshake.");
        return Ok(());
    }

    let primary_id = myself.replica_of.expect("checked above");
    info!("Manual failover requested; asking primary {primary_id} to pause writes.");
    let header = gossip::build_header(state, cluster, MsgType::MfStart).await;
    if !gossip::send_packet_to_node(
        cluster,
        &primary_id,
        &ClusterPacket::Full(header, MsgPayload::Empty),
    ) {
        cluster.manual_failover.lock().reset();
        return Err(crate::core::QuartzError::Cluster(
            "primary is not reachable over the cluster bus".into(),
        ));
    }
    Ok(())
}

/// Primary-side MFSTART handling: freeze writes and start advertising the
/// frozen offset with the PAUSED flag to the designated replica.
pub async fn handle_mfstart(state: &Arc<ServerState>, cluster: &Arc<ClusterState>, sender: &str) {
    let is_my_replica = cluster
        .myself()
        .info
        .replicas
        .iter()
        .any(|id| id == sender);
    if !is_my_replica {
        warn!("Ignoring MFSTART from {sender}: not one of our replicas.");
        return;
    }
    info!("Manual failover requested by replica {sender}; pausing writes.");
    {
        let mut mf = cluster.manual_failover.lock();
        mf.end_time = now_ms() + MF_TIMEOUT_MS;
        mf.replica = Some(sender.to_string());
        mf.primary_offset = None;
        mf.can_start = false;
    }
    state.pause_writes(now_ms() + MF_TIMEOUT_MS * MF_PAUSE_MULT);
    // Offsets converge faster when replicas report immediately.
    crate::core::replication::request_acks(state);
}

/// Replica-side: a ping from our paused primary carries the offset we must
/// reach before forcing the election.
pub async fn observe_pause_flag(
    state: &Arc<ServerState>,
    cluster: &Arc<ClusterState>,
    header: &MsgHeader,
) {
    if !header.mflags.contains(MsgFlags::PAUSED) {
        return;
    }
    if cluster.my_primary_id().as_deref() != Some(header.sender.as_str()) {
        return;
    }
    let mut mf = cluster.manual_failover.lock();
    if mf.in_progress() && mf.primary_offset.is_none() {
        info!(
            "Primary paused for manual failover at offset {}",
            header.offset
        );
        mf.primary_offset = Some(header.offset);
    }
    let _ = state;
}

// --- Replica migration ---

/// Considers re-parenting this replica to an orphaned primary: a primary
/// with slots, no healthy replicas, and the MIGRATE_TO marker. Only the
/// cluster-wide designated candidate moves, and only if its own primary
/// keeps more than `migration_barrier` healthy replicas.
pub async fn replica_migration_cron(state: &Arc<ServerState>, cluster: &Arc<ClusterState>) {
    let (allow_migration, migration_barrier) = {
        let config = state.config.lock().await;
        (
            config.cluster.allow_replica_migration,
            config.cluster.migration_barrier,
        )
    };
    if !allow_migration {
        return;
    }
    let myself = cluster.myself_info();
    if !myself.is_replica() {
        return;
    }
    let Some(my_primary) = myself.replica_of.clone() else {
        return;
    };

    let now = now_ms();
    let mut orphans: Vec<String> = Vec::new();
    let mut max_healthy = 0usize;

    let primaries: Vec<String> = cluster
        .registry
        .nodes
        .iter()
        .filter(|e| e.value().info.is_primary())
        .map(|e| e.key().clone())
        .collect();

    for primary_id in &primaries {
        let healthy = healthy_replica_count(cluster, primary_id);
        max_healthy = max_healthy.max(healthy);

        let (is_orphan_candidate, orphaned_since) = {
            let Some(rt) = cluster.registry.get(primary_id) else {
                continue;
            };
            let candidate = healthy == 0
                && rt.info.num_slots > 0
                && !rt.info.flags.contains(NodeFlags::FAIL)
                && rt.info.flags.contains(NodeFlags::MIGRATE_TO);
            (candidate, rt.orphaned_time)
        };

        if is_orphan_candidate {
            if orphaned_since == 0 {
                if let Some(mut rt) = cluster.registry.get_mut(primary_id) {
                    rt.orphaned_time = now;
                }
            } else if now.saturating_sub(orphaned_since) >= REPLICA_MIGRATION_DELAY_MS {
                orphans.push(primary_id.clone());
            }
        } else if orphaned_since != 0
            && let Some(mut rt) = cluster.registry.get_mut(primary_id)
        {
            rt.orphaned_time = 0;
        }
    }

    if orphans.is_empty() {
        return;
    }

    // The single cluster-wide candidate: the lexicographically smallest
    // healthy replica among the primaries with the most healthy replicas.
    let mut candidate = cluster.my_id.clone();
    for primary_id in &primaries {
        if healthy_replica_count(cluster, primary_id) != max_healthy {
            continue;
        }
        let replicas = cluster
            .registry
            .get(primary_id)
            .map(|rt| rt.info.replicas.clone())
            .unwrap_or_default();
        for replica in replicas {
            let healthy = cluster
                .registry
                .get(&replica)
                .is_some_and(|rt| !rt.info.is_failing());
            if healthy && replica.as_str() < candidate.as_str() {
                candidate = replica;
            }
        }
    }
    if candidate != cluster.my_id {
        return;
    }
    if healthy_replica_count(cluster, &my_primary) <= migration_barrier {
        return;
    }

    let target = orphans[0].clone();
    info!(
        "Migrating to orphaned primary {target} (our primary keeps {} healthy replicas).",
        healthy_replica_count(cluster, &my_primary)
    );
    cluster.set_myself_replica_of(&target);
    cluster.schedule_save(true);

    let addr = cluster
        .registry
        .get(&target)
        .map(|rt| (rt.info.ip.clone(), rt.info.port));
    if let Some((host, port)) = addr {
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

fn healthy_replica_count(cluster: &Arc<ClusterState>, primary_id: &str) -> usize {
    let replicas = cluster
        .registry
        .get(primary_id)
        .map(|rt| rt.info.replicas.clone())
        .unwrap_or_default();
    replicas
        .iter()
        .filter(|id| {
            cluster
                .registry
                .get(id.as_str())
                .is_some_and(|rt| !rt.info.is_failing())
        })
        .count()
}

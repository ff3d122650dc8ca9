// src/core/cluster/gossip.rs

//! Implements the cluster gossip protocol for node discovery, state
//! propagation, and failure detection: periodic peer pinging with random
//! gossip sections, reconnection, and the PFAIL -> FAIL promotion driven by
//! accumulated failure reports.

use crate::core::cluster::epoch;
use crate::core::cluster::failover;
use crate::core::cluster::link::{self, ClusterLink};
use crate::core::cluster::message::{
    ClusterPacket, GossipEntry, MsgFlags, MsgHeader, MsgPayload, MsgType, PingExt,
};
use crate::core::cluster::node::{
    ClusterNode, FAIL_UNDO_TIME_MULT, NODE_ID_LEN, NodeFlags, NodeRuntime,
};
use crate::core::cluster::persistence;
use crate::core::cluster::state::{ClusterState, TodoFlags};
use crate::core::now_ms;
use crate::core::state::ServerState;
use bytes::Bytes;
use rand::seq::IteratorRandom;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, error, info, warn};

/// The cron cadence driving reconnects, pings, failover timing, and trims.
const CRON_INTERVAL: Duration = Duration::from_millis(100);

/// Every this many cron ticks, one random sampled peer gets pinged.
const PING_SAMPLE_EVERY_TICKS: u64 = 10;

/// Size of the random sample from which the stalest peer is pinged.
const PING_SAMPLE_SIZE: usize = 5;

/// The main entry point for the cluster bus background task: binds the bus
/// listener and drives the once-per-100ms cron.
pub async fn run(state: Arc<ServerState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let Some(cluster) = state.cluster.clone() else {
        return;
    };
    let bus_port = {
        let config = state.config.lock().await;
        config.bus_port()
    };
    let bind_addr = format!("0.0.0.0:{bus_port}");
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind cluster bus on port {bus_port}: {e}");
            return;
        }
    };
    info!("Cluster bus listening on port {bus_port}.");

    let mut cron_tick = time::interval(CRON_INTERVAL);
    let mut tick: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Cluster bus worker shutting down.");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted cluster bus connection from {peer}");
                        stream.set_nodelay(true).ok();
                        link::spawn_link(state.clone(), stream, true, None);
                    }
                    Err(e) => warn!("Cluster bus accept failed: {e}"),
                }
            }
            _ = cron_tick.tick() => {
                tick += 1;
                cron(&state, &cluster, tick).await;
            }
        }
    }
}

/// One 100ms cron pass.
async fn cron(state: &Arc<ServerState>, cluster: &Arc<ClusterState>, tick: u64) {
    let (node_timeout, ping_interval) = {
        let config = state.config.lock().await;
        (
            config.cluster.node_timeout,
            config.cluster.effective_ping_interval(),
        )
    };
    let now = now_ms();

    drop_timed_out_handshakes(cluster, node_timeout);
    reconnect_disconnected_nodes(state, cluster).await;

    // Sampled ping: every 10th tick, ping the stalest of a few random peers.
    if tick % PING_SAMPLE_EVERY_TICKS == 0 {
        let candidate = {
            let mut rng = rand::thread_rng();
            cluster
                .registry
                .nodes
                .iter()
                .filter(|e| {
                    let rt = e.value();
                    !rt.info.flags.intersects(NodeFlags::MYSELF | NodeFlags::HANDSHAKE)
                        && rt.ping_sent == 0
                        && rt.link.is_some()
                })
                .choose_multiple(&mut rng, PING_SAMPLE_SIZE)
                .into_iter()
                .min_by_key(|e| e.value().pong_received)
                .map(|e| e.key().clone())
        };
        if let Some(node_id) = candidate {
            send_ping(state, cluster, &node_id, MsgType::Ping).await;
        }
    }

    // Unconditional ping for peers silent past the ping interval.
    let stale: Vec<String> = cluster
        .registry
        .nodes
        .iter()
        .filter(|e| {
            let rt = e.value();
            !rt.info.flags.intersects(NodeFlags::MYSELF | NodeFlags::HANDSHAKE)
                && rt.link.is_some()
                && rt.ping_sent == 0
                && now.saturating_sub(rt.pong_received) > ping_interval
        })
        .map(|e| e.key().clone())
        .collect();
    for node_id in stale {
        send_ping(state, cluster, &node_id, MsgType::Ping).await;
    }

    // The manual-failover peer is pinged every tick so the PAUSED flag and
    // the frozen offset reach it promptly.
    let mf_target = cluster.manual_failover.lock().replica.clone();
    if let Some(target) = mf_target
        && cluster.manual_failover.lock().in_progress()
    {
        send_ping(state, cluster, &target, MsgType::Ping).await;
    }

    failure_detection(state, cluster, node_timeout).await;
    failover::cron(state, cluster).await;
    if tick % PING_SAMPLE_EVERY_TICKS == 0 {
        failover::replica_migration_cron(state, cluster).await;
    }

    state.backlog.trim();

    cluster.recompute_size();
    let todo = cluster.take_todo();
    if todo.contains(TodoFlags::UPDATE_STATE) || tick % PING_SAMPLE_EVERY_TICKS == 0 {
        cluster.update_state();
    }
    if todo.contains(TodoFlags::SAVE_CONFIG) {
        if let Err(e) = persistence::save_config(cluster, todo.contains(TodoFlags::FSYNC_CONFIG)) {
            // Losing the ability to persist cluster state is fatal; a node
            // that cannot remember epochs must not keep voting.
            error!("FATAL: cannot save cluster config: {e}");
            std::process::exit(1);
        }
    }
}

/// Removes nodes stuck in the handshake state past the handshake timeout.
fn drop_timed_out_handshakes(cluster: &Arc<ClusterState>, node_timeout: u64) {
    let handshake_timeout = node_timeout.max(1000);
    let now = now_ms();
    let expired: Vec<String> = cluster
        .registry
        .nodes
        .iter()
        .filter(|e| {
            e.value().info.flags.contains(NodeFlags::HANDSHAKE)
                && now.saturating_sub(e.value().ctime) > handshake_timeout
        })
        .map(|e| e.key().clone())
        .collect();
    for id in expired {
        warn!("Handshake with {id} timed out; dropping node.");
        cluster.registry.remove(&id);
    }
}

/// Opens outbound links to every known node lacking one.
async fn reconnect_disconnected_nodes(state: &Arc<ServerState>, cluster: &Arc<ClusterState>) {
    let targets: Vec<(String, String, bool)> = cluster
        .registry
        .nodes
        .iter()
        .filter(|e| {
            let rt = e.value();
            rt.link.is_none()
                && !rt.info.flags.intersects(NodeFlags::MYSELF | NodeFlags::NOADDR)
                && rt.info.bus_port != 0
        })
        .map(|e| {
            (
                e.key().clone(),
                format!("{}:{}", e.value().info.ip, e.value().info.bus_port),
                e.value().info.flags.contains(NodeFlags::MEET),
            )
        })
        .collect();

    for (node_id, addr, is_meet) in targets {
        let state = state.clone();
        let cluster = cluster.clone();
        tokio::spawn(async move {
            match link::connect_link(state.clone(), &addr, node_id.clone()).await {
                Ok(new_link) => {
                    if let Some(mut rt) = cluster.registry.get_mut(&node_id) {
                        rt.link = Some(new_link);
                    } else {
                        return;
                    }
                    let mtype = if is_meet { MsgType::Meet } else { MsgType::Ping };
                    send_ping(&state, &cluster, &node_id, mtype).await;
                    if is_meet
                        && let Some(mut rt) = cluster.registry.get_mut(&node_id)
                    {
                        rt.info.flags.remove(NodeFlags::MEET);
                    }
                }
                Err(e) => {
                    debug!("Connect to {addr} failed: {e}");
                    // Arm the failure detector even though no ping went out.
                    if let Some(mut rt) = cluster.registry.get_mut(&node_id)
                        && rt.ping_sent == 0
                    {
                        rt.ping_sent = now_ms();
                    }
                }
            }
        });
    }
}

/// PFAIL marking plus the report-driven PFAIL -> FAIL promotion.
async fn failure_detection(
    state: &Arc<ServerState>,
    cluster: &Arc<ClusterState>,
    node_timeout: u64,
) {
    let now = now_ms();
    let mut newly_pfail = Vec::new();
    let mut drop_links = Vec::new();

    for mut entry in cluster.registry.nodes.iter_mut() {
        let rt = entry.value_mut();
        if rt
            .info
            .flags
            .intersects(NodeFlags::MYSELF | NodeFlags::HANDSHAKE | NodeFlags::NOADDR)
        {
            continue;
        }

        // A half-dead link is torn down early so the reconnect path gets a
        // fresh chance before the node is declared suspect.
        if let Some(l) = &rt.link
            && rt.ping_sent != 0
            && now.saturating_sub(rt.ping_sent) > node_timeout / 2
            && now.saturating_sub(rt.data_received) > node_timeout / 2
        {
            l.mark_dead();
            drop_links.push(rt.info.id.clone());
        }

        if rt.ping_sent == 0 {
            continue;
        }
        let ping_delay = now.saturating_sub(rt.ping_sent);
        let data_delay = now.saturating_sub(rt.data_received);
        if ping_delay.min(data_delay) > node_timeout
            && !rt.info.flags.intersects(NodeFlags::PFAIL | NodeFlags::FAIL)
        {
            rt.info.flags.insert(NodeFlags::PFAIL);
            newly_pfail.push(rt.info.id.clone());
        }
    }

    for id in drop_links {
        if let Some(mut rt) = cluster.registry.get_mut(&id) {
            rt.link = None;
        }
    }
    for id in newly_pfail {
        info!("Marking node {id} as PFAIL (no response within node timeout)");
        cluster.schedule(TodoFlags::UPDATE_STATE);
        mark_node_failing_if_needed(state, cluster, &id, node_timeout).await;
    }
}

/// Promotes a PFAIL node to FAIL once a quorum of voting primaries reported
/// it, then broadcasts the FAIL message.
pub async fn mark_node_failing_if_needed(
    state: &Arc<ServerState>,
    cluster: &Arc<ClusterState>,
    node_id: &str,
    node_timeout: u64,
) {
    let quorum = cluster.quorum();
    let myself_is_voter = cluster.myself().info.is_voting_primary();

    let promote = {
        let Some(mut rt) = cluster.registry.get_mut(node_id) else {
            return;
        };
        if !rt.info.flags.contains(NodeFlags::PFAIL) || rt.info.flags.contains(NodeFlags::FAIL) {
            return;
        }
        let mut reports = rt.expire_fail_reports(node_timeout);
        if myself_is_voter {
            reports += 1;
        }
        if reports >= quorum {
            rt.info.flags.remove(NodeFlags::PFAIL);
            rt.info.flags.insert(NodeFlags::FAIL);
            rt.fail_time = now_ms();
            true
        } else {
            false
        }
    };

    if promote {
        warn!("Marking node {node_id} as FAIL (quorum of failure reports reached)");
        cluster.schedule(TodoFlags::UPDATE_STATE);
        cluster.schedule_save(false);
        let packet = ClusterPacket::Full(
            build_header(state, cluster, MsgType::Fail).await,
            MsgPayload::Fail {
                node_id: node_id.to_string(),
            },
        );
        broadcast_packet(cluster, &packet);
    }
}

/// Revokes a FAIL flag when the node is reachable again and the conditions
/// allow it: immediately for non-voters, after the undo window for primaries
/// that still appear to serve their slots.
fn clear_node_fail_if_needed(cluster: &Arc<ClusterState>, node_id: &str, node_timeout: u64) {
    let Some(mut rt) = cluster.registry.get_mut(node_id) else {
        return;
    };
    if !rt.info.flags.contains(NodeFlags::FAIL) {
        return;
    }
    let is_voter = rt.info.is_voting_primary();
    let elapsed = now_ms().saturating_sub(rt.fail_time);
    if !is_voter || elapsed > node_timeout * FAIL_UNDO_TIME_MULT {
        info!("Node {node_id} is reachable again; clearing FAIL flag.");
        rt.info.flags.remove(NodeFlags::FAIL);
        drop(rt);
        cluster.schedule(TodoFlags::UPDATE_STATE);
        cluster.schedule_save(false);
    }
}

/// Detaches a failed link from its node so cron reconnects it.
pub fn handle_link_failure(state: &Arc<ServerState>, failed: &Arc<ClusterLink>) {
    let Some(cluster) = state.cluster.as_ref() else {
        return;
    };
    let Some(node_id) = failed.node_id.lock().clone() else {
        return;
    };
    if let Some(mut rt) = cluster.registry.get_mut(&node_id) {
        if rt
            .link
            .as_ref()
            .is_some_and(|l| Arc::ptr_eq(l, failed))
        {
            rt.link = None;
        }
        if rt
            .inbound_link
            .as_ref()
            .is_some_and(|l| Arc::ptr_eq(l, failed))
        {
            rt.inbound_link = None;
        }
    }
}

// --- Outgoing messages ---

/// Builds the fixed header for an outgoing full message.
pub async fn build_header(
    state: &Arc<ServerState>,
    cluster: &Arc<ClusterState>,
    mtype: MsgType,
) -> MsgHeader {
    let myself = cluster.myself_info();
    let mut mflags = MsgFlags::empty();
    if state.writes_paused() && cluster.manual_failover.lock().in_progress() {
        mflags |= MsgFlags::PAUSED;
    }
    // A replica advertises its primary's slot claim and epoch context.
    let (config_epoch, slots) = if myself.is_replica() {
        let primary = myself
            .replica_of
            .as_deref()
            .and_then(|id| cluster.registry.get(id).map(|rt| rt.info.clone()));
        match primary {
            Some(p) => (p.config_epoch, p.slots.clone()),
            None => (myself.config_epoch, myself.slots.clone()),
        }
    } else {
        (myself.config_epoch, myself.slots.clone())
    };
    let offset = if myself.is_primary() {
        state.replication.get_offset()
    } else {
        state
            .replication
            .primary_link
            .lock()
            .await
            .as_ref()
            .map_or(0, |info| info.processed_offset)
    };
    MsgHeader {
        mtype,
        port: myself.port,
        pport: myself.tls_port,
        cport: myself.bus_port,
        current_epoch: cluster.current_epoch.load(Ordering::Acquire),
        config_epoch,
        offset,
        sender: myself.id.clone(),
        myslots: slots,
        replicaof: myself.replica_of.clone(),
        myip: myself.ip.clone(),
        sender_flags: myself.flags & !NodeFlags::MYSELF
            | NodeFlags::EXTENSIONS_SUPPORTED
            | NodeFlags::LIGHT_HDR_SUPPORTED,
        state_ok: cluster.state_ok.load(Ordering::Acquire),
        mflags,
    }
}

/// Chooses the gossip section for an outgoing ping: a bounded random sample
/// plus every PFAIL node, never repeating a node within one generation.
fn select_gossip_entries(cluster: &Arc<ClusterState>) -> Vec<GossipEntry> {
    let known = cluster.registry.len();
    let wanted = 3.max((known / 10).min(known.saturating_sub(2)));
    let generation = cluster.gossip_generation.fetch_add(1, Ordering::AcqRel) + 1;

    let eligible = |rt: &NodeRuntime| {
        !rt.info
            .flags
            .intersects(NodeFlags::MYSELF | NodeFlags::HANDSHAKE | NodeFlags::NOADDR)
            && !(rt.link.is_none() && rt.info.num_slots == 0)
    };

    let mut entries = Vec::with_capacity(wanted + 4);
    {
        let mut rng = rand::thread_rng();
        for _ in 0..(3 * wanted) {
            if entries.len() >= wanted {
                break;
            }
            let picked = cluster
                .registry
                .nodes
                .iter()
                .choose(&mut rng)
                .map(|e| e.key().clone());
            let Some(id) = picked else { break };
            let Some(mut rt) = cluster.registry.get_mut(&id) else {
                continue;
            };
            if rt.last_gossip_gen == generation || !eligible(rt.value()) {
                continue;
            }
            rt.last_gossip_gen = generation;
            entries.push(gossip_entry_for(rt.value()));
        }
    }

    // All PFAIL nodes ride along so failure reports converge fast.
    for mut entry in cluster.registry.nodes.iter_mut() {
        let rt = entry.value_mut();
        if rt.info.flags.contains(NodeFlags::PFAIL)
            && rt.last_gossip_gen != generation
            && !rt.info.flags.intersects(NodeFlags::HANDSHAKE | NodeFlags::NOADDR)
        {
            rt.last_gossip_gen = generation;
            entries.push(gossip_entry_for(rt));
        }
    }
    entries
}

fn gossip_entry_for(rt: &NodeRuntime) -> GossipEntry {
    GossipEntry {
        node_id: rt.info.id.clone(),
        ping_sent_secs: (rt.ping_sent / 1000) as u32,
        pong_received_secs: (rt.pong_received / 1000) as u32,
        ip: rt.info.ip.clone(),
        port: rt.info.port,
        cport: rt.info.bus_port,
        flags: rt.info.flags & !NodeFlags::MYSELF,
        pport: rt.info.tls_port,
    }
}

/// Builds the extension list advertised with our pings.
fn build_ping_extensions(cluster: &Arc<ClusterState>) -> Vec<PingExt> {
    let myself = cluster.myself_info();
    let mut exts = vec![PingExt::ShardId(myself.shard_id.clone())];
    if !myself.hostname.is_empty() {
        exts.push(PingExt::Hostname(myself.hostname.clone()));
    }
    if !myself.human_name.is_empty() {
        exts.push(PingExt::HumanNodename(myself.human_name.clone()));
    }
    if let Some(ip) = myself.client_ipv4 {
        exts.push(PingExt::ClientIpv4(ip));
    }
    if let Some(ip) = myself.client_ipv6 {
        exts.push(PingExt::ClientIpv6(ip));
    }
    for (id, ttl_ms) in cluster.registry.blacklist_entries() {
        exts.push(PingExt::ForgottenNode { id, ttl_ms });
    }
    exts
}

/// Sends a PING/MEET (or an unsolicited PONG) to one node.
pub async fn send_ping(
    state: &Arc<ServerState>,
    cluster: &Arc<ClusterState>,
    node_id: &str,
    mtype: MsgType,
) {
    let header = build_header(state, cluster, mtype).await;
    let payload = MsgPayload::Gossip {
        entries: select_gossip_entries(cluster),
        extensions: build_ping_extensions(cluster),
    };
    let packet = ClusterPacket::Full(header, payload);
    if send_packet_to_node(cluster, node_id, &packet)
        && matches!(mtype, MsgType::Ping | MsgType::Meet)
        && let Some(mut rt) = cluster.registry.get_mut(node_id)
        && rt.ping_sent == 0
    {
        rt.ping_sent = now_ms();
    }
}

/// Sends an already-built packet to one node over whatever link is up.
pub fn send_packet_to_node(
    cluster: &Arc<ClusterState>,
    node_id: &str,
    packet: &ClusterPacket,
) -> bool {
    let Some(rt) = cluster.registry.get(node_id) else {
        return false;
    };
    let link = rt.link.clone().or_else(|| rt.inbound_link.clone());
    drop(rt);
    let Some(link) = link else {
        return false;
    };
    let sent = link.send_packet(packet);
    if sent {
        cluster.stats_msg_sent[packet.mtype() as usize].fetch_add(1, Ordering::Relaxed);
    }
    sent
}

/// Encodes once and fans the frame out to every connected peer.
pub fn broadcast_packet(cluster: &Arc<ClusterState>, packet: &ClusterPacket) {
    let frame = Arc::new(packet.encode());
    let mut sent = 0u64;
    for entry in cluster.registry.nodes.iter() {
        let rt = entry.value();
        if rt.info.flags.intersects(NodeFlags::MYSELF | NodeFlags::HANDSHAKE) {
            continue;
        }
        if let Some(l) = rt.link.clone().or_else(|| rt.inbound_link.clone())
            && l.send(frame.clone())
        {
            sent += 1;
        }
    }
    cluster.stats_msg_sent[packet.mtype() as usize].fetch_add(sent, Ordering::Relaxed);
}

/// Broadcasts a PONG to the members of our shard, letting sibling replicas
/// recompute their failover ranks from our fresh offset.
pub async fn broadcast_pong_to_shard(state: &Arc<ServerState>, cluster: &Arc<ClusterState>) {
    let header = build_header(state, cluster, MsgType::Pong).await;
    let packet = ClusterPacket::Full(header, MsgPayload::Gossip {
        entries: Vec::new(),
        extensions: Vec::new(),
    });
    let shard = cluster.myself_info().shard_id;
    for member in cluster.registry.shard_members(&shard) {
        if member != cluster.my_id {
            send_packet_to_node(cluster, &member, &packet);
        }
    }
}

/// Propagates a pub/sub message across the bus. Sharded messages only reach
/// the owning shard; plain messages reach everyone. Peers that understand
/// the light header get the slim frame.
pub async fn broadcast_publish(
    state: &Arc<ServerState>,
    channel: Bytes,
    message: Bytes,
    sharded: bool,
) {
    let Some(cluster) = state.cluster.clone() else {
        return;
    };
    let mtype = if sharded {
        MsgType::PublishShard
    } else {
        MsgType::Publish
    };
    let payload = MsgPayload::Publish { channel, message };
    let light = Arc::new(
        ClusterPacket::Light {
            mtype,
            payload: payload.clone(),
        }
        .encode(),
    );
    let full = Arc::new(
        ClusterPacket::Full(build_header(state, &cluster, mtype).await, payload).encode(),
    );

    let targets: Vec<String> = if sharded {
        cluster
            .registry
            .shard_members(&cluster.myself_info().shard_id)
            .into_iter()
            .filter(|id| *id != cluster.my_id)
            .collect()
    } else {
        cluster
            .registry
            .nodes
            .iter()
            .filter(|e| !e.value().info.is_myself())
            .map(|e| e.key().clone())
            .collect()
    };

    for node_id in targets {
        let Some(rt) = cluster.registry.get(&node_id) else {
            continue;
        };
        let use_light = rt.info.flags.contains(NodeFlags::LIGHT_HDR_SUPPORTED);
        let link = rt.link.clone().or_else(|| rt.inbound_link.clone());
        drop(rt);
        if let Some(l) = link {
            l.send(if use_light { light.clone() } else { full.clone() });
            cluster.stats_msg_sent[mtype as usize].fetch_add(1, Ordering::Relaxed);
        }
    }
}

// --- Incoming messages ---

/// Central dispatch for a decoded bus frame, invoked by the link reader.
pub async fn process_packet(state: &Arc<ServerState>, from: &Arc<ClusterLink>, packet: ClusterPacket) {
    let Some(cluster) = state.cluster.clone() else {
        return;
    };
    let node_timeout = state.config.lock().await.cluster.node_timeout;
    cluster.stats_msg_received[packet.mtype() as usize].fetch_add(1, Ordering::Relaxed);

    match packet {
        ClusterPacket::Light { mtype, payload } => {
            if let MsgPayload::Publish { channel, message } = payload {
                state
                    .pubsub
                    .publish(&channel, message, mtype == MsgType::PublishShard);
            }
        }
        ClusterPacket::Full(header, payload) => {
            process_full_packet(state, &cluster, from, header, payload, node_timeout).await;
        }
    }
}

async fn process_full_packet(
    state: &Arc<ServerState>,
    cluster: &Arc<ClusterState>,
    from: &Arc<ClusterLink>,
    header: MsgHeader,
    payload: MsgPayload,
    node_timeout: u64,
) {
    if header.sender.len() != NODE_ID_LEN {
        from.mark_dead();
        return;
    }

    // An outbound link is pinned to one peer id; a reply under a different
    // id is a link-fatal identity mismatch (except during handshake, where
    // the provisional node is renamed to its real id).
    let link_node_id = from.node_id.lock().clone();
    if let Some(expected) = &link_node_id
        && *expected != header.sender
    {
        let is_handshake = cluster
            .registry
            .get(expected)
            .is_some_and(|rt| rt.info.flags.contains(NodeFlags::HANDSHAKE));
        if is_handshake {
            complete_handshake(cluster, expected.clone(), &header);
            *from.node_id.lock() = Some(header.sender.clone());
        } else {
            warn!(
                "Peer replied with id {} but link belongs to {expected}; freeing link.",
                header.sender
            );
            from.mark_dead();
            return;
        }
    }

    let sender_known = cluster.registry.contains(&header.sender);

    // A MEET from a stranger introduces it into the registry.
    if !sender_known && header.mtype == MsgType::Meet {
        if cluster.registry.blacklist_contains(&header.sender) {
            debug!("Ignoring MEET from blacklisted node {}", header.sender);
            return;
        }
        let mut node = ClusterNode::new(header.sender.clone(), NodeFlags::empty());
        node.ip = header.myip.clone();
        node.port = header.port;
        node.tls_port = header.pport;
        node.bus_port = header.cport;
        apply_role_flags(&mut node, header.sender_flags);
        info!("Learned new node {} via MEET", header.sender);
        cluster.registry.insert(NodeRuntime::new(node));
        cluster.schedule_save(false);
    }

    // Book-keeping for a known, identified sender.
    if cluster.registry.contains(&header.sender) {
        if let Some(mut rt) = cluster.registry.get_mut(&header.sender) {
            rt.data_received = now_ms();
            if rt.inbound_link.is_none() && from.inbound {
                *from.node_id.lock() = Some(header.sender.clone());
                rt.inbound_link = Some(from.clone());
            }
            rt.info.repl_offset = header.offset;
            rt.repl_offset_time = now_ms();
        }
        cluster.observe_epoch(header.current_epoch);
        update_sender_config(state, cluster, &header, node_timeout).await;
    }

    match (header.mtype, payload) {
        (MsgType::Ping | MsgType::Meet, MsgPayload::Gossip { entries, extensions }) => {
            process_gossip_section(state, cluster, &header, &entries, node_timeout).await;
            process_extensions(cluster, &header.sender, extensions);
            // Reply with a PONG carrying our own gossip.
            let reply_header = build_header(state, cluster, MsgType::Pong).await;
            let reply = ClusterPacket::Full(reply_header, MsgPayload::Gossip {
                entries: select_gossip_entries(cluster),
                extensions: build_ping_extensions(cluster),
            });
            flush_pending_config(cluster);
            if from.send_packet(&reply) {
                cluster.stats_msg_sent[MsgType::Pong as usize].fetch_add(1, Ordering::Relaxed);
            }
        }
        (MsgType::Pong, MsgPayload::Gossip { entries, extensions }) => {
            if let Some(mut rt) = cluster.registry.get_mut(&header.sender) {
                rt.pong_received = now_ms();
                rt.ping_sent = 0;
                if rt.info.flags.contains(NodeFlags::PFAIL) {
                    info!("Node {} answered; clearing PFAIL.", header.sender);
                    rt.info.flags.remove(NodeFlags::PFAIL);
                    drop(rt);
                    cluster.schedule(TodoFlags::UPDATE_STATE);
                }
            }
            clear_node_fail_if_needed(cluster, &header.sender, node_timeout);
            failover::observe_pause_flag(state, cluster, &header).await;
            process_gossip_section(state, cluster, &header, &entries, node_timeout).await;
            process_extensions(cluster, &header.sender, extensions);
        }
        (MsgType::Fail, MsgPayload::Fail { node_id }) => {
            handle_remote_fail(cluster, &header.sender, &node_id);
        }
        (MsgType::Publish | MsgType::PublishShard, MsgPayload::Publish { channel, message }) => {
            state
                .pubsub
                .publish(&channel, message, header.mtype == MsgType::PublishShard);
        }
        (MsgType::Update, MsgPayload::Update { config_epoch, node_id, slots }) => {
            epoch::handle_update(state, cluster, &node_id, config_epoch, &slots).await;
        }
        (MsgType::FailoverAuthRequest, MsgPayload::Empty) => {
            failover::handle_auth_request(state, cluster, &header).await;
        }
        (MsgType::FailoverAuthAck, MsgPayload::Empty) => {
            failover::handle_auth_ack(state, cluster, &header).await;
        }
        (MsgType::MfStart, MsgPayload::Empty) => {
            failover::handle_mfstart(state, cluster, &header.sender).await;
        }
        (MsgType::Module, MsgPayload::Module { module_id, .. }) => {
            debug!("Ignoring module bus message from module id {module_id:#x}");
        }
        (mtype, _) => {
            warn!("Dropping bus frame with mismatched payload for {mtype}");
            from.mark_dead();
        }
    }
}

/// Persists the cluster config immediately with fsync. Epoch transitions
/// must hit disk before they are advertised.
pub fn flush_config_with_fsync(cluster: &Arc<ClusterState>) {
    if let Err(e) = persistence::save_config(cluster, true) {
        error!("FATAL: cannot save cluster config: {e}");
        std::process::exit(1);
    }
}

/// Writes pending config changes to disk before the reply leaves, so a slot
/// rebind is never advertised by a node that could forget it on crash.
fn flush_pending_config(cluster: &Arc<ClusterState>) {
    let todo = cluster.take_todo();
    if todo.contains(TodoFlags::SAVE_CONFIG) {
        if let Err(e) = persistence::save_config(cluster, todo.contains(TodoFlags::FSYNC_CONFIG)) {
            error!("FATAL: cannot save cluster config: {e}");
            std::process::exit(1);
        }
    }
    // Anything else stays scheduled for cron.
    cluster.schedule(todo & !(TodoFlags::SAVE_CONFIG | TodoFlags::FSYNC_CONFIG));
}

/// A completed handshake: the provisional node takes the peer's real id.
fn complete_handshake(cluster: &Arc<ClusterState>, provisional_id: String, header: &MsgHeader) {
    if cluster.registry.contains(&header.sender) {
        // Already known under its real id; the provisional twin is dropped.
        cluster.registry.remove(&provisional_id);
        return;
    }
    info!(
        "Handshake with {} complete; now known as {}",
        provisional_id, header.sender
    );
    cluster.registry.rename(&provisional_id, &header.sender);
    if let Some(mut rt) = cluster.registry.get_mut(&header.sender) {
        rt.info.flags.remove(NodeFlags::HANDSHAKE | NodeFlags::MEET);
        apply_role_flags(&mut rt.info, header.sender_flags);
    }
    cluster.schedule_save(false);
}

fn apply_role_flags(node: &mut ClusterNode, wire_flags: NodeFlags) {
    node.flags.remove(NodeFlags::PRIMARY | NodeFlags::REPLICA | NodeFlags::NOFAILOVER);
    node.flags |= wire_flags
        & (NodeFlags::PRIMARY
            | NodeFlags::REPLICA
            | NodeFlags::NOFAILOVER
            | NodeFlags::EXTENSIONS_SUPPORTED
            | NodeFlags::LIGHT_HDR_SUPPORTED);
}

/// Applies the sender's header: role transitions, shard membership, epochs,
/// slot claims, and epoch collisions.
async fn update_sender_config(
    state: &Arc<ServerState>,
    cluster: &Arc<ClusterState>,
    header: &MsgHeader,
    node_timeout: u64,
) {
    let sender_id = header.sender.clone();

    // Role transitions as seen by the sender itself.
    let previous = cluster
        .registry
        .get(&sender_id)
        .map(|rt| (rt.info.is_primary(), rt.info.replica_of.clone()));
    let Some((was_primary, old_primary)) = previous else {
        return;
    };

    if header.sender_flags.contains(NodeFlags::REPLICA) || header.replicaof.is_some() {
        let new_primary = header.replicaof.clone();
        if was_primary || old_primary != new_primary {
            demote_node_to_replica(cluster, &sender_id, new_primary.as_deref());
        }
    } else if header.sender_flags.contains(NodeFlags::PRIMARY) && !was_primary {
        info!("Node {sender_id} is now a primary.");
        if let Some(old_primary) = &old_primary
            && let Some(mut rt) = cluster.registry.get_mut(old_primary)
        {
            rt.info.remove_replica(&sender_id);
        }
        if let Some(mut rt) = cluster.registry.get_mut(&sender_id) {
            rt.info.flags.remove(NodeFlags::REPLICA);
            rt.info.flags.insert(NodeFlags::PRIMARY);
            rt.info.replica_of = None;
        }
        cluster.schedule_save(false);
        cluster.schedule(TodoFlags::UPDATE_STATE);
    }

    // Config epochs only move forward.
    if let Some(mut rt) = cluster.registry.get_mut(&sender_id)
        && header.config_epoch > rt.info.config_epoch
        && header.sender_flags.contains(NodeFlags::PRIMARY)
    {
        rt.info.config_epoch = header.config_epoch;
        drop(rt);
        cluster.schedule_save(true);
    }

    // Slot claims ride on primaries' headers (or a replica relaying its
    // primary's claim, where the epoch belongs to that primary).
    let claimer = if header.sender_flags.contains(NodeFlags::PRIMARY) {
        Some(sender_id.clone())
    } else {
        header.replicaof.clone()
    };
    if let Some(claimer) = claimer
        && !header.myslots.is_empty()
        && cluster.registry.contains(&claimer)
    {
        epoch::update_slots_from_claim(state, cluster, &claimer, header.config_epoch, &header.myslots)
            .await;
    }

    epoch::handle_epoch_collision(state, cluster, header).await;
    let _ = node_timeout;
}

fn demote_node_to_replica(cluster: &Arc<ClusterState>, node_id: &str, new_primary: Option<&str>) {
    let had_slots = {
        let Some(mut rt) = cluster.registry.get_mut(node_id) else {
            return;
        };
        let had_slots = rt.info.num_slots > 0;
        rt.info.flags.remove(NodeFlags::PRIMARY | NodeFlags::MIGRATE_TO);
        rt.info.flags.insert(NodeFlags::REPLICA);
        let old_primary = rt.info.replica_of.take();
        rt.info.replica_of = new_primary.map(|s| s.to_string());
        drop(rt);
        if let Some(old_primary) = old_primary
            && Some(old_primary.as_str()) != new_primary
            && let Some(mut old) = cluster.registry.get_mut(&old_primary)
        {
            old.info.remove_replica(node_id);
        }
        had_slots
    };
    if let Some(new_primary) = new_primary {
        if let Some(mut rt) = cluster.registry.get_mut(new_primary) {
            rt.info.add_replica(node_id);
            let shard = rt.info.shard_id.clone();
            drop(rt);
            cluster.registry.update_shard_id(node_id, &shard);
        }
    }
    // A demoted primary keeps no claims; its slots will be rebound by the
    // new owner's headers.
    if had_slots {
        let slots: Vec<u16> = cluster
            .registry
            .get(node_id)
            .map(|rt| rt.info.slots.iter_ones().collect())
            .unwrap_or_default();
        for slot in slots {
            if cluster.slot_owner(slot).as_deref() == Some(node_id) {
                let _ = cluster.del_slot(slot);
            }
        }
    }
    info!(
        "Node {node_id} demoted to replica of {}",
        new_primary.unwrap_or("<unknown>")
    );
    cluster.schedule_save(false);
    cluster.schedule(TodoFlags::UPDATE_STATE);
}

/// Walks the gossip section of a ping/pong, merging third-party state.
async fn process_gossip_section(
    state: &Arc<ServerState>,
    cluster: &Arc<ClusterState>,
    header: &MsgHeader,
    entries: &[GossipEntry],
    node_timeout: u64,
) {
    let sender_is_voter = cluster
        .registry
        .get(&header.sender)
        .is_some_and(|rt| rt.info.is_voting_primary());

    for entry in entries {
        if entry.node_id == cluster.my_id {
            continue;
        }
        let known = cluster.registry.contains(&entry.node_id);
        if known {
            // Failure reports only count from voting primaries.
            if sender_is_voter {
                if entry.flags.intersects(NodeFlags::PFAIL | NodeFlags::FAIL) {
                    let fresh = cluster
                        .registry
                        .get_mut(&entry.node_id)
                        .map(|mut rt| rt.add_fail_report(&header.sender))
                        .unwrap_or(false);
                    if fresh {
                        debug!(
                            "Failure report for {} from {}",
                            entry.node_id, header.sender
                        );
                    }
                    mark_node_failing_if_needed(state, cluster, &entry.node_id, node_timeout)
                        .await;
                } else if let Some(mut rt) = cluster.registry.get_mut(&entry.node_id)
                    && rt.remove_fail_report(&header.sender)
                {
                    debug!(
                        "Node {} reported healthy again by {}",
                        entry.node_id, header.sender
                    );
                }
            }

            maybe_update_address(state, cluster, entry).await;
        } else if !cluster.registry.blacklist_contains(&entry.node_id)
            && entry.node_id.len() == NODE_ID_LEN
            && !entry.flags.contains(NodeFlags::NOADDR)
        {
            let mut node = ClusterNode::new(entry.node_id.clone(), NodeFlags::empty());
            node.ip = entry.ip.clone();
            node.port = entry.port;
            node.tls_port = entry.pport;
            node.bus_port = entry.cport;
            apply_role_flags(&mut node, entry.flags);
            info!("Discovered new node {} via gossip", entry.node_id);
            cluster.registry.insert(NodeRuntime::new(node));
            cluster.schedule_save(false);
        }
    }
}

/// A healthy gossip source reporting a different address for a node we see
/// as failing replaces the address and drops the stale link.
async fn maybe_update_address(
    state: &Arc<ServerState>,
    cluster: &Arc<ClusterState>,
    entry: &GossipEntry,
) {
    let needs_update = {
        let Some(rt) = cluster.registry.get(&entry.node_id) else {
            return;
        };
        rt.info.flags.intersects(NodeFlags::PFAIL | NodeFlags::FAIL)
            && !entry.flags.intersects(NodeFlags::PFAIL | NodeFlags::FAIL)
            && !entry.ip.is_empty()
            && (rt.info.ip != entry.ip
                || rt.info.port != entry.port
                || rt.info.tls_port != entry.pport
                || rt.info.bus_port != entry.cport)
    };
    if !needs_update {
        return;
    }
    info!(
        "Address change for {}: now {}:{}@{}",
        entry.node_id, entry.ip, entry.port, entry.cport
    );
    let was_my_upstream = cluster.my_primary_id().as_deref() == Some(entry.node_id.as_str());
    {
        let Some(mut rt) = cluster.registry.get_mut(&entry.node_id) else {
            return;
        };
        rt.info.ip = entry.ip.clone();
        rt.info.port = entry.port;
        rt.info.tls_port = entry.pport;
        rt.info.bus_port = entry.cport;
        rt.info.flags.remove(NodeFlags::NOADDR);
        if let Some(l) = rt.link.take() {
            l.mark_dead();
        }
    }
    cluster.schedule_save(false);

    // If we replicate that node, re-point the replication target too.
    if was_my_upstream {
        let mut config = state.config.lock().await;
        if let crate::config::ReplicationConfig::Replica {
            primary_host,
            primary_port,
            ..
        } = &mut config.replication
        {
            *primary_host = entry.ip.clone();
            *primary_port = entry.port;
        }
        drop(config);
        let _ = state.replication_reconfigure_tx.send(());
    }
}

/// A FAIL message short-circuits the report quorum: the sender already
/// collected it.
fn handle_remote_fail(cluster: &Arc<ClusterState>, sender: &str, node_id: &str) {
    if !cluster.registry.contains(sender) || node_id == cluster.my_id {
        return;
    }
    let Some(mut rt) = cluster.registry.get_mut(node_id) else {
        return;
    };
    if rt.info.flags.contains(NodeFlags::FAIL) {
        return;
    }
    info!("FAIL message received from {sender} about {node_id}");
    rt.info.flags.remove(NodeFlags::PFAIL);
    rt.info.flags.insert(NodeFlags::FAIL);
    rt.fail_time = now_ms();
    drop(rt);
    cluster.schedule(TodoFlags::UPDATE_STATE);
    cluster.schedule_save(false);
}

/// Applies ping extensions attributed to the sender.
fn process_extensions(
    cluster: &Arc<ClusterState>,
    sender: &str,
    extensions: Vec<PingExt>,
) {
    for ext in extensions {
        match ext {
            PingExt::Hostname(hostname) => {
                if let Some(mut rt) = cluster.registry.get_mut(sender) {
                    rt.info.hostname = hostname;
                }
            }
            PingExt::HumanNodename(name) => {
                if let Some(mut rt) = cluster.registry.get_mut(sender) {
                    rt.info.human_name = name;
                }
            }
            PingExt::ShardId(shard_id) => {
                cluster.registry.update_shard_id(sender, &shard_id);
            }
            PingExt::ClientIpv4(ip) => {
                if let Some(mut rt) = cluster.registry.get_mut(sender) {
                    rt.info.client_ipv4 = Some(ip);
                }
            }
            PingExt::ClientIpv6(ip) => {
                if let Some(mut rt) = cluster.registry.get_mut(sender) {
                    rt.info.client_ipv6 = Some(ip);
                }
            }
            PingExt::ForgottenNode { id, ttl_ms } => {
                if id != cluster.my_id && id != sender && cluster.registry.contains(&id) {
                    info!("Peer {sender} gossiped FORGET of {id}; honoring it.");
                    cluster.registry.blacklist_add_with_ttl(&id, ttl_ms);
                    cluster.registry.remove(&id);
                    cluster.schedule_save(false);
                }
            }
        }
    }
}

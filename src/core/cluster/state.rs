// src/core/cluster/state.rs

//! The shared state of the cluster on this node: the node registry, the slot
//! ownership table with its migration overlays, epochs, and the election and
//! manual-failover bookkeeping.

use crate::core::QuartzError;
use crate::core::cluster::message::MSG_TYPE_COUNT;
use crate::core::cluster::node::{ClusterNode, NodeFlags, NodeRegistry, NodeRuntime};
use crate::core::cluster::persistence;
use crate::core::cluster::slot::{NUM_SLOTS, SlotBitmap};
use crate::core::now_ms;
use crate::config::Config;
use bitflags::bitflags;
use dashmap::DashMap;
use dashmap::mapref::one::Ref;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tracing::{info, warn};

bitflags! {
    /// Deferred work accumulated during packet processing, drained by the
    /// next cron tick.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TodoFlags: u32 {
        const SAVE_CONFIG     = 1 << 0;
        const FSYNC_CONFIG    = 1 << 1;
        const UPDATE_STATE    = 1 << 2;
        const HANDLE_FAILOVER = 1 << 3;
    }
}

/// Why the failover cron last declined to start or advance an election.
/// Surfaced through the cluster summary for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailoverSkipReason {
    #[default]
    None,
    NotReplica,
    UpstreamHealthy,
    DataAge,
    WaitingDelay,
    WaitingVotes,
    ExpiredElection,
}

/// Replica-side election bookkeeping.
#[derive(Debug, Default)]
pub struct ElectionState {
    /// When the current election may fire, ms. 0 = no election scheduled.
    pub auth_time: u64,
    /// Votes received so far, including our own intent.
    pub auth_count: usize,
    /// Whether the AUTH_REQ broadcast for this window already went out.
    pub auth_sent: bool,
    pub auth_rank: usize,
    /// The epoch this election is running under.
    pub auth_epoch: u64,
    pub cant_failover_reason: FailoverSkipReason,
}

impl ElectionState {
    pub fn reset(&mut self) {
        *self = ElectionState::default();
    }
}

/// Manual failover coordination, used on both the pausing primary and the
/// promoting replica.
#[derive(Debug, Default)]
pub struct ManualFailoverState {
    /// Deadline for the whole procedure, ms. 0 = not in progress.
    pub end_time: u64,
    /// Primary side: the replica that asked to take over.
    pub replica: Option<String>,
    /// Replica side: the primary's frozen offset we must reach.
    pub primary_offset: Option<u64>,
    /// Replica side: offsets converged, election may start immediately.
    pub can_start: bool,
}

impl ManualFailoverState {
    pub fn in_progress(&self) -> bool {
        self.end_time != 0
    }

    pub fn reset(&mut self) {
        *self = ManualFailoverState::default();
    }
}

/// `ClusterState` is the main container for all cluster-related information
/// on this node.
#[derive(Debug)]
pub struct ClusterState {
    /// The unique 40-character hexadecimal id of this node.
    pub my_id: String,
    /// All known nodes, the shard index, and the forgotten-node blacklist.
    pub registry: NodeRegistry,
    /// High-water mark of every epoch observed anywhere in the cluster.
    pub current_epoch: AtomicU64,
    /// Number of voting primaries; quorum = size / 2 + 1.
    pub size: AtomicUsize,
    /// Whether the cluster can serve: full slot coverage and a reachable
    /// quorum of voting primaries.
    pub state_ok: AtomicBool,
    /// slot -> owning node id.
    slots: Vec<RwLock<Option<String>>>,
    /// Slots this node is migrating away: slot -> destination node id.
    /// Meaningful only while `slots[s] == myself`.
    pub migrating_to: DashMap<u16, String>,
    /// Slots this node is importing: slot -> source node id. Meaningful only
    /// while `slots[s] != myself`.
    pub importing_from: DashMap<u16, String>,
    /// Slots whose owner stopped claiming them in its headers; we suppress
    /// our own UPDATEs about these instead of unbinding immediately.
    pub owner_not_claiming: Mutex<SlotBitmap>,
    pub election: Mutex<ElectionState>,
    pub manual_failover: Mutex<ManualFailoverState>,
    /// The epoch we last voted in. A node never votes twice per epoch.
    pub last_vote_epoch: AtomicU64,
    pub todo_flags: AtomicU32,
    /// Monotonic tag so one outgoing ping never gossips the same node twice.
    pub gossip_generation: AtomicU64,
    pub stats_msg_sent: [AtomicU64; MSG_TYPE_COUNT],
    pub stats_msg_received: [AtomicU64; MSG_TYPE_COUNT],
    /// The file path for the persisted cluster configuration (`nodes.conf`).
    pub config_file_path: String,
    /// The exclusive advisory lock on the config file, held for the process
    /// lifetime.
    pub config_lock: Mutex<Option<std::fs::File>>,
}

impl ClusterState {
    /// Creates a new, fresh `ClusterState` for a node starting for the first
    /// time.
    pub fn new(config: &Config) -> Result<Self, QuartzError> {
        let my_id = crate::core::random_hex_id();
        let mut myself = ClusterNode::new(my_id.clone(), NodeFlags::MYSELF | NodeFlags::PRIMARY);
        Self::apply_announce_config(&mut myself, config);

        let registry = NodeRegistry::new();
        let mut runtime = NodeRuntime::new(myself);
        runtime.pong_received = now_ms();
        registry.insert(runtime);

        Ok(Self {
            my_id,
            registry,
            current_epoch: AtomicU64::new(0),
            size: AtomicUsize::new(0),
            state_ok: AtomicBool::new(false),
            slots: (0..NUM_SLOTS).map(|_| RwLock::new(None)).collect(),
            migrating_to: DashMap::new(),
            importing_from: DashMap::new(),
            owner_not_claiming: Mutex::new(SlotBitmap::new()),
            election: Mutex::new(ElectionState::default()),
            manual_failover: Mutex::new(ManualFailoverState::default()),
            last_vote_epoch: AtomicU64::new(0),
            todo_flags: AtomicU32::new(0),
            gossip_generation: AtomicU64::new(0),
            stats_msg_sent: std::array::from_fn(|_| AtomicU64::new(0)),
            stats_msg_received: std::array::from_fn(|_| AtomicU64::new(0)),
            config_file_path: config.cluster.config_file.clone(),
            config_lock: Mutex::new(None),
        })
    }

    /// Loads the persisted configuration if present, otherwise starts fresh.
    /// The exclusive config-file lock is taken either way; failure to take it
    /// is fatal to startup.
    pub fn open(config: &Config) -> Result<Self, QuartzError> {
        let path = config.cluster.config_file.clone();
        // Taking the lock creates the file, so remember whether a real
        // config was there first.
        let had_config = std::fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        let lock = persistence::lock_config_file(&path)?;
        let state = if had_config {
            persistence::load_from_file(&path, config)?
        } else {
            info!("No cluster config at '{path}'; starting with a fresh node id.");
            Self::new(config)?
        };
        *state.config_lock.lock() = Some(lock);
        state.recompute_size();
        Ok(state)
    }

    /// Applies this instance's announced addresses to its own node entry.
    pub fn apply_announce_config(myself: &mut ClusterNode, config: &Config) {
        myself.ip = config
            .cluster
            .announce_ip
            .clone()
            .unwrap_or_else(|| config.host.clone());
        myself.port = config.cluster.announce_port.unwrap_or(config.port);
        myself.tls_port = config.cluster.announce_tls_port.unwrap_or(0);
        myself.bus_port = config.bus_port();
        myself.hostname = config.cluster.announce_hostname.clone().unwrap_or_default();
        myself.human_name = config.cluster.human_nodename.clone().unwrap_or_default();
        myself.client_ipv4 = config
            .cluster
            .announce_client_ipv4
            .as_deref()
            .and_then(|s| s.parse().ok());
        myself.client_ipv6 = config
            .cluster
            .announce_client_ipv6
            .as_deref()
            .and_then(|s| s.parse().ok());
        if config.cluster.replica_no_failover {
            myself.flags |= NodeFlags::NOFAILOVER;
        }
    }

    /// Returns this node's own registry entry.
    pub fn myself(&self) -> Ref<'_, String, NodeRuntime> {
        self.registry
            .get(&self.my_id)
            .expect("Invariant violation: own node must always exist in the registry")
    }

    /// A cheap snapshot of this node's own node info.
    pub fn myself_info(&self) -> ClusterNode {
        self.myself().info.clone()
    }

    pub fn is_myself_primary(&self) -> bool {
        self.myself().info.is_primary()
    }

    /// The primary id this node replicates, if it is a replica.
    pub fn my_primary_id(&self) -> Option<String> {
        self.myself().info.replica_of.clone()
    }

    pub fn quorum(&self) -> usize {
        self.size.load(Ordering::Acquire) / 2 + 1
    }

    /// Recounts the voting primaries.
    pub fn recompute_size(&self) {
        self.size
            .store(self.registry.count_voting_primaries(), Ordering::Release);
    }

    /// Recomputes cluster health: every slot covered by a non-failing owner
    /// and a reachable quorum of voting primaries.
    pub fn update_state(&self) {
        let mut covered = 0usize;
        for slot_lock in &self.slots {
            let Some(owner_id) = slot_lock.read().clone() else {
                continue;
            };
            let healthy = self
                .registry
                .get(&owner_id)
                .map(|rt| !rt.info.flags.contains(NodeFlags::FAIL))
                .unwrap_or(false);
            if healthy {
                covered += 1;
            }
        }

        let reachable_voting = self
            .registry
            .nodes
            .iter()
            .filter(|e| {
                let info = &e.value().info;
                info.is_voting_primary() && !info.is_failing()
            })
            .count();

        let was_ok = self.state_ok.load(Ordering::Acquire);
        let ok = covered == NUM_SLOTS && reachable_voting >= self.quorum();
        if ok != was_ok {
            if ok {
                info!("Cluster state changed: ok");
            } else {
                warn!(
                    "Cluster state changed: down (covered {covered}/{NUM_SLOTS} slots, {reachable_voting} reachable voters)"
                );
            }
            self.state_ok.store(ok, Ordering::Release);
        }
    }

    // --- Epochs ---

    /// Raises `current_epoch` to at least `observed`.
    pub fn observe_epoch(&self, observed: u64) {
        self.current_epoch.fetch_max(observed, Ordering::AcqRel);
    }

    /// Bumps and returns a fresh epoch, greater than anything observed.
    pub fn bump_epoch(&self) -> u64 {
        self.current_epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    // --- Slot table ---

    pub fn slot_owner(&self, slot: u16) -> Option<String> {
        self.slots[slot as usize].read().clone()
    }

    pub fn i_own_slot(&self, slot: u16) -> bool {
        self.slots[slot as usize]
            .read()
            .as_deref()
            .is_some_and(|id| id == self.my_id)
    }

    /// Assigns an unowned slot to a node. Fails if the slot already has an
    /// owner.
    pub fn add_slot(&self, node_id: &str, slot: u16) -> Result<(), QuartzError> {
        {
            let mut owner = self.slots[slot as usize].write();
            if owner.is_some() {
                return Err(QuartzError::Cluster(format!(
                    "slot {slot} is already assigned"
                )));
            }
            *owner = Some(node_id.to_string());
        }
        self.owner_not_claiming.lock().clear(slot);
        self.node_set_slot(node_id, slot);
        Ok(())
    }

    /// Unassigns a slot. Fails if the slot has no owner. Returns the previous
    /// owner so callers can drop shard-channel subscribers.
    pub fn del_slot(&self, slot: u16) -> Result<String, QuartzError> {
        let previous = {
            let mut owner = self.slots[slot as usize].write();
            owner
                .take()
                .ok_or_else(|| QuartzError::Cluster(format!("slot {slot} is not assigned")))?
        };
        self.node_clear_slot(&previous, slot);
        Ok(previous)
    }

    /// Moves a slot to `new_owner`, updating both bitmaps. Used by the
    /// slot-config engine when a newer claim arrives.
    pub fn rebind_slot(&self, slot: u16, new_owner: &str) {
        let previous = {
            let mut owner = self.slots[slot as usize].write();
            owner.replace(new_owner.to_string())
        };
        if let Some(previous) = previous {
            if previous == new_owner {
                return;
            }
            self.node_clear_slot(&previous, slot);
        }
        self.owner_not_claiming.lock().clear(slot);
        self.node_set_slot(new_owner, slot);
    }

    /// Sets a slot bit on a node, maintaining the MIGRATE_TO marker: a
    /// primary that goes from zero to some slots becomes a valid migration
    /// target while any other primary has replicas.
    fn node_set_slot(&self, node_id: &str, slot: u16) {
        let became_nonempty = {
            let Some(mut rt) = self.registry.get_mut(node_id) else {
                return;
            };
            let old = rt.info.set_slot_bit(slot);
            !old && rt.info.num_slots == 1
        };
        if became_nonempty && self.any_other_primary_has_replicas(node_id) {
            if let Some(mut rt) = self.registry.get_mut(node_id) {
                rt.info.flags |= NodeFlags::MIGRATE_TO;
            }
        }
    }

    fn node_clear_slot(&self, node_id: &str, slot: u16) {
        if let Some(mut rt) = self.registry.get_mut(node_id) {
            rt.info.clear_slot_bit(slot);
            if rt.info.num_slots == 0 {
                rt.info.flags.remove(NodeFlags::MIGRATE_TO);
            }
        }
    }

    fn any_other_primary_has_replicas(&self, except: &str) -> bool {
        self.registry.nodes.iter().any(|e| {
            let info = &e.value().info;
            info.id != except && info.is_primary() && !info.replicas.is_empty()
        })
    }

    // --- Role transitions for myself ---

    /// Turns this node into a replica of `primary_id`, moving it into the
    /// primary's shard and replica list.
    pub fn set_myself_replica_of(&self, primary_id: &str) {
        let new_shard = self
            .registry
            .get(primary_id)
            .map(|rt| rt.info.shard_id.clone());
        let old_primary = {
            let Some(mut myself) = self.registry.get_mut(&self.my_id) else {
                return;
            };
            myself
                .info
                .flags
                .remove(NodeFlags::PRIMARY | NodeFlags::MIGRATE_TO);
            myself.info.flags.insert(NodeFlags::REPLICA);
            myself.info.replica_of.replace(primary_id.to_string())
        };
        if let Some(old_primary) = old_primary
            && let Some(mut old) = self.registry.get_mut(&old_primary)
        {
            old.info.remove_replica(&self.my_id);
        }
        if let Some(mut new_primary) = self.registry.get_mut(primary_id) {
            new_primary.info.add_replica(&self.my_id);
        }
        if let Some(shard) = new_shard {
            self.registry.update_shard_id(&self.my_id, &shard);
        }
        info!("Node {} now replicates {}", self.my_id, primary_id);
    }

    /// Turns this node into a primary with the given config epoch, detaching
    /// it from any previous primary.
    pub fn set_myself_primary(&self, config_epoch: u64) {
        let old_primary = {
            let Some(mut myself) = self.registry.get_mut(&self.my_id) else {
                return;
            };
            myself.info.flags.remove(NodeFlags::REPLICA);
            myself.info.flags.insert(NodeFlags::PRIMARY);
            myself.info.config_epoch = config_epoch;
            myself.info.replica_of.take()
        };
        if let Some(old_primary) = old_primary
            && let Some(mut old) = self.registry.get_mut(&old_primary)
        {
            old.info.remove_replica(&self.my_id);
        }
        info!(
            "Node {} promoted to PRIMARY at epoch {}",
            self.my_id, config_epoch
        );
    }

    /// Claims every slot currently bound to `old_owner` for this node.
    /// Returns how many slots moved.
    pub fn take_over_slots_from(&self, old_owner: &str) -> usize {
        let slots_to_claim: Vec<u16> = self
            .registry
            .get(old_owner)
            .map(|rt| rt.info.slots.iter_ones().collect())
            .unwrap_or_default();
        for &slot in &slots_to_claim {
            self.rebind_slot(slot, &self.my_id);
        }
        if !slots_to_claim.is_empty() {
            info!(
                "Took over {} slots from old primary {}",
                slots_to_claim.len(),
                old_owner
            );
        }
        slots_to_claim.len()
    }

    // --- Deferred work ---

    pub fn schedule_save(&self, fsync: bool) {
        let mut bits = TodoFlags::SAVE_CONFIG;
        if fsync {
            bits |= TodoFlags::FSYNC_CONFIG;
        }
        self.todo_flags.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    pub fn schedule(&self, flags: TodoFlags) {
        self.todo_flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Takes and clears the pending todo bits.
    pub fn take_todo(&self) -> TodoFlags {
        TodoFlags::from_bits_truncate(self.todo_flags.swap(0, Ordering::AcqRel))
    }

    // --- Introspection ---

    /// Basic health counters, for operator output.
    pub fn cluster_summary(&self) -> String {
        let myself = self.myself_info();
        format!(
            "cluster_state:{}\r\ncluster_known_nodes:{}\r\ncluster_size:{}\r\ncluster_current_epoch:{}\r\ncluster_my_epoch:{}\r\n",
            if self.state_ok.load(Ordering::Acquire) {
                "ok"
            } else {
                "fail"
            },
            self.registry.len(),
            self.size.load(Ordering::Acquire),
            self.current_epoch.load(Ordering::Acquire),
            myself.config_epoch,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> ClusterState {
        let config = Config::default();
        ClusterState::new(&config).unwrap()
    }

    fn add_primary(state: &ClusterState, id: &str) {
        let info = ClusterNode::new(id.to_string(), NodeFlags::PRIMARY);
        state.registry.insert(NodeRuntime::new(info));
    }

    #[test]
    fn add_slot_rejects_owned_slots() {
        let state = test_state();
        let my_id = state.my_id.clone();
        state.add_slot(&my_id, 7).unwrap();
        assert!(state.i_own_slot(7));
        assert!(state.add_slot(&my_id, 7).is_err());
        assert_eq!(state.myself_info().num_slots, 1);
    }

    #[test]
    fn del_slot_returns_previous_owner() {
        let state = test_state();
        let my_id = state.my_id.clone();
        state.add_slot(&my_id, 100).unwrap();
        assert_eq!(state.del_slot(100).unwrap(), my_id);
        assert!(state.del_slot(100).is_err());
        assert_eq!(state.myself_info().num_slots, 0);
    }

    #[test]
    fn rebind_moves_bitmap_bits() {
        let state = test_state();
        let my_id = state.my_id.clone();
        add_primary(&state, "other-node");
        state.add_slot(&my_id, 42).unwrap();
        state.rebind_slot(42, "other-node");
        assert_eq!(state.slot_owner(42).as_deref(), Some("other-node"));
        assert_eq!(state.myself_info().num_slots, 0);
        assert!(
            state
                .registry
                .get("other-node")
                .unwrap()
                .info
                .slots
                .test(42)
        );
    }

    #[test]
    fn replica_transition_keeps_shard_index_consistent() {
        let state = test_state();
        add_primary(&state, "primary-1");
        state.set_myself_replica_of("primary-1");

        let myself = state.myself_info();
        assert!(myself.is_replica());
        assert_eq!(myself.replica_of.as_deref(), Some("primary-1"));

        let primary = state.registry.get("primary-1").unwrap();
        assert_eq!(primary.info.replicas, vec![state.my_id.clone()]);
        assert_eq!(myself.shard_id, primary.info.shard_id);
        drop(primary);

        // Promotion reverses the links.
        state.set_myself_primary(5);
        let myself = state.myself_info();
        assert!(myself.is_primary());
        assert!(myself.replica_of.is_none());
        assert_eq!(myself.config_epoch, 5);
        assert!(
            state
                .registry
                .get("primary-1")
                .unwrap()
                .info
                .replicas
                .is_empty()
        );
    }
}

// src/core/cluster/node.rs

//! Node identity, flags, and the registry every other cluster component
//! resolves ids through. Replicas reference their primary by id and primaries
//! keep a sorted list of replica ids, so the registry owns every node value
//! and no reference cycles exist.

use crate::core::cluster::link::ClusterLink;
use crate::core::cluster::slot::SlotBitmap;
use crate::core::now_ms;
use bitflags::bitflags;
use dashmap::DashMap;
use dashmap::mapref::one::{Ref, RefMut};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/// The length of node ids, shard ids, and replication ids: 20 random bytes,
/// hex encoded.
pub const NODE_ID_LEN: usize = 40;

/// A gossip fail report is discarded when older than
/// `node_timeout * FAIL_REPORT_VALIDITY_MULT`.
pub const FAIL_REPORT_VALIDITY_MULT: u64 = 2;

/// A FAIL flag on a slot-holding primary is only revoked after
/// `node_timeout * FAIL_UNDO_TIME_MULT` of renewed reachability.
pub const FAIL_UNDO_TIME_MULT: u64 = 2;

/// How long a FORGET-ed node id stays blacklisted before gossip may
/// re-admit it, milliseconds.
pub const BLACKLIST_TTL_MS: u64 = 60_000;

bitflags! {
    /// Flags representing the state and role of a cluster node. The bit
    /// positions are part of the wire format (gossip `flags` field) and must
    /// not be reordered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NodeFlags: u16 {
        const PRIMARY              = 1 << 0;
        const REPLICA              = 1 << 1;
        const PFAIL                = 1 << 2;  // Possible failure (unconfirmed).
        const FAIL                 = 1 << 3;  // Confirmed failure.
        const MYSELF               = 1 << 4;  // The node is this server instance.
        const HANDSHAKE            = 1 << 5;  // First contact, identity unverified.
        const NOADDR               = 1 << 6;  // Node address is unknown.
        const MEET                 = 1 << 7;  // Send a MEET instead of a PING.
        const MIGRATE_TO           = 1 << 8;  // Eligible target for replica migration.
        const NOFAILOVER           = 1 << 9;  // Replica will not try to fail over.
        const EXTENSIONS_SUPPORTED = 1 << 10; // Peer understands ping extensions.
        const LIGHT_HDR_SUPPORTED  = 1 << 11; // Peer accepts light message headers.
    }
}

impl NodeFlags {
    /// Renders the flag set in the `nodes.conf` comma-separated notation.
    pub fn config_string(&self) -> String {
        let mut parts = Vec::new();
        if self.contains(NodeFlags::MYSELF) {
            parts.push("myself");
        }
        if self.contains(NodeFlags::PRIMARY) {
            parts.push("master");
        }
        if self.contains(NodeFlags::REPLICA) {
            parts.push("slave");
        }
        if self.contains(NodeFlags::PFAIL) {
            parts.push("fail?");
        }
        if self.contains(NodeFlags::FAIL) {
            parts.push("fail");
        }
        if self.contains(NodeFlags::HANDSHAKE) {
            parts.push("handshake");
        }
        if self.contains(NodeFlags::NOADDR) {
            parts.push("noaddr");
        }
        if self.contains(NodeFlags::NOFAILOVER) {
            parts.push("nofailover");
        }
        if parts.is_empty() {
            "noflags".to_string()
        } else {
            parts.join(",")
        }
    }

    /// Parses the `nodes.conf` flag notation back into a flag set.
    pub fn from_config_string(raw: &str) -> NodeFlags {
        let mut flags = NodeFlags::empty();
        for token in raw.split(',') {
            match token {
                "myself" => flags |= NodeFlags::MYSELF,
                "master" => flags |= NodeFlags::PRIMARY,
                "slave" => flags |= NodeFlags::REPLICA,
                "fail?" => flags |= NodeFlags::PFAIL,
                "fail" => flags |= NodeFlags::FAIL,
                "handshake" => flags |= NodeFlags::HANDSHAKE,
                "noaddr" => flags |= NodeFlags::NOADDR,
                "nofailover" => flags |= NodeFlags::NOFAILOVER,
                _ => {}
            }
        }
        flags
    }
}

/// The configuration and identity of a node, gossiped and persisted.
#[derive(Debug, Clone)]
pub struct ClusterNode {
    pub id: String,
    pub shard_id: String,
    /// Operator-assigned human name, empty when unset.
    pub human_name: String,
    /// Announced hostname, empty when unset.
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    pub tls_port: u16,
    pub bus_port: u16,
    pub client_ipv4: Option<Ipv4Addr>,
    pub client_ipv6: Option<Ipv6Addr>,
    pub flags: NodeFlags,
    pub config_epoch: u64,
    pub slots: SlotBitmap,
    pub num_slots: usize,
    /// Id of the primary this node replicates, if it is a replica. Resolved
    /// through the registry before use; may transiently dangle during
    /// reconfiguration.
    pub replica_of: Option<String>,
    /// Ids of this node's replicas, kept sorted. Only meaningful for primaries.
    pub replicas: Vec<String>,
    pub repl_offset: u64,
}

impl ClusterNode {
    pub fn new(id: String, flags: NodeFlags) -> Self {
        Self {
            id,
            shard_id: crate::core::random_hex_id(),
            human_name: String::new(),
            hostname: String::new(),
            ip: String::new(),
            port: 0,
            tls_port: 0,
            bus_port: 0,
            client_ipv4: None,
            client_ipv6: None,
            flags,
            config_epoch: 0,
            slots: SlotBitmap::new(),
            num_slots: 0,
            replica_of: None,
            replicas: Vec::new(),
            repl_offset: 0,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.flags.contains(NodeFlags::PRIMARY)
    }

    pub fn is_replica(&self) -> bool {
        self.flags.contains(NodeFlags::REPLICA)
    }

    pub fn is_myself(&self) -> bool {
        self.flags.contains(NodeFlags::MYSELF)
    }

    pub fn is_failing(&self) -> bool {
        self.flags.intersects(NodeFlags::FAIL | NodeFlags::PFAIL)
    }

    /// A voting primary: a primary that currently serves at least one slot.
    pub fn is_voting_primary(&self) -> bool {
        self.is_primary() && self.num_slots > 0
    }

    /// The `ip:port@busport` notation used in `nodes.conf` and operator output.
    pub fn addr_string(&self) -> String {
        format!("{}:{}@{}", self.ip, self.port, self.bus_port)
    }

    /// Records a slot claim, keeping the cached counter in sync with the
    /// bitmap. Returns the previous bit.
    pub fn set_slot_bit(&mut self, slot: u16) -> bool {
        let old = self.slots.set(slot);
        if !old {
            self.num_slots += 1;
        }
        old
    }

    /// Clears a slot claim, keeping the cached counter in sync. Returns the
    /// previous bit.
    pub fn clear_slot_bit(&mut self, slot: u16) -> bool {
        let old = self.slots.clear(slot);
        if old {
            self.num_slots -= 1;
        }
        old
    }

    /// Adds a replica id, keeping the list sorted and duplicate-free.
    pub fn add_replica(&mut self, replica_id: &str) {
        if let Err(pos) = self.replicas.binary_search_by(|r| r.as_str().cmp(replica_id)) {
            self.replicas.insert(pos, replica_id.to_string());
        }
    }

    pub fn remove_replica(&mut self, replica_id: &str) {
        if let Ok(pos) = self.replicas.binary_search_by(|r| r.as_str().cmp(replica_id)) {
            self.replicas.remove(pos);
        }
    }
}

/// The runtime state of a node: timers, fail reports, and links. Not
/// persisted and not gossiped.
#[derive(Debug)]
pub struct NodeRuntime {
    pub info: ClusterNode,
    /// Node object creation time, milliseconds since the epoch.
    pub ctime: u64,
    /// When the latest still-unanswered ping was sent. 0 = none outstanding.
    pub ping_sent: u64,
    pub pong_received: u64,
    /// Last time any traffic arrived from this node, pong or otherwise.
    pub data_received: u64,
    /// When the FAIL flag was set.
    pub fail_time: u64,
    /// Last time we granted a failover vote concerning this primary's shard.
    pub voted_time: u64,
    /// Last time `info.repl_offset` was refreshed from a header.
    pub repl_offset_time: u64,
    /// Since when this primary has had slots but no healthy replicas.
    pub orphaned_time: u64,
    /// Generation tag of the outgoing ping that last gossiped this node,
    /// so one ping never carries the same node twice.
    pub last_gossip_gen: u64,
    /// reporter id -> report time.
    pub fail_reports: HashMap<String, u64>,
    /// The outbound link we opened to this peer.
    pub link: Option<Arc<ClusterLink>>,
    /// The inbound link this peer opened to us.
    pub inbound_link: Option<Arc<ClusterLink>>,
}

impl NodeRuntime {
    pub fn new(info: ClusterNode) -> Self {
        Self {
            info,
            ctime: now_ms(),
            ping_sent: 0,
            pong_received: 0,
            data_received: 0,
            fail_time: 0,
            voted_time: 0,
            repl_offset_time: 0,
            orphaned_time: 0,
            last_gossip_gen: 0,
            fail_reports: HashMap::new(),
            link: None,
            inbound_link: None,
        }
    }

    /// Inserts or refreshes a failure report from `reporter`. Returns true if
    /// this is a new report.
    pub fn add_fail_report(&mut self, reporter: &str) -> bool {
        let fresh = !self.fail_reports.contains_key(reporter);
        self.fail_reports.insert(reporter.to_string(), now_ms());
        fresh
    }

    pub fn remove_fail_report(&mut self, reporter: &str) -> bool {
        self.fail_reports.remove(reporter).is_some()
    }

    /// Drops reports older than the validity window and returns how many
    /// remain.
    pub fn expire_fail_reports(&mut self, node_timeout: u64) -> usize {
        let horizon = now_ms().saturating_sub(node_timeout * FAIL_REPORT_VALIDITY_MULT);
        self.fail_reports.retain(|_, &mut t| t >= horizon);
        self.fail_reports.len()
    }
}

/// The registry of all known nodes, plus the shard index and the blacklist of
/// recently forgotten ids.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    pub nodes: DashMap<String, NodeRuntime>,
    /// shard id -> ordered node ids. Kept consistent with node shard ids.
    pub shards: DashMap<String, Vec<String>>,
    /// Forgotten node id -> re-admit deadline (ms). Scanned for expiry before
    /// every mutation or query.
    blacklist: DashMap<String, u64>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Ref<'_, String, NodeRuntime>> {
        self.nodes.get(id)
    }

    pub fn get_mut(&self, id: &str) -> Option<RefMut<'_, String, NodeRuntime>> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Inserts a node and indexes it under its shard id.
    pub fn insert(&self, runtime: NodeRuntime) {
        let id = runtime.info.id.clone();
        let shard = runtime.info.shard_id.clone();
        self.nodes.insert(id.clone(), runtime);
        self.add_to_shard(&shard, &id);
    }

    /// Removes a node. Dropping the runtime drops its links, so per-node
    /// destruction cascades to per-link destruction.
    pub fn remove(&self, id: &str) -> Option<NodeRuntime> {
        self.remove_from_shard(id);
        self.nodes.remove(id).map(|(_, rt)| rt)
    }

    /// Renames a node after a completed handshake: delete under the
    /// provisional id, reinsert under the real one.
    pub fn rename(&self, old_id: &str, new_id: &str) -> bool {
        let Some((_, mut runtime)) = self.nodes.remove(old_id) else {
            return false;
        };
        self.remove_from_shard_entry(&runtime.info.shard_id, old_id);
        runtime.info.id = new_id.to_string();
        self.insert(runtime);
        true
    }

    /// Adds `id` to `shard`'s ordered member list, without duplicates.
    pub fn add_to_shard(&self, shard: &str, id: &str) {
        let mut members = self.shards.entry(shard.to_string()).or_default();
        if let Err(pos) = members.binary_search_by(|m| m.as_str().cmp(id)) {
            members.insert(pos, id.to_string());
        }
    }

    /// Removes a node from its current shard; empty shards are dropped.
    pub fn remove_from_shard(&self, id: &str) {
        let Some(shard) = self.nodes.get(id).map(|rt| rt.info.shard_id.clone()) else {
            return;
        };
        self.remove_from_shard_entry(&shard, id);
    }

    fn remove_from_shard_entry(&self, shard: &str, id: &str) {
        let mut drop_shard = false;
        if let Some(mut members) = self.shards.get_mut(shard) {
            if let Ok(pos) = members.binary_search_by(|m| m.as_str().cmp(id)) {
                members.remove(pos);
            }
            drop_shard = members.is_empty();
        }
        if drop_shard {
            self.shards.remove(shard);
        }
    }

    /// Moves a node between shards, updating the index on both sides.
    pub fn update_shard_id(&self, id: &str, new_shard: &str) {
        let old_shard = match self.nodes.get_mut(id) {
            Some(mut rt) => {
                let old = rt.info.shard_id.clone();
                if old == new_shard {
                    return;
                }
                rt.info.shard_id = new_shard.to_string();
                old
            }
            None => return,
        };
        self.remove_from_shard_entry(&old_shard, id);
        self.add_to_shard(new_shard, id);
    }

    /// Member ids of a shard, in order.
    pub fn shard_members(&self, shard: &str) -> Vec<String> {
        self.shards
            .get(shard)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Blacklists an id so gossip cannot immediately re-add a FORGET-ed node.
    pub fn blacklist_add(&self, id: &str) {
        self.expire_blacklist();
        self.blacklist
            .insert(id.to_string(), now_ms() + BLACKLIST_TTL_MS);
    }

    /// Blacklists an id with an explicit remaining TTL, as carried by the
    /// FORGOTTEN_NODE gossip extension.
    pub fn blacklist_add_with_ttl(&self, id: &str, ttl_ms: u64) {
        self.expire_blacklist();
        self.blacklist.insert(id.to_string(), now_ms() + ttl_ms);
    }

    pub fn blacklist_contains(&self, id: &str) -> bool {
        self.expire_blacklist();
        self.blacklist.contains_key(id)
    }

    /// Remaining TTL for a blacklisted id, if still active.
    pub fn blacklist_ttl_ms(&self, id: &str) -> Option<u64> {
        self.expire_blacklist();
        self.blacklist
            .get(id)
            .map(|deadline| deadline.saturating_sub(now_ms()))
    }

    fn expire_blacklist(&self) {
        let now = now_ms();
        self.blacklist.retain(|_, &mut deadline| deadline > now);
    }

    /// Active blacklist entries as (id, remaining TTL ms), for gossiping
    /// FORGOTTEN_NODE extensions.
    pub fn blacklist_entries(&self) -> Vec<(String, u64)> {
        self.expire_blacklist();
        let now = now_ms();
        self.blacklist
            .iter()
            .map(|e| (e.key().clone(), e.value().saturating_sub(now)))
            .collect()
    }

    /// Snapshot of all node infos, for gossip selection and persistence.
    pub fn snapshot_infos(&self) -> Vec<ClusterNode> {
        self.nodes.iter().map(|e| e.value().info.clone()).collect()
    }

    /// The number of voting primaries; quorum is `size / 2 + 1`.
    pub fn count_voting_primaries(&self) -> usize {
        self.nodes
            .iter()
            .filter(|e| e.value().info.is_voting_primary())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, shard: &str) -> NodeRuntime {
        let mut info = ClusterNode::new(id.to_string(), NodeFlags::PRIMARY);
        info.shard_id = shard.to_string();
        NodeRuntime::new(info)
    }

    #[test]
    fn rename_moves_shard_index_entry() {
        let registry = NodeRegistry::new();
        registry.insert(node(&"a".repeat(40), "shard-1"));
        assert!(registry.rename(&"a".repeat(40), &"b".repeat(40)));
        assert!(registry.get(&"a".repeat(40)).is_none());
        assert!(registry.get(&"b".repeat(40)).is_some());
        assert_eq!(registry.shard_members("shard-1"), vec!["b".repeat(40)]);
    }

    #[test]
    fn shard_index_drops_empty_shards() {
        let registry = NodeRegistry::new();
        registry.insert(node("n1", "s1"));
        registry.insert(node("n2", "s1"));
        registry.remove("n1");
        assert_eq!(registry.shard_members("s1"), vec!["n2".to_string()]);
        registry.remove("n2");
        assert!(registry.shards.get("s1").is_none());
    }

    #[test]
    fn flags_config_string_roundtrip() {
        let flags = NodeFlags::MYSELF | NodeFlags::PRIMARY | NodeFlags::PFAIL;
        let rendered = flags.config_string();
        assert_eq!(rendered, "myself,master,fail?");
        assert_eq!(NodeFlags::from_config_string(&rendered), flags);
    }

    #[test]
    fn replica_list_stays_sorted_and_unique() {
        let mut info = ClusterNode::new("p".into(), NodeFlags::PRIMARY);
        info.add_replica("bbb");
        info.add_replica("aaa");
        info.add_replica("bbb");
        assert_eq!(info.replicas, vec!["aaa".to_string(), "bbb".to_string()]);
        info.remove_replica("aaa");
        assert_eq!(info.replicas, vec!["bbb".to_string()]);
    }
}

// src/core/state/replication.rs

//! Contains state definitions related to replication.

use crate::core::now_ms;
use bitflags::bitflags;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::info;

/// How long a demoted upstream's replication id stays refused after a
/// failover, milliseconds.
const POISONED_UPSTREAM_TTL_MS: u64 = 60_000;

/// The synchronization state of a replica connected to this primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaSyncState {
    /// Waiting for a snapshot to start.
    WaitBgsaveStart,
    /// A snapshot is being produced for this replica.
    WaitBgsaveEnd,
    /// The snapshot bytes are being written to the replica socket.
    SendBulk,
    /// Steady state: the replica receives the live command stream.
    Online,
    /// Dual-channel: the command stream flows on this connection while the
    /// paired connection still transfers the snapshot.
    BgRdbLoad,
    /// Dual-channel RDB connection that finished its transfer.
    RdbTransmitted,
}

bitflags! {
    /// Capabilities a replica advertises during the handshake.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReplicaCapa: u8 {
        /// Understands the `$EOF:<delim>` diskless snapshot framing.
        const EOF          = 1 << 0;
        const PSYNC2       = 1 << 1;
        const DUAL_CHANNEL = 1 << 2;
    }
}

bitflags! {
    /// Requirements a replica attaches to its sync request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReplicaReq: u8 {
        const RDB_EXCLUDE_DATA      = 1 << 0;
        const RDB_EXCLUDE_FUNCTIONS = 1 << 1;
        /// This connection is the RDB side of a dual-channel sync.
        const RDB_CHANNEL           = 1 << 2;
    }
}

/// Runtime information about one replica attached to this primary.
#[derive(Debug)]
pub struct ReplicaHandle {
    pub client_id: u64,
    pub addr: SocketAddr,
    state: Mutex<ReplicaSyncState>,
    /// The last replication offset acknowledged by the replica. Monotonic.
    pub ack_offset: AtomicU64,
    /// The last fsynced offset the replica reported via FACK.
    pub fsync_offset: AtomicU64,
    pub ack_time_ms: AtomicU64,
    /// The offset this replica's full sync snapshot was cut at.
    pub psync_initial_offset: AtomicU64,
    pub capa: ReplicaCapa,
    pub req: ReplicaReq,
    pub listening_port: u16,
    pub announced_ip: Option<String>,
    pub replica_version: Option<String>,
    /// Client id of the paired dual-channel RDB connection, 0 if none.
    pub paired_rdb_client: AtomicU64,
    /// Raised to tear the replica connection down asynchronously.
    pub kill: Notify,
}

impl ReplicaHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_id: u64,
        addr: SocketAddr,
        state: ReplicaSyncState,
        capa: ReplicaCapa,
        req: ReplicaReq,
        listening_port: u16,
        announced_ip: Option<String>,
        replica_version: Option<String>,
    ) -> Self {
        Self {
            client_id,
            addr,
            state: Mutex::new(state),
            ack_offset: AtomicU64::new(0),
            fsync_offset: AtomicU64::new(0),
            ack_time_ms: AtomicU64::new(now_ms()),
            psync_initial_offset: AtomicU64::new(0),
            capa,
            req,
            listening_port,
            announced_ip,
            replica_version,
            paired_rdb_client: AtomicU64::new(0),
            kill: Notify::new(),
        }
    }

    pub fn sync_state(&self) -> ReplicaSyncState {
        *self.state.lock()
    }

    pub fn set_sync_state(&self, new_state: ReplicaSyncState) {
        *self.state.lock() = new_state;
    }

    /// Applies a `REPLCONF ACK`: the acked offset can never move backwards.
    pub fn update_ack(&self, offset: u64, fsynced: Option<u64>) {
        self.ack_offset.fetch_max(offset, Ordering::AcqRel);
        if let Some(fsynced) = fsynced {
            self.fsync_offset.fetch_max(fsynced, Ordering::AcqRel);
        }
        self.ack_time_ms.store(now_ms(), Ordering::Release);
    }
}

/// Information about the upstream primary, held while this node is a replica.
#[derive(Debug, Default, Clone)]
pub struct PrimaryLinkInfo {
    /// The replication id of the primary we are synchronized with.
    pub replid: String,
    /// The replication offset this replica has processed.
    pub processed_offset: u64,
    /// The offset covered by our own durability (FACK) reports.
    pub fsynced_offset: u64,
}

/// The central struct holding all replication-related identity and offsets.
#[derive(Debug)]
pub struct ReplicationState {
    /// The current replication id of this history.
    replid: RwLock<String>,
    /// The previous replication id, honored for partial resyncs up to
    /// `second_replid_offset`.
    replid2: RwLock<String>,
    /// Watermark: offsets up to and including this are valid under `replid2`.
    pub second_replid_offset: AtomicU64,
    /// Offset of the last replication byte produced (or mirrored, when this
    /// node is a replica). The first byte ever produced has offset 1.
    pub master_repl_offset: AtomicU64,
    /// State of the upstream link. `None` while this node is a primary.
    pub primary_link: tokio::sync::Mutex<Option<PrimaryLinkInfo>>,
    /// Replication ids this node refuses to resync from, with expiry times.
    /// Set when an upstream is known to have been demoted.
    pub poisoned_upstreams: DashMap<String, u64>,
    pub full_syncs: AtomicU64,
    pub partial_syncs_ok: AtomicU64,
    pub partial_syncs_err: AtomicU64,
}

impl ReplicationState {
    pub fn new(replid: String) -> Self {
        Self {
            replid: RwLock::new(replid),
            replid2: RwLock::new("0".repeat(40)),
            second_replid_offset: AtomicU64::new(0),
            master_repl_offset: AtomicU64::new(0),
            primary_link: tokio::sync::Mutex::new(None),
            poisoned_upstreams: DashMap::new(),
            full_syncs: AtomicU64::new(0),
            partial_syncs_ok: AtomicU64::new(0),
            partial_syncs_err: AtomicU64::new(0),
        }
    }

    pub fn replid(&self) -> String {
        self.replid.read().clone()
    }

    pub fn replid2(&self) -> String {
        self.replid2.read().clone()
    }

    pub fn set_replid(&self, new_replid: String) {
        *self.replid.write() = new_replid;
    }

    pub fn get_offset(&self) -> u64 {
        self.master_repl_offset.load(Ordering::SeqCst)
    }

    /// Whether a PSYNC request against `requested_id` at `offset` targets a
    /// history we can still vouch for. `offset` is the first byte wanted.
    pub fn history_matches(&self, requested_id: &str, offset: u64) -> bool {
        if requested_id.eq_ignore_ascii_case(&self.replid()) {
            return true;
        }
        requested_id.eq_ignore_ascii_case(&self.replid2())
            && offset <= self.second_replid_offset.load(Ordering::Acquire)
    }

    /// Rotates the replication id on promotion: the old id stays valid for
    /// partial resyncs up to the current offset so replicas of the old
    /// primary can continue without a full sync.
    pub fn shift_replid(&self) {
        let old = self.replid();
        let fresh = crate::core::random_hex_id();
        *self.replid2.write() = old;
        self.second_replid_offset
            .store(self.get_offset() + 1, Ordering::Release);
        *self.replid.write() = fresh.clone();
        info!(
            "Replication id rotated; old history honored up to offset {}",
            self.get_offset()
        );
    }

    /// Adopts an upstream's id pair after a `+CONTINUE <new-replid>` reply.
    pub fn adopt_upstream_replid(&self, new_replid: &str) {
        let old = self.replid();
        if old != new_replid {
            *self.replid2.write() = old;
            self.second_replid_offset
                .store(self.get_offset() + 1, Ordering::Release);
            *self.replid.write() = new_replid.to_string();
        }
    }

    /// Refuses resyncs from `replid` for a TTL; used after observing the
    /// upstream get demoted so we never re-attach to a stale history.
    pub fn poison_upstream(&self, replid: &str) {
        self.expire_poisoned();
        self.poisoned_upstreams
            .insert(replid.to_string(), now_ms() + POISONED_UPSTREAM_TTL_MS);
    }

    pub fn is_upstream_poisoned(&self, replid: &str) -> bool {
        self.expire_poisoned();
        self.poisoned_upstreams.contains_key(replid)
    }

    fn expire_poisoned(&self) {
        let now = now_ms();
        self.poisoned_upstreams.retain(|_, &mut expiry| expiry > now);
    }
}

/// How many replicas count as "good" for the min-replicas write gate:
/// online and acked within `max_lag_secs`.
pub fn count_good_replicas(
    replicas: &Arc<DashMap<u64, Arc<ReplicaHandle>>>,
    max_lag_secs: u64,
) -> usize {
    let horizon = now_ms().saturating_sub(max_lag_secs * 1000);
    replicas
        .iter()
        .filter(|entry| {
            let replica = entry.value();
            replica.sync_state() == ReplicaSyncState::Online
                && replica.ack_time_ms.load(Ordering::Acquire) >= horizon
        })
        .count()
}

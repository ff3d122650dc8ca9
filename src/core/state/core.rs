// src/core/state/core.rs

//! Defines the central `ServerState` struct, holding all shared server-wide
//! state. One instance exists per server; it is wrapped in an `Arc` and
//! passed to every task, so there are no hidden globals.

use super::replication::*;
use crate::config::{Config, ReplicationConfig};
use crate::core::QuartzError;
use crate::core::cluster::state::ClusterState;
use crate::core::engine::{KeyspaceEngine, PubSubBridge, SnapshotFilters, SnapshotProvider};
use crate::core::now_ms;
use crate::core::replication::backlog::ReplBacklog;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{info, warn};

/// A snapshot generation in progress, shared so every replica that arrives
/// while it runs attaches to the same result instead of forking another one.
#[derive(Debug, Clone)]
pub struct SnapshotJob {
    /// Replication offset at the instant the snapshot was cut.
    pub initial_offset: u64,
    pub filters: SnapshotFilters,
    /// Resolves to the snapshot bytes, or an error string, exactly once.
    pub rx: watch::Receiver<Option<Result<Bytes, String>>>,
}

/// The central struct holding all shared, server-wide state.
pub struct ServerState {
    /// The server's runtime configuration, mutable for role changes after a
    /// failover.
    pub config: Arc<Mutex<Config>>,
    /// The keyspace storage engine collaborator.
    pub engine: Arc<dyn KeyspaceEngine>,
    /// The pub/sub registry collaborator.
    pub pubsub: Arc<dyn PubSubBridge>,
    /// The snapshot encoder/loader collaborator.
    pub snapshots: Arc<dyn SnapshotProvider>,
    /// The state of the cluster, if enabled. `None` in standalone mode.
    pub cluster: Option<Arc<ClusterState>>,
    /// Replication identity and offsets.
    pub replication: ReplicationState,
    /// The shared history of recent replication bytes.
    pub backlog: ReplBacklog,
    /// Observes the primary replication offset advancing on every feed.
    pub repl_offset_rx: watch::Receiver<u64>,
    /// All replicas attached to this primary, keyed by client id.
    pub replicas: Arc<DashMap<u64, Arc<ReplicaHandle>>>,
    next_client_id: AtomicU64,
    /// The snapshot currently being produced, if any.
    pub snapshot_job: Mutex<Option<SnapshotJob>>,
    /// Signals replication workers to reconfigure (e.g. after failover).
    pub replication_reconfigure_tx: broadcast::Sender<()>,
    pub shutdown_tx: broadcast::Sender<()>,
    /// Writes are paused until this mstime; 0 = not paused. Set during a
    /// manual failover so the designated replica can catch up.
    pub pause_writes_until: AtomicU64,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("replicas", &self.replicas.len())
            .field("offset", &self.replication.get_offset())
            .finish_non_exhaustive()
    }
}

impl ServerState {
    /// Initializes the entire server state from the given configuration and
    /// collaborators.
    pub fn initialize(
        config: Config,
        engine: Arc<dyn KeyspaceEngine>,
        pubsub: Arc<dyn PubSubBridge>,
        snapshots: Arc<dyn SnapshotProvider>,
    ) -> Result<Arc<Self>, QuartzError> {
        let replid = crate::core::random_hex_id();
        let (backlog, repl_offset_rx) = ReplBacklog::new(config.repl_tuning.backlog_size);
        let (replication_reconfigure_tx, _) = broadcast::channel(4);
        let (shutdown_tx, _) = broadcast::channel(4);

        let cluster = if config.cluster.enabled {
            Some(Arc::new(ClusterState::open(&config)?))
        } else {
            None
        };

        Ok(Arc::new(Self {
            config: Arc::new(Mutex::new(config)),
            engine,
            pubsub,
            snapshots,
            cluster,
            replication: ReplicationState::new(replid),
            backlog,
            repl_offset_rx,
            replicas: Arc::new(DashMap::new()),
            next_client_id: AtomicU64::new(1),
            snapshot_job: Mutex::new(None),
            replication_reconfigure_tx,
            shutdown_tx,
            pause_writes_until: AtomicU64::new(0),
        }))
    }

    pub fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Appends executed-write bytes to the replication stream: the offset
    /// advances first, then the backlog stores the bytes and wakes the
    /// per-replica streamers. Returns the new global offset.
    ///
    /// When this node is itself a replica, the same entry point relays the
    /// upstream byte stream verbatim so sub-replicas observe bit-identical
    /// bytes at identical offsets.
    pub fn feed_replication_stream(&self, payload: &[u8]) -> u64 {
        let prev = self
            .replication
            .master_repl_offset
            .fetch_add(payload.len() as u64, Ordering::SeqCst);
        self.backlog.feed(payload, prev + 1);
        prev + payload.len() as u64
    }

    /// Checks the min-replicas write gate (primary role only).
    pub async fn check_min_replicas_policy(&self) -> Result<(), QuartzError> {
        let config = self.config.lock().await;
        if let ReplicationConfig::Primary(primary_config) = &config.replication {
            let needed = primary_config.min_replicas_to_write;
            if needed == 0 {
                return Ok(());
            }
            let good = count_good_replicas(&self.replicas, primary_config.min_replicas_max_lag);
            if good < needed {
                return Err(QuartzError::InvalidState(format!(
                    "NOREPLICAS Not enough good replicas to write (have {good}, need {needed})"
                )));
            }
        }
        Ok(())
    }

    /// Whether writes are currently paused (manual failover handshake).
    pub fn writes_paused(&self) -> bool {
        let until = self.pause_writes_until.load(Ordering::Acquire);
        until != 0 && now_ms() < until
    }

    pub fn pause_writes(&self, until_ms: u64) {
        info!("Pausing writes until mstime {until_ms}");
        self.pause_writes_until.store(until_ms, Ordering::Release);
    }

    pub fn resume_writes(&self) {
        self.pause_writes_until.store(0, Ordering::Release);
    }

    /// Kicks every attached replica so they reconnect and renegotiate.
    /// Used when the replication history they follow is no longer ours.
    pub fn disconnect_all_replicas(&self, reason: &str) {
        if self.replicas.is_empty() {
            return;
        }
        warn!("Disconnecting {} replicas: {reason}", self.replicas.len());
        for entry in self.replicas.iter() {
            entry.value().kill.notify_waiters();
        }
    }

    /// Starts a snapshot generation, or joins the one already running when
    /// its filters match. Returns the shared job handle.
    pub async fn snapshot_job_for(self: &Arc<Self>, filters: SnapshotFilters) -> SnapshotJob {
        let mut guard = self.snapshot_job.lock().await;
        if let Some(job) = guard.as_ref()
            && job.filters == filters
            && job.rx.borrow().is_none()
        {
            return job.clone();
        }

        let (tx, rx) = watch::channel(None);
        let job = SnapshotJob {
            initial_offset: self.replication.get_offset(),
            filters,
            rx,
        };
        *guard = Some(job.clone());
        drop(guard);

        self.replication.full_syncs.fetch_add(1, Ordering::Relaxed);
        let state = self.clone();
        tokio::spawn(async move {
            let result = state
                .snapshots
                .create_snapshot(filters)
                .await
                .map_err(|e| e.to_string());
            if let Err(e) = &result {
                warn!("Snapshot generation failed: {e}");
            }
            // Receivers keep the channel alive; send failure means nobody is
            // waiting anymore, which is fine.
            let _ = tx.send(Some(result));
            state.snapshot_job.lock().await.take();
        });
        job
    }

    /// An operator-facing replication overview in the INFO style.
    pub async fn replication_summary(&self) -> String {
        let role = if self.config.lock().await.is_primary() {
            "master"
        } else {
            "slave"
        };
        let mut out = format!(
            "role:{role}\r\nconnected_slaves:{}\r\nmaster_replid:{}\r\nmaster_replid2:{}\r\nmaster_repl_offset:{}\r\nsecond_repl_offset:{}\r\nrepl_backlog_histlen:{}\r\n",
            self.replicas.len(),
            self.replication.replid(),
            self.replication.replid2(),
            self.replication.get_offset(),
            self.replication.second_replid_offset.load(Ordering::Acquire),
            self.backlog.histlen(),
        );
        for (i, entry) in self.replicas.iter().enumerate() {
            let replica = entry.value();
            out.push_str(&format!(
                "slave{i}:ip={},port={},state={:?},offset={}\r\n",
                replica
                    .announced_ip
                    .clone()
                    .unwrap_or_else(|| replica.addr.ip().to_string()),
                replica.listening_port,
                replica.sync_state(),
                replica.ack_offset.load(Ordering::Acquire),
            ));
        }
        out
    }
}

// tests/common/mod.rs

//! Shared helpers for the integration and unit test suites.

#![allow(dead_code)]

use bytes::Bytes;
use quartzkv::config::{Config, ReplicationConfig};
use quartzkv::core::cluster::node::{ClusterNode, NodeFlags, NodeRuntime};
use quartzkv::core::cluster::state::ClusterState;
use quartzkv::core::engine::{MemoryEngine, MemorySnapshots, NullPubSub};
use quartzkv::core::state::ServerState;
use std::sync::Arc;
use tempfile::TempDir;

/// Bundles a `ServerState` with its concrete collaborators so tests can
/// inspect what the core did to them.
pub struct TestContext {
    pub state: Arc<ServerState>,
    pub engine: Arc<MemoryEngine>,
    pub snapshots: Arc<MemorySnapshots>,
    /// Keeps the cluster config directory alive for the test's duration.
    pub tmp: Option<TempDir>,
}

/// A standalone (non-cluster) server state with an in-memory engine.
pub fn standalone_context(config: Config) -> TestContext {
    let engine = Arc::new(MemoryEngine::new());
    let snapshots = MemorySnapshots::with_payload(Bytes::from_static(b"test-snapshot-bytes"));
    let state = ServerState::initialize(
        config,
        engine.clone(),
        Arc::new(NullPubSub),
        snapshots.clone(),
    )
    .expect("state init");
    TestContext {
        state,
        engine,
        snapshots,
        tmp: None,
    }
}

/// A cluster-mode server state whose `nodes.conf` lives in a temp directory.
pub fn cluster_context() -> TestContext {
    let tmp = TempDir::new().expect("temp dir");
    let mut config = Config::default();
    config.cluster.enabled = true;
    config.cluster.config_file = tmp
        .path()
        .join("nodes.conf")
        .to_string_lossy()
        .to_string();

    let engine = Arc::new(MemoryEngine::new());
    let snapshots = MemorySnapshots::with_payload(Bytes::from_static(b"test-snapshot-bytes"));
    let state = ServerState::initialize(
        config,
        engine.clone(),
        Arc::new(NullPubSub),
        snapshots.clone(),
    )
    .expect("state init");
    TestContext {
        state,
        engine,
        snapshots,
        tmp: Some(tmp),
    }
}

/// A replica-role context pointed at `primary_port` on localhost.
pub fn replica_context(primary_port: u16) -> TestContext {
    let mut config = Config::default();
    config.port = primary_port.wrapping_add(1);
    config.replication = ReplicationConfig::Replica {
        primary_host: "127.0.0.1".to_string(),
        primary_port,
        tls_enabled: false,
    };
    let engine = Arc::new(MemoryEngine::new());
    let snapshots = Arc::new(MemorySnapshots::default());
    let state = ServerState::initialize(
        config,
        engine.clone(),
        Arc::new(NullPubSub),
        snapshots.clone(),
    )
    .expect("state init");
    TestContext {
        state,
        engine,
        snapshots,
        tmp: None,
    }
}

/// Inserts a primary node with the given slots into a cluster registry.
pub fn add_primary(cluster: &ClusterState, id: &str, epoch: u64, slots: &[u16]) {
    let mut info = ClusterNode::new(id.to_string(), NodeFlags::PRIMARY);
    info.config_epoch = epoch;
    info.ip = "10.1.1.1".into();
    info.port = 7450;
    info.bus_port = 17450;
    cluster.registry.insert(NodeRuntime::new(info));
    for &slot in slots {
        cluster.rebind_slot(slot, id);
    }
    cluster.recompute_size();
}

/// Inserts a replica node attached to `primary_id`.
pub fn add_replica(cluster: &ClusterState, id: &str, primary_id: &str, repl_offset: u64) {
    let shard = cluster
        .registry
        .get(primary_id)
        .map(|rt| rt.info.shard_id.clone())
        .expect("primary must exist");
    let mut info = ClusterNode::new(id.to_string(), NodeFlags::REPLICA);
    info.replica_of = Some(primary_id.to_string());
    info.shard_id = shard.clone();
    info.repl_offset = repl_offset;
    cluster.registry.insert(NodeRuntime::new(info));
    cluster
        .registry
        .get_mut(primary_id)
        .unwrap()
        .info
        .add_replica(id);
    cluster.registry.update_shard_id(id, &shard);
}

/// A deterministic 40-character node id built from one repeated character.
pub fn node_id(ch: char) -> String {
    ch.to_string().repeat(40)
}

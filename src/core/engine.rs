// src/core/engine.rs

//! Trait seams to the subsystems that live outside the cluster/replication
//! core: the keyspace storage engine, the pub/sub registry, and the snapshot
//! encoder/loader. The core never touches key bytes directly; everything is
//! funneled through these collaborators.

use crate::core::QuartzError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Requirement bits a replica may attach to its full-sync request, forwarded
/// to the snapshot encoder as filters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotFilters {
    pub exclude_data: bool,
    pub exclude_functions: bool,
}

/// Where a snapshot to be loaded comes from.
#[derive(Debug, Clone)]
pub enum SnapshotSource {
    Bytes(Bytes),
    File(PathBuf),
}

/// The keyspace storage engine, as seen from the cluster core.
#[async_trait]
pub trait KeyspaceEngine: Send + Sync {
    /// Number of keys currently hashed to `slot`.
    fn count_keys_in_slot(&self, slot: u16) -> usize;

    /// Deletes every key in `slot`, returning how many were removed.
    async fn delete_keys_in_slot(&self, slot: u16) -> usize;

    /// Visits every key in `slot`.
    fn iterate_keys_in_slot(&self, slot: u16, visitor: &mut dyn FnMut(&[u8]));

    /// Drops the entire dataset. Used before a destructive full resync.
    async fn empty_all_data(&self);

    /// Applies a replicated unit of work, delivered as the canonical command
    /// byte sequence the primary fed into its replication stream.
    async fn apply_replicated(&self, payload: Bytes) -> Result<(), QuartzError>;
}

/// The pub/sub registry, as seen from the cluster core.
pub trait PubSubBridge: Send + Sync {
    /// Delivers a message received over the cluster bus to local subscribers.
    /// Returns the number of receivers.
    fn publish(&self, channel: &Bytes, message: Bytes, sharded: bool) -> usize;

    /// Kicks all shard-channel subscribers whose channel hashes to `slot`,
    /// called when the slot leaves this node.
    fn unsubscribe_shard_slot(&self, slot: u16);
}

/// The snapshot encoder/loader, as seen from the replication core. Encoding
/// runs in the background; the returned future resolves when the snapshot is
/// complete, which doubles as the completion signal.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Serializes the current dataset into snapshot bytes.
    async fn create_snapshot(&self, filters: SnapshotFilters) -> Result<Bytes, QuartzError>;

    /// Replaces the current dataset with the contents of `source`.
    async fn load_snapshot(&self, source: SnapshotSource) -> Result<(), QuartzError>;
}

/// A minimal in-memory engine used by tests and by stand-alone runs of the
/// core. Keys are bucketed by slot; values are ignored.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    slots: DashMap<u16, Vec<Bytes>>,
    pub applied_bytes: AtomicU64,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_key(&self, slot: u16, key: Bytes) {
        self.slots.entry(slot).or_default().push(key);
    }
}

#[async_trait]
impl KeyspaceEngine for MemoryEngine {
    fn count_keys_in_slot(&self, slot: u16) -> usize {
        self.slots.get(&slot).map_or(0, |keys| keys.len())
    }

    async fn delete_keys_in_slot(&self, slot: u16) -> usize {
        self.slots.remove(&slot).map_or(0, |(_, keys)| keys.len())
    }

    fn iterate_keys_in_slot(&self, slot: u16, visitor: &mut dyn FnMut(&[u8])) {
        if let Some(keys) = self.slots.get(&slot) {
            for key in keys.iter() {
                visitor(key);
            }
        }
    }

    async fn empty_all_data(&self) {
        self.slots.clear();
    }

    async fn apply_replicated(&self, payload: Bytes) -> Result<(), QuartzError> {
        self.applied_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// A pub/sub bridge that drops everything; stands in for the real registry.
#[derive(Debug, Default)]
pub struct NullPubSub;

impl PubSubBridge for NullPubSub {
    fn publish(&self, _channel: &Bytes, _message: Bytes, _sharded: bool) -> usize {
        0
    }

    fn unsubscribe_shard_slot(&self, _slot: u16) {}
}

/// An in-memory snapshot provider: the "snapshot" is an opaque byte blob the
/// tests can inspect.
#[derive(Debug, Default)]
pub struct MemorySnapshots {
    pub last_loaded: parking_lot::Mutex<Option<Bytes>>,
    pub payload: parking_lot::Mutex<Bytes>,
}

impl MemorySnapshots {
    pub fn with_payload(payload: Bytes) -> Arc<Self> {
        Arc::new(Self {
            last_loaded: parking_lot::Mutex::new(None),
            payload: parking_lot::Mutex::new(payload),
        })
    }
}

#[async_trait]
impl SnapshotProvider for MemorySnapshots {
    async fn create_snapshot(&self, _filters: SnapshotFilters) -> Result<Bytes, QuartzError> {
        Ok(self.payload.lock().clone())
    }

    async fn load_snapshot(&self, source: SnapshotSource) -> Result<(), QuartzError> {
        let bytes = match source {
            SnapshotSource::Bytes(bytes) => bytes,
            SnapshotSource::File(path) => Bytes::from(std::fs::read(path)?),
        };
        *self.last_loaded.lock() = Some(bytes);
        Ok(())
    }
}

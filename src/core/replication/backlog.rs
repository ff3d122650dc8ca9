// src/core/replication/backlog.rs

//! Implements the replication backlog, a crucial component for efficient
//! replication.
//!
//! The backlog is a bounded, chunked history of the bytes a primary has fed
//! into its replication stream. Attached replicas and reconnecting replicas
//! performing a partial resynchronization all read the same chunk list
//! through per-consumer cursors, so a byte is stored once no matter how many
//! consumers trail behind. The head chunk is released only when no cursor
//! references it and dropping it would not shrink the retained history below
//! the configured size.
//!
//! Replication offsets are 1-based: the first byte a primary ever produces
//! has offset 1, and `offset == primary_offset - histlen + 1` holds for the
//! first retained byte.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::watch;
use tracing::debug;

/// Minimum chunk allocation.
pub const BACKLOG_MIN_BLOCK: usize = 16 * 1024;

/// One offset-index entry is kept per this many allocated chunks.
pub const INDEX_PER_BLOCKS: u64 = 64;

/// Upper bound on chunks released by a single trim pass.
pub const TRIM_BLOCKS_PER_CALL: usize = 64;

/// A single chunk of replication history.
#[derive(Debug)]
struct BufBlock {
    id: u64,
    /// Replication offset of the first byte stored in this chunk.
    start_offset: u64,
    data: Vec<u8>,
    capacity: usize,
    /// Number of cursors currently parked on this chunk.
    consumers: u32,
}

impl BufBlock {
    fn used(&self) -> usize {
        self.data.len()
    }

    fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Offset one past the last stored byte.
    fn end_offset(&self) -> u64 {
        self.start_offset + self.used() as u64
    }
}

/// A handle to one consumer's position in the backlog. Must be released via
/// [`ReplBacklog::release`] so the chunk refcounts stay balanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorId(u64);

#[derive(Debug)]
struct CursorState {
    block_id: u64,
    pos: usize,
}

#[derive(Debug)]
struct Inner {
    blocks: VecDeque<BufBlock>,
    next_block_id: u64,
    /// Replication offset of the first byte still stored. Meaningless while
    /// the backlog is empty.
    offset: u64,
    /// Bytes retained.
    histlen: u64,
    size_limit: usize,
    /// Sparse offset index: chunk start offset -> chunk id.
    index: BTreeMap<u64, u64>,
    blocks_since_index: u64,
    cursors: HashMap<u64, CursorState>,
    next_cursor_id: u64,
}

/// Point-in-time counters for tests and operator output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacklogStats {
    pub blocks: usize,
    pub offset: u64,
    pub histlen: u64,
    pub indexed: usize,
    pub cursors: usize,
}

/// The shared replication backlog. Cloneable handle; all clones view the same
/// history.
#[derive(Debug, Clone)]
pub struct ReplBacklog {
    inner: std::sync::Arc<Mutex<Inner>>,
    offset_notifier_tx: std::sync::Arc<watch::Sender<u64>>,
}

impl ReplBacklog {
    /// Creates a backlog bounded at `size_limit` bytes, along with a watch
    /// receiver that observes the primary offset advancing on every feed.
    pub fn new(size_limit: usize) -> (Self, watch::Receiver<u64>) {
        let (tx, rx) = watch::channel(0u64);
        (
            Self {
                inner: std::sync::Arc::new(Mutex::new(Inner {
                    blocks: VecDeque::new(),
                    next_block_id: 0,
                    offset: 0,
                    histlen: 0,
                    size_limit,
                    index: BTreeMap::new(),
                    blocks_since_index: 0,
                    cursors: HashMap::new(),
                    next_cursor_id: 0,
                })),
                offset_notifier_tx: std::sync::Arc::new(tx),
            },
            rx,
        )
    }

    /// Appends `payload` whose first byte carries replication offset
    /// `start_offset`, then wakes all stream listeners. One bounded trim pass
    /// runs per chunk allocation.
    pub fn feed(&self, payload: &[u8], start_offset: u64) {
        if payload.is_empty() {
            return;
        }
        let end_offset;
        {
            let mut inner = self.inner.lock();
            if inner.blocks.is_empty() {
                inner.offset = start_offset;
            }
            debug_assert!(
                inner.blocks.is_empty()
                    || inner.blocks.back().unwrap().end_offset() == start_offset,
                "replication stream must be fed contiguously"
            );

            let mut remaining = payload;
            let mut cursor_offset = start_offset;
            while !remaining.is_empty() {
                let fits = inner
                    .blocks
                    .back()
                    .map(|b| b.remaining())
                    .unwrap_or(0);
                if fits > 0 {
                    let take = fits.min(remaining.len());
                    let block = inner.blocks.back_mut().unwrap();
                    block.data.extend_from_slice(&remaining[..take]);
                    remaining = &remaining[take..];
                    cursor_offset += take as u64;
                    continue;
                }
                let cap = remaining
                    .len()
                    .clamp(BACKLOG_MIN_BLOCK, (inner.size_limit / 16).max(BACKLOG_MIN_BLOCK));
                let id = inner.next_block_id;
                inner.next_block_id += 1;
                inner.blocks.push_back(BufBlock {
                    id,
                    start_offset: cursor_offset,
                    data: Vec::with_capacity(cap),
                    capacity: cap,
                    consumers: 0,
                });
                inner.blocks_since_index += 1;
                if inner.blocks_since_index >= INDEX_PER_BLOCKS || inner.index.is_empty() {
                    inner.index.insert(cursor_offset, id);
                    inner.blocks_since_index = 0;
                }
                trim_locked(&mut inner);
            }
            inner.histlen += payload.len() as u64;
            end_offset = start_offset + payload.len() as u64 - 1;
            trim_locked(&mut inner);
        }

        // Wake replica streamers only after the bytes are in place.
        self.offset_notifier_tx.send_if_modified(|current| {
            if *current < end_offset {
                *current = end_offset;
                true
            } else {
                false
            }
        });
    }

    /// Attempts one bounded trim pass, releasing unreferenced head chunks
    /// while the retained history exceeds the limit.
    pub fn trim(&self) {
        trim_locked(&mut self.inner.lock());
    }

    /// Whether a partial resync starting at `wanted_offset` (the first byte
    /// the consumer needs) can be served from history.
    pub fn can_serve(&self, wanted_offset: u64) -> bool {
        let inner = self.inner.lock();
        if inner.blocks.is_empty() {
            return false;
        }
        wanted_offset >= inner.offset && wanted_offset <= inner.offset + inner.histlen
    }

    /// Seeks a cursor to `wanted_offset`. The index narrows the search to a
    /// chunk run, then a linear walk finds the exact chunk. Returns `None`
    /// when the offset already left history (or was never produced).
    pub fn seek(&self, wanted_offset: u64) -> Option<CursorId> {
        let mut inner = self.inner.lock();
        if inner.blocks.is_empty()
            || wanted_offset < inner.offset
            || wanted_offset > inner.offset + inner.histlen
        {
            return None;
        }

        // Largest indexed chunk start at or before the wanted offset.
        let start_block_id = inner
            .index
            .range(..=wanted_offset)
            .next_back()
            .map(|(_, &id)| id)
            .unwrap_or_else(|| inner.blocks.front().unwrap().id);
        let front_id = inner.blocks.front().unwrap().id;
        let mut idx = start_block_id.saturating_sub(front_id) as usize;
        // An index entry can lag behind trimming; never start before the head.
        idx = idx.min(inner.blocks.len() - 1);

        while idx + 1 < inner.blocks.len() && inner.blocks[idx].end_offset() <= wanted_offset {
            idx += 1;
        }
        let block = &inner.blocks[idx];
        debug_assert!(wanted_offset >= block.start_offset);
        let pos = (wanted_offset - block.start_offset) as usize;
        let block_id = block.id;

        inner.blocks[idx].consumers += 1;
        let cursor_id = inner.next_cursor_id;
        inner.next_cursor_id += 1;
        inner.cursors.insert(cursor_id, CursorState { block_id, pos });
        debug!(
            "Backlog cursor {cursor_id} attached at offset {wanted_offset} (chunk {block_id})"
        );
        Some(CursorId(cursor_id))
    }

    /// Reads up to `max_bytes` from the cursor, advancing it. Returns an
    /// empty buffer when the cursor is at the end of history.
    pub fn read(&self, cursor: CursorId, max_bytes: usize) -> Bytes {
        let mut inner = self.inner.lock();
        let front_id = match inner.blocks.front() {
            Some(b) => b.id,
            None => return Bytes::new(),
        };
        let Some(state) = inner.cursors.get(&cursor.0) else {
            return Bytes::new();
        };
        let mut block_idx = (state.block_id - front_id) as usize;
        let mut pos = state.pos;
        let mut out = BytesMut::new();

        while out.len() < max_bytes {
            let block = &inner.blocks[block_idx];
            let available = block.used() - pos;
            if available > 0 {
                let take = available.min(max_bytes - out.len());
                out.extend_from_slice(&block.data[pos..pos + take]);
                pos += take;
                continue;
            }
            // End of this chunk: hop to the next one if it exists.
            if block_idx + 1 >= inner.blocks.len() {
                break;
            }
            let next_id = inner.blocks[block_idx + 1].id;
            inner.blocks[block_idx].consumers -= 1;
            inner.blocks[block_idx + 1].consumers += 1;
            let state = inner.cursors.get_mut(&cursor.0).unwrap();
            state.block_id = next_id;
            block_idx += 1;
            pos = 0;
        }

        let state = inner.cursors.get_mut(&cursor.0).unwrap();
        state.pos = pos;
        out.freeze()
    }

    /// The replication offset of the next byte this cursor will yield.
    pub fn cursor_offset(&self, cursor: CursorId) -> Option<u64> {
        let inner = self.inner.lock();
        let state = inner.cursors.get(&cursor.0)?;
        let front_id = inner.blocks.front()?.id;
        let block = &inner.blocks[(state.block_id - front_id) as usize];
        Some(block.start_offset + state.pos as u64)
    }

    /// Detaches a consumer; its chunk reference is dropped and a trim pass
    /// runs so a released head can be reclaimed immediately.
    pub fn release(&self, cursor: CursorId) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.cursors.remove(&cursor.0) {
            let front_id = inner.blocks.front().map(|b| b.id);
            if let Some(front_id) = front_id {
                let idx = (state.block_id - front_id) as usize;
                if let Some(block) = inner.blocks.get_mut(idx) {
                    block.consumers -= 1;
                }
            }
            trim_locked(&mut inner);
        }
    }

    /// Drops the entire retained history. Used when this node adopts a new
    /// replication history (full resync), where old offsets become
    /// meaningless. Outstanding cursors read as exhausted afterwards.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.blocks.clear();
        inner.index.clear();
        inner.cursors.clear();
        inner.histlen = 0;
        inner.offset = 0;
        inner.blocks_since_index = 0;
    }

    pub fn first_offset(&self) -> u64 {
        self.inner.lock().offset
    }

    pub fn histlen(&self) -> u64 {
        self.inner.lock().histlen
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().blocks.is_empty()
    }

    pub fn stats(&self) -> BacklogStats {
        let inner = self.inner.lock();
        BacklogStats {
            blocks: inner.blocks.len(),
            offset: inner.offset,
            histlen: inner.histlen,
            indexed: inner.index.len(),
            cursors: inner.cursors.len(),
        }
    }
}

fn trim_locked(inner: &mut Inner) {
    let mut released = 0usize;
    while released < TRIM_BLOCKS_PER_CALL
        && inner.blocks.len() > 1
        && inner.histlen > inner.size_limit as u64
    {
        let head = inner.blocks.front().expect("len checked above");
        let head_used = head.used() as u64;
        // The head stays while any cursor references it, or while dropping it
        // would leave less history than the configured size.
        if head.consumers > 0 || inner.histlen - head_used < inner.size_limit as u64 {
            break;
        }
        let head = inner.blocks.pop_front().expect("len checked above");
        inner.index.remove(&head.start_offset);
        inner.histlen -= head_used;
        inner.offset = head.end_offset();
        released += 1;
    }
}

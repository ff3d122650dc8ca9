// src/core/cluster/link.rs

//! A duplex message channel to one cluster peer: a framed send queue feeding
//! a dedicated writer task, and a growable receive buffer that accumulates
//! exactly one frame at a time before dispatch.

use crate::core::QuartzError;
use crate::core::cluster::gossip;
use crate::core::cluster::message::{ClusterPacket, MSG_LIGHT_HEADER_LEN, MSG_SIG, PROTO_VER};
use crate::core::now_ms;
use crate::core::state::ServerState;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Hard ceiling on a single bus frame. Anything larger is a protocol fault.
pub const BUS_MAX_FRAME: usize = 32 * 1024 * 1024;

/// A link whose unsent queue exceeds this many bytes is freed; the peer will
/// be reconnected by cron with an empty queue.
pub const LINK_SENDBUF_LIMIT: usize = 128 * 1024 * 1024;

/// Receive buffers grow by doubling up to this size, then linearly.
const RECV_GROW_DOUBLE_LIMIT: usize = 1024 * 1024;

/// One side of a connection to a peer on the cluster bus.
#[derive(Debug)]
pub struct ClusterLink {
    pub created_ms: u64,
    pub inbound: bool,
    /// Back-reference to the owning node, set once the peer is identified.
    pub node_id: Mutex<Option<String>>,
    send_tx: mpsc::UnboundedSender<Arc<Bytes>>,
    send_queue_bytes: AtomicUsize,
    dead: AtomicBool,
}

impl ClusterLink {
    fn new(inbound: bool, send_tx: mpsc::UnboundedSender<Arc<Bytes>>) -> Self {
        Self {
            created_ms: now_ms(),
            inbound,
            node_id: Mutex::new(None),
            send_tx,
            send_queue_bytes: AtomicUsize::new(0),
            dead: AtomicBool::new(false),
        }
    }

    /// Queues an encoded frame. A broadcast encodes once and hands the same
    /// shared buffer to every link. Returns false if the link is gone or its
    /// queue exceeded the memory limit.
    pub fn send(&self, frame: Arc<Bytes>) -> bool {
        if self.dead.load(Ordering::Acquire) {
            return false;
        }
        let queued = self
            .send_queue_bytes
            .fetch_add(frame.len(), Ordering::AcqRel)
            + frame.len();
        if queued > LINK_SENDBUF_LIMIT {
            warn!(
                "Cluster link send queue exceeded {} bytes; dropping link.",
                LINK_SENDBUF_LIMIT
            );
            self.mark_dead();
            return false;
        }
        if self.send_tx.send(frame).is_err() {
            self.mark_dead();
            return false;
        }
        true
    }

    pub fn send_packet(&self, packet: &ClusterPacket) -> bool {
        self.send(Arc::new(packet.encode()))
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    pub fn queued_bytes(&self) -> usize {
        self.send_queue_bytes.load(Ordering::Acquire)
    }
}

/// Spawns the reader and writer tasks for an established bus connection and
/// returns the link handle. `node_id` is pre-set for outbound connects where
/// the peer is already known.
pub fn spawn_link(
    state: Arc<ServerState>,
    stream: TcpStream,
    inbound: bool,
    node_id: Option<String>,
) -> Arc<ClusterLink> {
    let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Arc<Bytes>>();
    let link = Arc::new(ClusterLink::new(inbound, send_tx));
    *link.node_id.lock() = node_id;

    let (mut read_half, mut write_half) = stream.into_split();

    // Writer: frames are only ever flushed from this task, one channel hop
    // after being enqueued, so an enqueue can never outrun the state
    // transition that produced it.
    let writer_link = link.clone();
    tokio::spawn(async move {
        while let Some(frame) = send_rx.recv().await {
            let res = write_half.write_all(&frame).await;
            writer_link
                .send_queue_bytes
                .fetch_sub(frame.len(), Ordering::AcqRel);
            if res.is_err() || writer_link.is_dead() {
                writer_link.mark_dead();
                break;
            }
        }
    });

    // Reader: accumulate, validate, dispatch one frame at a time.
    let reader_link = link.clone();
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(4 * 1024);
        loop {
            if reader_link.is_dead() {
                break;
            }
            match read_frames(&state, &reader_link, &mut buf).await {
                Ok(()) => {}
                Err(e) => {
                    debug!("Cluster link read loop ended: {e}");
                    break;
                }
            }
            match read_half.read_buf(&mut buf).await {
                Ok(0) => {
                    debug!("Cluster bus peer closed the connection.");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Cluster bus read error: {e}");
                    break;
                }
            }
        }
        reader_link.mark_dead();
        gossip::handle_link_failure(&state, &reader_link);
    });

    link
}

/// Drains every complete frame currently in `buf`, growing it toward the
/// next frame's announced size.
async fn read_frames(
    state: &Arc<ServerState>,
    link: &Arc<ClusterLink>,
    buf: &mut BytesMut,
) -> Result<(), QuartzError> {
    loop {
        if buf.len() < MSG_LIGHT_HEADER_LEN {
            return Ok(());
        }
        if &buf[0..4] != MSG_SIG {
            return Err(QuartzError::Protocol("bad bus frame signature".into()));
        }
        let totlen =
            u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        let ver = u16::from_be_bytes([buf[8], buf[9]]);
        if ver != PROTO_VER {
            return Err(QuartzError::Protocol(format!(
                "unsupported bus protocol version {ver}"
            )));
        }
        if !(MSG_LIGHT_HEADER_LEN..=BUS_MAX_FRAME).contains(&totlen) {
            return Err(QuartzError::Protocol(format!(
                "bus frame length {totlen} out of bounds"
            )));
        }
        if buf.len() < totlen {
            grow_recv_buffer(buf, totlen);
            return Ok(());
        }
        let frame = buf.split_to(totlen).freeze();
        let packet = ClusterPacket::decode(&frame)?;
        gossip::process_packet(state, link, packet).await;
        // Large one-off frames should not pin their capacity forever.
        if buf.capacity() > RECV_GROW_DOUBLE_LIMIT && buf.len() < MSG_LIGHT_HEADER_LEN {
            let pending = buf.split();
            *buf = BytesMut::with_capacity(4 * 1024);
            buf.extend_from_slice(&pending);
        }
    }
}

/// Grows the receive buffer toward `needed`: doubling while small, then in
/// 1 MiB increments.
fn grow_recv_buffer(buf: &mut BytesMut, needed: usize) {
    let mut target = buf.capacity().max(4 * 1024);
    while target < needed {
        if target < RECV_GROW_DOUBLE_LIMIT {
            target *= 2;
        } else {
            target += RECV_GROW_DOUBLE_LIMIT;
        }
    }
    if target > buf.capacity() {
        buf.reserve(target - buf.len());
    }
}

/// Opens an outbound connection to `addr` and wires up the link tasks.
pub async fn connect_link(
    state: Arc<ServerState>,
    addr: &str,
    node_id: String,
) -> Result<Arc<ClusterLink>, QuartzError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true).ok();
    Ok(spawn_link(state, stream, false, Some(node_id)))
}

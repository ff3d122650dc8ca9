// src/core/replication/handler.rs

//! Primary-side replica handling: the replication command surface (PING,
//! AUTH, REPLCONF, PSYNC, SYNC), the partial-versus-full resync decision,
//! snapshot orchestration with attach-to-in-progress, the dual-channel
//! full-sync path, and the steady-state fan-out of the shared backlog to
//! each attached replica through its own cursor.

use crate::core::QuartzError;
use crate::core::engine::SnapshotFilters;
use crate::core::protocol::{RespFrame, RespFrameCodec};
use crate::core::replication::backlog::CursorId;
use crate::core::replication::sync::InitialSyncer;
use crate::core::state::{
    ReplicaCapa, ReplicaHandle, ReplicaReq, ReplicaSyncState, ServerState, SnapshotJob,
};
use bytes::Bytes;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf, split};
use tokio::sync::broadcast;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

/// Upper bound on bytes drained from the backlog per streaming iteration, so
/// one fast replica cannot monopolize the task.
const STREAM_CHUNK: usize = 64 * 1024;

/// What a processed command asks the connection loop to do next.
enum Flow {
    Continue,
    /// The connection turned into a replication stream and has ended.
    Done,
}

/// `ReplicaHandler` manages one inbound connection on the replication
/// surface, from handshake commands through steady-state streaming. It is
/// generic over the stream type `S` to support both plain TCP and TLS.
pub struct ReplicaHandler<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> {
    state: Arc<ServerState>,
    addr: SocketAddr,
    client_id: u64,
    reader: FramedRead<ReadHalf<S>, RespFrameCodec>,
    writer: WriteHalf<S>,
    authenticated: bool,
    listening_port: u16,
    announced_ip: Option<String>,
    capa: ReplicaCapa,
    req: ReplicaReq,
    replica_version: Option<String>,
    /// On the main channel: the paired RDB connection's client id, learned
    /// via `REPLCONF set-rdb-client-id`.
    paired_rdb_id: u64,
    /// Set once `+DUALCHANNELSYNC` was offered on this connection.
    dual_channel_offered: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> ReplicaHandler<S> {
    pub fn new(state: Arc<ServerState>, addr: SocketAddr, stream: S) -> Self {
        let client_id = state.next_client_id();
        let (read_half, write_half) = split(stream);
        Self {
            state,
            addr,
            client_id,
            reader: FramedRead::new(read_half, RespFrameCodec),
            writer: write_half,
            authenticated: false,
            listening_port: 0,
            announced_ip: None,
            capa: ReplicaCapa::empty(),
            req: ReplicaReq::empty(),
            replica_version: None,
            paired_rdb_id: 0,
            dual_channel_offered: false,
        }
    }

    /// Runs the whole connection lifecycle and cleans up the replica's
    /// registration when it ends.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let result = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                debug!("Replication connection {} closing on shutdown.", self.addr);
                Ok(())
            }
            res = self.command_loop() => res,
        };
        if let Err(e) = result {
            debug!("Replication connection {} ended: {e}", self.addr);
        }
        self.state.replicas.remove(&self.client_id);
    }

    async fn command_loop(&mut self) -> Result<(), QuartzError> {
        while let Some(frame) = self.reader.next().await {
            let frame = frame?;
            let Some((name, args)) = frame.as_command() else {
                self.reply_error("ERR protocol error: expected a command array")
                    .await?;
                continue;
            };

            let password_required = self.state.config.lock().await.password.is_some();
            if password_required && !self.authenticated && name != "AUTH" {
                self.reply_error("NOAUTH Authentication required.").await?;
                continue;
            }

            match self.dispatch(&name, &args).await? {
                Flow::Continue => {}
                Flow::Done => return Ok(()),
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, name: &str, args: &[Bytes]) -> Result<Flow, QuartzError> {
        match name {
            "PING" => {
                self.reply_simple("PONG").await?;
                Ok(Flow::Continue)
            }
            "AUTH" => {
                // `AUTH pass` or `AUTH user pass`.
                let offered = match args {
                    [pass] => Some(pass),
                    [_user, pass] => Some(pass),
                    _ => None,
                };
                let expected = self.state.config.lock().await.password.clone();
                match (offered, expected) {
                    (Some(pass), Some(expected)) if pass.as_ref() == expected.as_bytes() => {
                        self.authenticated = true;
                        self.reply_simple("OK").await?;
                    }
                    (_, None) => {
                        self.reply_error("ERR Client sent AUTH, but no password is set")
                            .await?;
                    }
                    _ => {
                        self.reply_error("WRONGPASS invalid username-password pair")
                            .await?;
                    }
                }
                Ok(Flow::Continue)
            }
            "REPLCONF" => self.handle_replconf(args).await,
            "PSYNC" => {
                let (replid, offset) = match args {
                    [replid, offset] | [replid, offset, _] => (
                        String::from_utf8_lossy(replid).to_string(),
                        String::from_utf8_lossy(offset).to_string(),
                    ),
                    _ => {
                        self.reply_error("ERR wrong number of arguments for 'psync' command")
                            .await?;
                        return Ok(Flow::Continue);
                    }
                };
                self.handle_psync(&replid, &offset).await
            }
            "SYNC" => self.full_resync(false).await,
            other => {
                self.reply_error(&format!(
                    "ERR unknown command '{other}' on the replication surface"
                ))
                .await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_replconf(&mut self, args: &[Bytes]) -> Result<Flow, QuartzError> {
        let mut i = 0;
        while i < args.len() {
            let key = String::from_utf8_lossy(&args[i]).to_ascii_lowercase();
            match key.as_str() {
                "listening-port" if i + 1 < args.len() => {
                    self.listening_port = String::from_utf8_lossy(&args[i + 1])
                        .parse()
                        .unwrap_or(0);
                    i += 2;
                }
                "ip-address" if i + 1 < args.len() => {
                    self.announced_ip =
                        Some(String::from_utf8_lossy(&args[i + 1]).to_string());
                    i += 2;
                }
                "capa" if i + 1 < args.len() => {
                    let dual_enabled = {
                        let config = self.state.config.lock().await;
                        match &config.replication {
                            crate::config::ReplicationConfig::Primary(p) => p.dual_channel,
                            _ => false,
                        }
                    };
                    match String::from_utf8_lossy(&args[i + 1])
                        .to_ascii_lowercase()
                        .as_str()
                    {
                        "eof" => self.capa |= ReplicaCapa::EOF,
                        "psync2" => self.capa |= ReplicaCapa::PSYNC2,
                        "dual-channel" if dual_enabled => {
                            self.capa |= ReplicaCapa::DUAL_CHANNEL;
                        }
                        // Unknown capabilities are ignored for forward
                        // compatibility.
                        _ => {}
                    }
                    i += 2;
                }
                "version" if i + 1 < args.len() => {
                    self.replica_version =
                        Some(String::from_utf8_lossy(&args[i + 1]).to_string());
                    i += 2;
                }
                "rdb-only" if i + 1 < args.len() => {
                    i += 2;
                }
                "rdb-channel" if i + 1 < args.len() => {
                    if &args[i + 1][..] == b"1" {
                        self.req |= ReplicaReq::RDB_CHANNEL;
                    }
                    i += 2;
                }
                "rdb-filter-only" if i + 1 < args.len() => {
                    for filter in args[i + 1].split(|&b| b == b',') {
                        match filter {
                            b"no-data" => self.req |= ReplicaReq::RDB_EXCLUDE_DATA,
                            b"no-functions" => self.req |= ReplicaReq::RDB_EXCLUDE_FUNCTIONS,
                            _ => {}
                        }
                    }
                    i += 2;
                }
                "set-rdb-client-id" if i + 1 < args.len() => {
                    self.paired_rdb_id = String::from_utf8_lossy(&args[i + 1])
                        .parse()
                        .unwrap_or(0);
                    i += 2;
                }
                "ack" if i + 1 < args.len() => {
                    // REPLCONF ACK <offset> [FACK <offset>] is the one
                    // REPLCONF variant that gets no reply.
                    let offset: u64 = String::from_utf8_lossy(&args[i + 1])
                        .parse()
                        .unwrap_or(0);
                    let mut fack = None;
                    if i + 3 < args.len()
                        && args[i + 2].eq_ignore_ascii_case(b"fack")
                    {
                        fack = String::from_utf8_lossy(&args[i + 3]).parse().ok();
                    }
                    if let Some(handle) = self
                        .state
                        .replicas
                        .get(&self.client_id)
                        .map(|e| e.value().clone())
                    {
                        handle.update_ack(offset, fack);
                    }
                    return Ok(Flow::Continue);
                }
                _ => {
                    self.reply_error("ERR Unrecognized REPLCONF option").await?;
                    return Ok(Flow::Continue);
                }
            }
        }
        self.reply_simple("OK").await?;
        Ok(Flow::Continue)
    }

    /// The partial-versus-full decision for a PSYNC request. `offset` in the
    /// request is the first byte the replica wants.
    async fn handle_psync(&mut self, replid: &str, offset: &str) -> Result<Flow, QuartzError> {
        if self.req.contains(ReplicaReq::RDB_CHANNEL) {
            // The RDB channel never negotiates offsets; it asks with SYNC.
            self.reply_error("ERR PSYNC is not valid on an RDB channel connection")
                .await?;
            return Ok(Flow::Continue);
        }

        let wanted: Option<u64> = if replid == "?" || offset == "-1" {
            None
        } else {
            offset.parse().ok()
        };

        if let Some(wanted) = wanted
            && self.state.replication.history_matches(replid, wanted)
            && (self.state.backlog.can_serve(wanted)
                || wanted == self.state.replication.get_offset() + 1)
        {
            return self.partial_resync(wanted).await;
        }

        if let Some(wanted) = wanted {
            self.state
                .replication
                .partial_syncs_err
                .fetch_add(1, Ordering::Relaxed);
            info!(
                "Partial resync denied for {} (requested id {replid}, offset {wanted}); falling back to full sync.",
                self.addr
            );
        }
        self.full_resync(true).await
    }

    /// Serves a granted partial resync: `+CONTINUE`, then stream from the
    /// requested offset.
    async fn partial_resync(&mut self, wanted: u64) -> Result<Flow, QuartzError> {
        let cursor = self.state.backlog.seek(wanted);
        if cursor.is_none() && wanted != self.state.replication.get_offset() + 1 {
            // Raced with trimming; a full sync is the only option left.
            return self.full_resync(true).await;
        }

        let initial_state = if self.dual_channel_offered {
            ReplicaSyncState::BgRdbLoad
        } else {
            ReplicaSyncState::Online
        };
        let handle = self.register(initial_state);
        handle
            .psync_initial_offset
            .store(wanted.saturating_sub(1), Ordering::Release);
        if self.paired_rdb_id != 0 {
            handle
                .paired_rdb_client
                .store(self.paired_rdb_id, Ordering::Release);
        }

        let reply = if self.capa.contains(ReplicaCapa::PSYNC2) {
            format!("+CONTINUE {}\r\n", self.state.replication.replid())
        } else {
            "+CONTINUE\r\n".to_string()
        };
        self.writer.write_all(reply.as_bytes()).await?;
        self.writer.flush().await?;
        self.state
            .replication
            .partial_syncs_ok
            .fetch_add(1, Ordering::Relaxed);
        info!(
            "Partial resync accepted for {} from offset {wanted}{}",
            self.addr,
            if self.dual_channel_offered {
                " (dual-channel main connection)"
            } else {
                ""
            }
        );

        match cursor {
            Some(cursor) => self.stream_from(cursor, handle).await,
            // The replica is exactly at the live end; attach on the next feed.
            None => self.stream_from_live_end(handle, wanted).await,
        }
        Ok(Flow::Done)
    }

    /// Full resync entry. `via_psync` distinguishes PSYNC (header replies,
    /// dual-channel eligible) from the legacy bare SYNC.
    async fn full_resync(&mut self, via_psync: bool) -> Result<Flow, QuartzError> {
        if self.req.contains(ReplicaReq::RDB_CHANNEL) {
            return self.serve_rdb_channel().await;
        }

        // A capable replica gets the two-connection path: snapshot on a
        // second connection, command stream buffered on this one.
        if via_psync && self.capa.contains(ReplicaCapa::DUAL_CHANNEL) && !self.dual_channel_offered
        {
            info!(
                "Replica {} supports dual channel sync; deferring snapshot to its RDB connection.",
                self.addr
            );
            self.dual_channel_offered = true;
            self.writer.write_all(b"+DUALCHANNELSYNC\r\n").await?;
            self.writer.flush().await?;
            // Back to the command loop: the replica pairs its RDB connection
            // and re-issues PSYNC at the announced end offset.
            return Ok(Flow::Continue);
        }

        let handle = self.register(ReplicaSyncState::WaitBgsaveStart);
        let filters = SnapshotFilters {
            exclude_data: self.req.contains(ReplicaReq::RDB_EXCLUDE_DATA),
            exclude_functions: self.req.contains(ReplicaReq::RDB_EXCLUDE_FUNCTIONS),
        };
        let job = self.state.snapshot_job_for(filters).await;
        handle
            .psync_initial_offset
            .store(job.initial_offset, Ordering::Release);

        if via_psync {
            let reply = format!(
                "+FULLRESYNC {} {}\r\n",
                self.state.replication.replid(),
                job.initial_offset
            );
            self.writer.write_all(reply.as_bytes()).await?;
            self.writer.flush().await?;
        }
        handle.set_sync_state(ReplicaSyncState::WaitBgsaveEnd);
        info!(
            "Full resync for {} from offset {} (filters {filters:?})",
            self.addr, job.initial_offset
        );

        let payload = self.await_snapshot(job, &handle).await?;

        handle.set_sync_state(ReplicaSyncState::SendBulk);
        let diskless = {
            let config = self.state.config.lock().await;
            match &config.replication {
                crate::config::ReplicationConfig::Primary(p) => p.diskless_sync,
                _ => false,
            }
        };
        let mut syncer = InitialSyncer::new(&mut self.writer);
        if via_psync && diskless && self.capa.contains(ReplicaCapa::EOF) {
            syncer.send_eof_delimited(&payload).await?;
        } else {
            syncer.send_length_prefixed(&payload).await?;
        }
        info!(
            "Snapshot ({} bytes) delivered to {}; replica is online.",
            payload.len(),
            self.addr
        );

        handle.set_sync_state(ReplicaSyncState::Online);
        let resume_from = handle.psync_initial_offset.load(Ordering::Acquire) + 1;
        match self.state.backlog.seek(resume_from) {
            Some(cursor) => self.stream_from(cursor, handle).await,
            None if self.state.replication.get_offset() < resume_from => {
                // Nothing was written since the snapshot was cut; attach once
                // the first post-snapshot feed lands.
                self.stream_from_live_end(handle, resume_from).await;
            }
            None => {
                warn!(
                    "Backlog no longer covers the snapshot offset for {}; dropping replica for a retry.",
                    self.addr
                );
            }
        }
        Ok(Flow::Done)
    }

    /// The RDB side of a dual-channel sync, triggered by `SYNC` on a
    /// connection tagged `rdb-channel 1`: announce the end offset and this
    /// connection's client id, then ship the snapshot.
    async fn serve_rdb_channel(&mut self) -> Result<Flow, QuartzError> {
        let handle = self.register(ReplicaSyncState::WaitBgsaveStart);
        let filters = SnapshotFilters {
            exclude_data: self.req.contains(ReplicaReq::RDB_EXCLUDE_DATA),
            exclude_functions: self.req.contains(ReplicaReq::RDB_EXCLUDE_FUNCTIONS),
        };
        let job = self.state.snapshot_job_for(filters).await;
        handle
            .psync_initial_offset
            .store(job.initial_offset, Ordering::Release);

        let endoff_line = format!(
            "$ENDOFF:{} {} 0 {}\r\n",
            job.initial_offset,
            self.state.replication.replid(),
            self.client_id
        );
        self.writer.write_all(endoff_line.as_bytes()).await?;
        self.writer.flush().await?;
        handle.set_sync_state(ReplicaSyncState::WaitBgsaveEnd);

        let payload = self.await_snapshot(job, &handle).await?;
        handle.set_sync_state(ReplicaSyncState::SendBulk);
        let mut syncer = InitialSyncer::new(&mut self.writer);
        if self.capa.contains(ReplicaCapa::EOF) {
            syncer.send_eof_delimited(&payload).await?;
        } else {
            syncer.send_length_prefixed(&payload).await?;
        }
        handle.set_sync_state(ReplicaSyncState::RdbTransmitted);
        info!(
            "Dual-channel snapshot ({} bytes) transmitted to {} (rdb client id {}).",
            payload.len(),
            self.addr,
            self.client_id
        );
        // The RDB connection has served its purpose; the main connection
        // carries everything from here.
        Ok(Flow::Done)
    }

    /// Waits for the shared snapshot job, aborting if this replica is killed
    /// or the snapshot fails. Newline keepalives flow to the waiting replica
    /// so the link stays demonstrably alive during long saves.
    async fn await_snapshot(
        &mut self,
        mut job: SnapshotJob,
        handle: &Arc<ReplicaHandle>,
    ) -> Result<Bytes, QuartzError> {
        // First tick only after a full period; fast snapshots should not
        // pick up a stray leading newline.
        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + Duration::from_secs(1),
            Duration::from_secs(1),
        );
        loop {
            {
                let value = job.rx.borrow();
                match value.as_ref() {
                    Some(Ok(payload)) => return Ok(payload.clone()),
                    Some(Err(e)) => {
                        return Err(QuartzError::Replication(format!(
                            "snapshot generation failed: {e}"
                        )));
                    }
                    None => {}
                }
            }
            tokio::select! {
                changed = job.rx.changed() => {
                    if changed.is_err() {
                        return Err(QuartzError::Replication(
                            "snapshot job vanished".into(),
                        ));
                    }
                }
                _ = handle.kill.notified() => {
                    return Err(QuartzError::Replication("replica was killed".into()));
                }
                _ = keepalive.tick() => {
                    self.writer.write_all(b"\n").await.ok();
                }
            }
        }
    }

    /// Steady state for a replica whose cursor starts at the live stream
    /// end: wait for the next feed, then attach.
    async fn stream_from_live_end(&mut self, handle: Arc<ReplicaHandle>, target: u64) {
        let mut offset_rx = self.state.repl_offset_rx.clone();
        loop {
            if let Some(cursor) = self.state.backlog.seek(target) {
                self.stream_from(cursor, handle).await;
                return;
            }
            if !self.state.backlog.is_empty() && self.state.backlog.first_offset() > target {
                warn!(
                    "Backlog advanced past offset {target} before {} came online.",
                    self.addr
                );
                return;
            }
            tokio::select! {
                changed = offset_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = handle.kill.notified() => return,
            }
        }
    }

    /// The steady-state loop: drain the cursor on every offset advance,
    /// absorb ACKs from the replica, enforce the lag limit, and honor kill
    /// requests. The cursor is always released on the way out.
    async fn stream_from(&mut self, cursor: CursorId, handle: Arc<ReplicaHandle>) {
        let (output_limit, repl_timeout) = {
            let config = self.state.config.lock().await;
            (
                config.repl_tuning.output_buffer_limit as u64,
                Duration::from_millis(config.repl_tuning.repl_timeout),
            )
        };
        let mut offset_rx = self.state.repl_offset_rx.clone();
        let mut timeout_check = tokio::time::interval(Duration::from_secs(1));

        let reason = loop {
            // Drain everything available before sleeping.
            loop {
                let chunk = self.state.backlog.read(cursor, STREAM_CHUNK);
                if chunk.is_empty() {
                    break;
                }
                if self.writer.write_all(&chunk).await.is_err() {
                    self.release(cursor);
                    return;
                }
            }
            if self.writer.flush().await.is_err() {
                break "write error";
            }

            // A replica that cannot keep up within the configured window is
            // cheaper to resync than to buffer forever.
            let lag = self
                .state
                .replication
                .get_offset()
                .saturating_sub(self.state.backlog.cursor_offset(cursor).unwrap_or(0));
            if lag > output_limit {
                break "output buffer limit exceeded";
            }

            tokio::select! {
                changed = offset_rx.changed() => {
                    if changed.is_err() {
                        break "backlog closed";
                    }
                }
                frame = self.reader.next() => {
                    match frame {
                        Some(Ok(frame)) => {
                            self.absorb_replica_frame(&frame, &handle);
                        }
                        Some(Err(e)) => {
                            debug!("Replica {} protocol error: {e}", self.addr);
                            break "protocol error";
                        }
                        None => break "replica disconnected",
                    }
                }
                _ = handle.kill.notified() => break "killed",
                _ = timeout_check.tick() => {
                    let silent_ms = crate::core::now_ms()
                        .saturating_sub(handle.ack_time_ms.load(Ordering::Acquire));
                    if silent_ms > repl_timeout.as_millis() as u64 {
                        break "ack timeout";
                    }
                }
            }
        };

        info!("Replica {} stream ended: {reason}", self.addr);
        self.release(cursor);
    }

    /// Frames read from a streaming replica: ACKs, keepalives, nothing else.
    fn absorb_replica_frame(&self, frame: &RespFrame, handle: &Arc<ReplicaHandle>) {
        let Some((name, args)) = frame.as_command() else {
            return;
        };
        if name != "REPLCONF" || args.is_empty() {
            return;
        }
        if !args[0].eq_ignore_ascii_case(b"ack") || args.len() < 2 {
            return;
        }
        let offset: u64 = String::from_utf8_lossy(&args[1]).parse().unwrap_or(0);
        let mut fack = None;
        if args.len() >= 4 && args[2].eq_ignore_ascii_case(b"fack") {
            fack = String::from_utf8_lossy(&args[3]).parse().ok();
        }
        handle.update_ack(offset, fack);
        // The first ACK after a dual-channel load completes the transition
        // to steady state.
        if handle.sync_state() == ReplicaSyncState::BgRdbLoad {
            info!(
                "Replica {} finished its dual-channel load; now online.",
                self.addr
            );
            handle.set_sync_state(ReplicaSyncState::Online);
        }
    }

    fn register(&self, initial_state: ReplicaSyncState) -> Arc<ReplicaHandle> {
        let handle = Arc::new(ReplicaHandle::new(
            self.client_id,
            self.addr,
            initial_state,
            self.capa,
            self.req,
            self.listening_port,
            self.announced_ip.clone(),
            self.replica_version.clone(),
        ));
        self.state.replicas.insert(self.client_id, handle.clone());
        handle
    }

    fn release(&self, cursor: CursorId) {
        self.state.backlog.release(cursor);
    }

    async fn reply_simple(&mut self, value: &str) -> Result<(), QuartzError> {
        self.writer
            .write_all(format!("+{value}\r\n").as_bytes())
            .await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn reply_error(&mut self, value: &str) -> Result<(), QuartzError> {
        self.writer
            .write_all(format!("-{value}\r\n").as_bytes())
            .await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Entry point used by the listener for every accepted replication-surface
/// connection.
pub async fn handle_connection<S: AsyncRead + AsyncWrite + Unpin + Send + 'static>(
    state: Arc<ServerState>,
    addr: SocketAddr,
    stream: S,
    shutdown_rx: broadcast::Receiver<()>,
) {
    ReplicaHandler::new(state, addr, stream)
        .run(shutdown_rx)
        .await;
}

// src/core/replication/worker.rs

//! Implements the replication logic for a replica server.
//!
//! This worker owns the entire lifecycle of a replica's connection to its
//! primary: connect, the multi-step handshake (PING, AUTH, REPLCONF, PSYNC),
//! full synchronization over one or two connections, and the steady-state
//! command stream. It reconnects with exponential backoff and can be
//! reconfigured at runtime to follow a new primary after a failover. Every
//! failure path funnels through one cancellation point that resets the
//! transfer state, so the next cycle always starts from a clean handshake.

use crate::config::ReplicationConfig;
use crate::core::QuartzError;
use crate::core::engine::SnapshotSource;
use crate::core::protocol::{RespFrame, RespFrameCodec};
use crate::core::replication::sync::{self, SnapshotFraming};
use crate::core::state::{PrimaryLinkInfo, ServerState};
use bytes::Bytes;
use futures::StreamExt;
use std::io::Cursor;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader as TokioBufReader, ReadHalf,
    WriteHalf, split,
};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast};
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::{TlsConnector, rustls};
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

// The initial delay before the first reconnection attempt.
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
// The maximum delay for the exponential backoff reconnection strategy.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
// Cadence of REPLCONF ACK reports and of keepalive newlines during loads.
const ACK_INTERVAL: Duration = Duration::from_secs(1);

// An enum to abstract over different stream types (plain TCP or TLS),
// allowing the replication logic to be generic over the transport layer.
enum ReplicaStream {
    Tcp(TcpStream),
    Tls(Box<ClientTlsStream<TcpStream>>),
}

impl AsyncRead for ReplicaStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ReplicaStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ReplicaStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ReplicaStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            ReplicaStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ReplicaStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            ReplicaStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ReplicaStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            ReplicaStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ReplicaStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A reader that yields whatever the handshake codec buffered ahead before
/// continuing with the raw socket. Dropping that readahead would lose the
/// first bytes of a snapshot that rides the same segment as a reply.
type BufferedReader = TokioBufReader<Box<dyn AsyncRead + Send + Unpin>>;

fn into_buffered(framed: FramedRead<ReadHalf<ReplicaStream>, RespFrameCodec>) -> BufferedReader {
    let leftover = framed.read_buffer().clone().freeze();
    let chained = Cursor::new(leftover).chain(framed.into_inner());
    TokioBufReader::new(Box::new(chained) as Box<dyn AsyncRead + Send + Unpin>)
}

/// The primary's verdict on our PSYNC.
#[derive(Debug)]
enum HandshakeReply {
    /// `+CONTINUE`: resume the cached stream where it left off.
    Partial,
    /// `+FULLRESYNC <replid> <offset>`: a snapshot follows on this connection.
    Full { replid: String, offset: u64 },
    /// `+DUALCHANNELSYNC`: open a second connection for the snapshot.
    DualChannel,
    /// Legacy fallback: bare SYNC accepted, snapshot follows with no header.
    LegacyFull,
}

/// The main worker task for a replica server.
pub struct ReplicaWorker {
    state: Arc<ServerState>,
    /// Tracks the last primary endpoint to detect failover retargeting.
    last_known_primary: Option<(String, u16)>,
    /// Set after a dual-channel attempt failed; the next full sync falls
    /// back to the single-connection path instead of retrying forever.
    dual_channel_blocked: bool,
}

impl ReplicaWorker {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self {
            state,
            last_known_primary: None,
            dual_channel_blocked: false,
        }
    }

    /// The main run loop: manages the connection state and reconnection with
    /// exponential backoff, and follows retargeting after failovers.
    pub async fn run(
        mut self,
        mut shutdown_rx: broadcast::Receiver<()>,
        mut reconfigure_rx: broadcast::Receiver<()>,
    ) {
        info!("Replica worker started.");
        let mut current_delay = INITIAL_RECONNECT_DELAY;

        loop {
            // Re-read the replication target every cycle so a missed
            // reconfigure signal still converges.
            let (host, port) = {
                let config = self.state.config.lock().await;
                match &config.replication {
                    ReplicationConfig::Replica {
                        primary_host,
                        primary_port,
                        ..
                    } => (primary_host.clone(), *primary_port),
                    _ => {
                        info!("Server role is no longer REPLICA. Stopping replication worker.");
                        return;
                    }
                }
            };
            if self.last_known_primary.as_ref() != Some(&(host.clone(), port)) {
                info!("Replication target is now {host}:{port}.");
                self.last_known_primary = Some((host, port));
                current_delay = INITIAL_RECONNECT_DELAY;
            }

            tokio::select! {
                _ = reconfigure_rx.recv() => {
                    info!("Reconfigure signal received; restarting the connection cycle.");
                    current_delay = INITIAL_RECONNECT_DELAY;
                    continue;
                }
                result = self.handle_connection_cycle() => {
                    match result {
                        Err(e) => warn!("Replication cycle failed: {e}. Reconnecting..."),
                        Ok(()) => {
                            info!("Connection to primary closed cleanly. Reconnecting...");
                            current_delay = INITIAL_RECONNECT_DELAY;
                        }
                    }
                    let jitter = Duration::from_millis(
                        rand::Rng::gen_range(&mut rand::thread_rng(), 0..500),
                    );
                    let wait_time = current_delay + jitter;
                    info!("Will try to reconnect to primary in {wait_time:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(wait_time) => {}
                        _ = shutdown_rx.recv() => { info!("Replica worker shutting down during backoff."); return; }
                        _ = reconfigure_rx.recv() => { info!("Reconfigure during backoff; reconnecting immediately."); }
                    }
                    current_delay = (current_delay * 2).min(MAX_RECONNECT_DELAY);
                }
                _ = shutdown_rx.recv() => {
                    info!("Replica worker shutting down.");
                    return;
                }
            }
        }
    }

    /// One connection lifecycle: connect, handshake, synchronize, stream.
    async fn handle_connection_cycle(&mut self) -> Result<(), QuartzError> {
        let (host, port, tls_enabled, my_port, announce_ip) = {
            let config = self.state.config.lock().await;
            match &config.replication {
                ReplicationConfig::Replica {
                    primary_host,
                    primary_port,
                    tls_enabled,
                } => (
                    primary_host.clone(),
                    *primary_port,
                    *tls_enabled,
                    config.port,
                    config.cluster.announce_ip.clone(),
                ),
                _ => {
                    return Err(QuartzError::Internal(
                        "replica worker running with non-replica config".into(),
                    ));
                }
            }
        };

        let stream = connect_to_primary(&host, port, tls_enabled).await?;
        info!("Connected to primary at {host}:{port}. Starting handshake...");

        let (reader, mut writer) = split(stream);
        let mut framed = FramedRead::new(reader, RespFrameCodec);

        let reply = self
            .perform_handshake(&mut framed, &mut writer, my_port, announce_ip)
            .await?;
        debug!("Handshake completed: {reply:?}");

        match reply {
            HandshakeReply::Partial => {
                info!("Partial resync granted; resuming the command stream.");
                self.steady_state(&mut framed, writer).await
            }
            HandshakeReply::Full { replid, offset } => {
                if self.state.replication.is_upstream_poisoned(&replid) {
                    return Err(QuartzError::Replication(format!(
                        "refusing to full-sync from demoted history {replid}"
                    )));
                }
                let mut framed = self
                    .receive_full_snapshot(framed, &mut writer, &replid, offset)
                    .await?;
                info!("Full resync complete at offset {offset}.");
                self.steady_state(&mut framed, writer).await
            }
            HandshakeReply::LegacyFull => {
                let mut framed = self
                    .receive_full_snapshot(framed, &mut writer, "?", 0)
                    .await?;
                info!("Legacy SYNC transfer complete.");
                self.steady_state(&mut framed, writer).await
            }
            HandshakeReply::DualChannel => {
                match self
                    .dual_channel_sync(&mut framed, &mut writer, &host, port, tls_enabled, my_port)
                    .await
                {
                    Ok(()) => self.steady_state(&mut framed, writer).await,
                    Err(e) => {
                        // A failed dual-channel attempt degrades to the
                        // single-connection path on the next cycle rather
                        // than looping on the same failure.
                        self.dual_channel_blocked = true;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Resets the partial-sync context so the next handshake starts from
    /// scratch. Every sync failure funnels through here.
    async fn cancel_sync(&mut self, reason: &str) {
        warn!("Cancelling replication sync: {reason}");
        *self.state.replication.primary_link.lock().await = None;
    }

    async fn perform_handshake<R, W>(
        &mut self,
        framed: &mut FramedRead<R, RespFrameCodec>,
        writer: &mut W,
        my_port: u16,
        announce_ip: Option<String>,
    ) -> Result<HandshakeReply, QuartzError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        // Step 1: PING.
        send_command(writer, &[b"PING"]).await?;
        expect_simple(framed, "PONG").await?;

        // Step 2: AUTH, when the deployment has a shared password.
        let password = self.state.config.lock().await.password.clone();
        if let Some(password) = password {
            send_command(writer, &[b"AUTH", password.as_bytes()]).await?;
            expect_simple(framed, "OK").await?;
        }

        // Step 3: REPLCONF listening-port.
        let port_str = my_port.to_string();
        send_command(writer, &[b"REPLCONF", b"listening-port", port_str.as_bytes()]).await?;
        expect_simple(framed, "OK").await?;

        // Step 4: REPLCONF ip-address, only when explicitly announced.
        if let Some(ip) = announce_ip {
            send_command(writer, &[b"REPLCONF", b"ip-address", ip.as_bytes()]).await?;
            expect_simple(framed, "OK").await?;
        }

        // Step 5: capabilities.
        let dual = !self.dual_channel_blocked;
        let mut capa: Vec<&[u8]> = vec![b"REPLCONF", b"capa", b"eof", b"capa", b"psync2"];
        if dual {
            capa.extend_from_slice(&[b"capa", b"dual-channel"]);
        }
        send_command(writer, &capa).await?;
        expect_simple(framed, "OK").await?;

        // Step 6: our software version, for the primary's bookkeeping.
        send_command(
            writer,
            &[b"REPLCONF", b"version", env!("CARGO_PKG_VERSION").as_bytes()],
        )
        .await?;
        expect_simple(framed, "OK").await?;

        // Step 7: PSYNC against the cached history, or a blind `? -1`.
        let (replid, wanted) = {
            let link = self.state.replication.primary_link.lock().await;
            match link.as_ref() {
                Some(info) => (info.replid.clone(), (info.processed_offset + 1).to_string()),
                None => ("?".to_string(), "-1".to_string()),
            }
        };
        info!("Sending PSYNC {replid} {wanted}");
        send_command(writer, &[b"PSYNC", replid.as_bytes(), wanted.as_bytes()]).await?;

        let reply = framed
            .next()
            .await
            .ok_or_else(|| QuartzError::Replication("connection closed during PSYNC".into()))??;
        match reply {
            RespFrame::SimpleString(s) if s.starts_with("CONTINUE") => {
                // `+CONTINUE [new-replid]`: a changed id means our primary
                // was itself promoted; adopt the new history and force our
                // own replicas to renegotiate.
                if let Some(new_replid) = s.split_whitespace().nth(1) {
                    let old = self.state.replication.replid();
                    if old != new_replid {
                        info!("Primary replication id changed to {new_replid}.");
                        self.state.replication.adopt_upstream_replid(new_replid);
                        self.state
                            .disconnect_all_replicas("upstream replication id changed");
                        if let Some(link) =
                            self.state.replication.primary_link.lock().await.as_mut()
                        {
                            link.replid = new_replid.to_string();
                        }
                    }
                }
                Ok(HandshakeReply::Partial)
            }
            RespFrame::SimpleString(s) if s.starts_with("FULLRESYNC") => {
                let parts: Vec<&str> = s.split_whitespace().collect();
                if parts.len() != 3 {
                    return Err(QuartzError::Replication("invalid FULLRESYNC format".into()));
                }
                Ok(HandshakeReply::Full {
                    replid: parts[1].to_string(),
                    offset: parts[2].parse().map_err(|_| {
                        QuartzError::Replication("invalid FULLRESYNC offset".into())
                    })?,
                })
            }
            RespFrame::SimpleString(s) if s.starts_with("DUALCHANNELSYNC") => {
                Ok(HandshakeReply::DualChannel)
            }
            RespFrame::Error(e) if e.starts_with("NOMASTERLINK") || e.starts_with("LOADING") => {
                Err(QuartzError::Replication(format!("primary not ready: {e}")))
            }
            RespFrame::Error(e) => {
                // An old-style primary: fall back to the legacy SYNC.
                warn!("PSYNC rejected ({e}); falling back to SYNC.");
                self.cancel_sync("PSYNC unsupported by primary").await;
                send_command(writer, &[b"SYNC"]).await?;
                Ok(HandshakeReply::LegacyFull)
            }
            other => Err(QuartzError::Replication(format!(
                "unexpected PSYNC reply: {other:?}"
            ))),
        }
    }

    /// Receives and loads a snapshot arriving on the main connection, then
    /// re-frames the reader for the command stream that follows.
    async fn receive_full_snapshot(
        &mut self,
        framed: FramedRead<ReadHalf<ReplicaStream>, RespFrameCodec>,
        writer: &mut WriteHalf<ReplicaStream>,
        replid: &str,
        offset: u64,
    ) -> Result<FramedRead<BufferedReader, RespFrameCodec>, QuartzError> {
        let (diskless_load, transfer_dir, repl_timeout) = {
            let config = self.state.config.lock().await;
            (
                config.repl_tuning.diskless_load,
                config.repl_tuning.transfer_dir.clone(),
                config.repl_tuning.repl_timeout,
            )
        };

        // Anything buffered by the codec belongs to the snapshot stream.
        let mut reader = into_buffered(framed);

        let load_result = tokio::time::timeout(
            Duration::from_millis(repl_timeout),
            self.transfer_and_load(&mut reader, writer, diskless_load, &transfer_dir),
        )
        .await;
        let loaded = match load_result {
            Ok(result) => result,
            Err(_) => Err(QuartzError::Timeout("snapshot transfer timed out".into())),
        };
        if let Err(e) = loaded {
            self.cancel_sync("snapshot transfer or load failed").await;
            return Err(e);
        }

        // Adopt the new history. Anything retained for sub-replicas belongs
        // to the old one, so they must renegotiate.
        self.state.backlog.reset();
        self.state
            .disconnect_all_replicas("replication history replaced by full resync");
        self.state.replication.set_replid(replid.to_string());
        self.state
            .replication
            .master_repl_offset
            .store(offset, std::sync::atomic::Ordering::SeqCst);
        *self.state.replication.primary_link.lock().await = Some(PrimaryLinkInfo {
            replid: replid.to_string(),
            processed_offset: offset,
            fsynced_offset: offset,
        });

        // The command stream continues through the same buffered reader, so
        // nothing read ahead of the snapshot end is lost.
        Ok(FramedRead::new(reader, RespFrameCodec))
    }

    /// The transfer itself: disk or diskless, with keepalive newlines toward
    /// the primary while the load runs.
    async fn transfer_and_load<R, W>(
        &self,
        reader: &mut TokioBufReader<R>,
        writer: &mut W,
        diskless_load: bool,
        transfer_dir: &str,
    ) -> Result<(), QuartzError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let framing = sync::read_snapshot_preamble(reader).await?;
        match &framing {
            SnapshotFraming::Length(len) => {
                info!("Receiving snapshot of {len} bytes from primary.")
            }
            SnapshotFraming::Eof(_) => info!("Receiving streamed snapshot from primary."),
        }

        let source = if diskless_load {
            let payload = sync::receive_snapshot_bytes(reader, &framing).await?;
            writer.write_all(b"\n").await.ok();
            self.state.engine.empty_all_data().await;
            SnapshotSource::Bytes(payload)
        } else {
            tokio::fs::create_dir_all(transfer_dir).await.ok();
            let path = PathBuf::from(transfer_dir).join("sync-snapshot.qdb");
            let written = sync::receive_snapshot_to_file(reader, &framing, &path).await?;
            info!("Snapshot spooled to {} ({written} bytes).", path.display());
            writer.write_all(b"\n").await.ok();
            self.state.engine.empty_all_data().await;
            SnapshotSource::File(path)
        };

        // The load can take a while on big datasets; keep the link alive
        // with periodic single-byte writes the primary treats as no-ops.
        let mut keepalive = tokio::time::interval(ACK_INTERVAL);
        let load = self.state.snapshots.load_snapshot(source);
        tokio::pin!(load);
        loop {
            tokio::select! {
                result = &mut load => {
                    result.map_err(|e| {
                        QuartzError::Replication(format!("snapshot load failed: {e}"))
                    })?;
                    return Ok(());
                }
                _ = keepalive.tick() => {
                    writer.write_all(b"\n").await.ok();
                }
            }
        }
    }

    /// The dual-channel full sync: the snapshot travels on a second
    /// connection while this connection accumulates the live stream in a
    /// bounded pending buffer, drained into the engine once the load ends.
    async fn dual_channel_sync(
        &mut self,
        main_framed: &mut FramedRead<ReadHalf<ReplicaStream>, RespFrameCodec>,
        main_writer: &mut WriteHalf<ReplicaStream>,
        host: &str,
        port: u16,
        tls_enabled: bool,
        my_port: u16,
    ) -> Result<(), QuartzError> {
        let (pending_limit, diskless_load, transfer_dir, repl_timeout) = {
            let config = self.state.config.lock().await;
            (
                config.repl_tuning.output_buffer_limit,
                config.repl_tuning.diskless_load,
                config.repl_tuning.transfer_dir.clone(),
                config.repl_tuning.repl_timeout,
            )
        };

        // --- RDB connection handshake ---
        let rdb_stream = connect_to_primary(host, port, tls_enabled).await?;
        let (rdb_read, mut rdb_write) = split(rdb_stream);
        let mut rdb_framed = FramedRead::new(rdb_read, RespFrameCodec);

        let password = self.state.config.lock().await.password.clone();
        if let Some(password) = password {
            send_command(&mut rdb_write, &[b"AUTH", password.as_bytes()]).await?;
            expect_simple(&mut rdb_framed, "OK").await?;
        }
        let port_str = my_port.to_string();
        send_command(
            &mut rdb_write,
            &[
                b"REPLCONF",
                b"capa",
                b"eof",
                b"rdb-only",
                b"1",
                b"rdb-channel",
                b"1",
                b"listening-port",
                port_str.as_bytes(),
            ],
        )
        .await?;
        expect_simple(&mut rdb_framed, "OK").await?;
        send_command(&mut rdb_write, &[b"SYNC"]).await?;

        // `$ENDOFF:<offset> <replid> <dbid> <rdb-client-id>`
        let mut rdb_reader = into_buffered(rdb_framed);
        let endoff_line = read_line(&mut rdb_reader).await?;
        let rest = endoff_line.strip_prefix("$ENDOFF:").ok_or_else(|| {
            QuartzError::Replication(format!("expected $ENDOFF, got: {endoff_line}"))
        })?;
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(QuartzError::Replication("malformed $ENDOFF line".into()));
        }
        let end_offset: u64 = fields[0]
            .parse()
            .map_err(|_| QuartzError::Replication("invalid $ENDOFF offset".into()))?;
        let replid = fields[1].to_string();
        let rdb_client_id = fields[3].to_string();
        info!(
            "Dual channel sync: snapshot cut at offset {end_offset}, rdb client id {rdb_client_id}."
        );
        if self.state.replication.is_upstream_poisoned(&replid) {
            return Err(QuartzError::Replication(format!(
                "refusing to full-sync from demoted history {replid}"
            )));
        }

        // --- Pair the channels and ask for the stream on the main one ---
        send_command(
            main_writer,
            &[b"REPLCONF", b"set-rdb-client-id", rdb_client_id.as_bytes()],
        )
        .await?;
        expect_simple(main_framed, "OK").await?;
        let resume = (end_offset + 1).to_string();
        send_command(main_writer, &[b"PSYNC", replid.as_bytes(), resume.as_bytes()]).await?;
        let reply = main_framed.next().await.ok_or_else(|| {
            QuartzError::Replication("connection closed during dual-channel PSYNC".into())
        })??;
        match reply {
            RespFrame::SimpleString(s) if s.starts_with("CONTINUE") => {}
            other => {
                return Err(QuartzError::Replication(format!(
                    "dual-channel PSYNC not continued: {other:?}"
                )));
            }
        }

        // --- Snapshot on the RDB connection, stream buffered on main ---
        let state = self.state.clone();
        let task_dir = transfer_dir.clone();
        let rdb_task = tokio::spawn(async move {
            let framing = sync::read_snapshot_preamble(&mut rdb_reader).await?;
            if diskless_load {
                let payload = sync::receive_snapshot_bytes(&mut rdb_reader, &framing).await?;
                state.engine.empty_all_data().await;
                state
                    .snapshots
                    .load_snapshot(SnapshotSource::Bytes(payload))
                    .await
            } else {
                tokio::fs::create_dir_all(&task_dir).await.ok();
                let path = PathBuf::from(&task_dir).join("sync-snapshot.qdb");
                sync::receive_snapshot_to_file(&mut rdb_reader, &framing, &path).await?;
                state.engine.empty_all_data().await;
                state
                    .snapshots
                    .load_snapshot(SnapshotSource::File(path))
                    .await
            }
        });
        tokio::pin!(rdb_task);

        let mut pending: Vec<Bytes> = Vec::new();
        let mut pending_bytes = 0usize;
        let mut keepalive = tokio::time::interval(ACK_INTERVAL);
        let deadline = tokio::time::sleep(Duration::from_millis(repl_timeout));
        tokio::pin!(deadline);

        let load_result: Result<(), QuartzError> = loop {
            tokio::select! {
                joined = &mut rdb_task => {
                    match joined {
                        Ok(Ok(())) => break Ok(()),
                        Ok(Err(e)) => break Err(e),
                        Err(e) => break Err(QuartzError::Internal(format!(
                            "snapshot task panicked: {e}"
                        ))),
                    }
                }
                frame = main_framed.next() => {
                    let Some(frame) = frame else {
                        break Err(QuartzError::Replication(
                            "main connection closed during dual-channel sync".into(),
                        ));
                    };
                    let encoded = frame?.encode_to_vec()?;
                    pending_bytes += encoded.len();
                    if pending_bytes > pending_limit {
                        // The buffer bound exists to protect the replica; a
                        // sync that overflows it restarts single-channel.
                        break Err(QuartzError::Replication(
                            "pending replication buffer overflowed during dual-channel sync"
                                .into(),
                        ));
                    }
                    pending.push(Bytes::from(encoded));
                }
                _ = keepalive.tick() => {
                    main_writer.write_all(b"\n").await.ok();
                }
                _ = &mut deadline => {
                    break Err(QuartzError::Timeout(
                        "dual-channel snapshot transfer timed out".into(),
                    ));
                }
            }
        };
        if let Err(e) = load_result {
            self.cancel_sync("dual-channel sync failed").await;
            return Err(e);
        }

        // Adopt the history at the snapshot cut, then apply the buffered
        // tail so our offset lands exactly where the live stream continues.
        self.state.backlog.reset();
        self.state
            .disconnect_all_replicas("replication history replaced by full resync");
        self.state.replication.set_replid(replid.clone());
        self.state
            .replication
            .master_repl_offset
            .store(end_offset, std::sync::atomic::Ordering::SeqCst);
        *self.state.replication.primary_link.lock().await = Some(PrimaryLinkInfo {
            replid,
            processed_offset: end_offset,
            fsynced_offset: end_offset,
        });

        let buffered = pending.len();
        for payload in pending {
            self.apply_stream_payload(payload).await?;
        }
        info!("Dual channel sync complete: snapshot loaded, {buffered} buffered units applied.");
        Ok(())
    }

    /// Steady state: apply the stream, relay it to sub-replicas, and report
    /// our offset every second.
    async fn steady_state<Rd>(
        &mut self,
        framed: &mut FramedRead<Rd, RespFrameCodec>,
        writer: WriteHalf<ReplicaStream>,
    ) -> Result<(), QuartzError>
    where
        Rd: AsyncRead + Unpin + Send,
    {
        info!("Now in sync with primary; processing the command stream.");
        let repl_timeout = {
            let config = self.state.config.lock().await;
            Duration::from_millis(config.repl_tuning.repl_timeout)
        };
        let writer = Arc::new(Mutex::new(writer));
        let mut ack_tick = tokio::time::interval(ACK_INTERVAL);
        let mut last_data = tokio::time::Instant::now();

        loop {
            tokio::select! {
                frame = framed.next() => {
                    let Some(frame) = frame else {
                        self.cancel_sync("primary closed the connection").await;
                        return Err(QuartzError::Replication("primary link lost".into()));
                    };
                    let frame = frame?;
                    last_data = tokio::time::Instant::now();
                    if let Some(reply_offset) = self.getack_requested(&frame).await {
                        send_ack(&writer, reply_offset).await;
                        continue;
                    }
                    let encoded = frame.encode_to_vec()?;
                    if let Err(e) = self.apply_stream_payload(Bytes::from(encoded)).await {
                        self.cancel_sync("failed to apply replicated data").await;
                        return Err(e);
                    }
                }
                _ = ack_tick.tick() => {
                    if last_data.elapsed() > repl_timeout {
                        self.cancel_sync("primary link timed out").await;
                        return Err(QuartzError::Timeout(
                            "no traffic from primary within repl timeout".into(),
                        ));
                    }
                    let offset = self
                        .state
                        .replication
                        .primary_link
                        .lock()
                        .await
                        .as_ref()
                        .map_or(0, |info| info.processed_offset);
                    send_ack(&writer, offset).await;
                }
            }
        }
    }

    /// Applies one replicated unit: hand the bytes to the engine, mirror
    /// them into our own backlog for sub-replicas, and advance the offsets.
    async fn apply_stream_payload(&self, payload: Bytes) -> Result<(), QuartzError> {
        let len = payload.len() as u64;
        self.state.engine.apply_replicated(payload.clone()).await?;
        // Sub-replicas must observe bit-identical bytes at identical
        // offsets, so the upstream stream is relayed verbatim.
        self.state.backlog.feed(
            &payload,
            self.state
                .replication
                .primary_link
                .lock()
                .await
                .as_ref()
                .map_or(1, |info| info.processed_offset + 1),
        );
        if let Some(link) = self.state.replication.primary_link.lock().await.as_mut() {
            link.processed_offset += len;
            link.fsynced_offset = link.processed_offset;
            self.state
                .replication
                .master_repl_offset
                .store(link.processed_offset, std::sync::atomic::Ordering::SeqCst);
        }
        Ok(())
    }

    /// Detects `REPLCONF GETACK *` from the primary, which demands an
    /// immediate offset report.
    async fn getack_requested(&self, frame: &RespFrame) -> Option<u64> {
        let (name, args) = frame.as_command()?;
        if name == "REPLCONF"
            && args
                .first()
                .is_some_and(|a| a.eq_ignore_ascii_case(b"getack"))
        {
            // The GETACK itself is part of the stream and counts toward the
            // offset before the ACK is produced.
            let encoded = frame.encode_to_vec().ok()?;
            self.apply_stream_payload(Bytes::from(encoded)).await.ok()?;
            let offset = self
                .state
                .replication
                .primary_link
                .lock()
                .await
                .as_ref()
                .map_or(0, |info| info.processed_offset);
            return Some(offset);
        }
        None
    }
}

async fn connect_to_primary(
    host: &str,
    port: u16,
    tls_enabled: bool,
) -> Result<ReplicaStream, QuartzError> {
    let addr = format!("{host}:{port}");
    let tcp_stream = TcpStream::connect(&addr)
        .await
        .map_err(|e| QuartzError::Replication(format!("failed to connect to {addr}: {e}")))?;
    tcp_stream.set_nodelay(true).ok();

    if !tls_enabled {
        return Ok(ReplicaStream::Tcp(tcp_stream));
    }

    info!("Establishing TLS connection with primary at {addr}");
    let mut root_cert_store = rustls::RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));
    let domain = rustls::pki_types::ServerName::try_from(host)
        .map_err(|_| QuartzError::Replication("invalid TLS domain name".into()))?
        .to_owned();
    let tls_stream = connector
        .connect(domain, tcp_stream)
        .await
        .map_err(|e| QuartzError::Replication(format!("TLS handshake failed: {e}")))?;
    Ok(ReplicaStream::Tls(Box::new(tls_stream)))
}

async fn send_command<W: AsyncWrite + Unpin>(
    writer: &mut W,
    parts: &[&[u8]],
) -> Result<(), QuartzError> {
    let encoded = RespFrame::command(parts).encode_to_vec()?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

async fn expect_simple<R: AsyncRead + Unpin>(
    framed: &mut FramedRead<R, RespFrameCodec>,
    expected: &str,
) -> Result<(), QuartzError> {
    let frame = framed
        .next()
        .await
        .ok_or_else(|| QuartzError::Replication("connection closed during handshake".into()))??;
    match frame {
        RespFrame::SimpleString(s) if s.eq_ignore_ascii_case(expected) => Ok(()),
        RespFrame::Error(e) => Err(QuartzError::Replication(format!(
            "primary returned error: {e}"
        ))),
        other => Err(QuartzError::Replication(format!(
            "expected '{expected}', got: {other:?}"
        ))),
    }
}

async fn read_line<R: AsyncRead + Unpin>(
    reader: &mut TokioBufReader<R>,
) -> Result<String, QuartzError> {
    use tokio::io::AsyncBufReadExt;
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(QuartzError::Replication("connection closed".into()));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            continue;
        }
        return Ok(trimmed.to_string());
    }
}

async fn send_ack<W: AsyncWrite + Unpin>(writer: &Arc<Mutex<W>>, offset: u64) {
    let offset_str = offset.to_string();
    let frame = RespFrame::command(&[b"REPLCONF", b"ACK", offset_str.as_bytes()]);
    if let Ok(encoded) = frame.encode_to_vec()
        && let Err(e) = writer.lock().await.write_all(&encoded).await
    {
        error!("Failed to send ACK to primary: {e}");
    }
}

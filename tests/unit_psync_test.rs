// tests/unit_psync_test.rs

//! Primary-side PSYNC behavior, exercised over an in-memory socket pair:
//! the partial-versus-full decision, the +CONTINUE byte stream, the
//! FULLRESYNC snapshot delivery, and ACK bookkeeping.

mod common;

use common::standalone_context;
use quartzkv::config::Config;
use quartzkv::core::protocol::RespFrame;
use quartzkv::core::replication::handler;
use quartzkv::core::state::ReplicaSyncState;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::broadcast;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawns a handler on one end of a duplex pipe and returns the client end.
fn connect(ctx: &common::TestContext) -> DuplexStream {
    let (client, server) = tokio::io::duplex(256 * 1024);
    let state = ctx.state.clone();
    let (shutdown_tx, _) = broadcast::channel(1);
    let shutdown_rx = shutdown_tx.subscribe();
    // The sender must outlive the handler task.
    std::mem::forget(shutdown_tx);
    tokio::spawn(async move {
        let addr = "127.0.0.1:4444".parse().unwrap();
        handler::handle_connection(state, addr, server, shutdown_rx).await;
    });
    client
}

async fn send_command(client: &mut DuplexStream, parts: &[&[u8]]) {
    let encoded = RespFrame::command(parts).encode_to_vec().unwrap();
    client.write_all(&encoded).await.unwrap();
}

/// Reads one CRLF-terminated line.
async fn read_line(client: &mut DuplexStream) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        client.read_exact(&mut byte).await.unwrap();
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&line[..line.len() - 2]).to_string()
}

async fn read_exactly(client: &mut DuplexStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    client.read_exact(&mut buf).await.unwrap();
    buf
}

/// Feeds `n` deterministic bytes into the primary's replication stream.
fn feed_bytes(ctx: &common::TestContext, n: usize) -> Vec<u8> {
    let data: Vec<u8> = (0..n).map(|i| (i % 241) as u8).collect();
    ctx.state.feed_replication_stream(&data);
    data
}

#[tokio::test]
async fn partial_resync_streams_from_the_requested_offset() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let ctx = standalone_context(Config::default());
        let replid = ctx.state.replication.replid();
        let history = feed_bytes(&ctx, 1500);

        let mut client = connect(&ctx);
        send_command(&mut client, &[b"PING"]).await;
        assert_eq!(read_line(&mut client).await, "+PONG");

        // PSYNC asking for offset 1001 under the live replication id.
        send_command(&mut client, &[b"REPLCONF", b"capa", b"psync2"]).await;
        assert_eq!(read_line(&mut client).await, "+OK");
        send_command(&mut client, &[b"PSYNC", replid.as_bytes(), b"1001"]).await;

        let reply = read_line(&mut client).await;
        assert_eq!(reply, format!("+CONTINUE {replid}"));

        let streamed = read_exactly(&mut client, 500).await;
        assert_eq!(&streamed[..], &history[1000..]);

        // Live bytes keep flowing over the same connection.
        let more = feed_bytes(&ctx, 100);
        let live = read_exactly(&mut client, 100).await;
        assert_eq!(live, more);

        // An ACK updates the registered replica handle monotonically.
        send_command(&mut client, &[b"REPLCONF", b"ACK", b"1600"]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let handle = ctx
            .state
            .replicas
            .iter()
            .next()
            .map(|e| e.value().clone())
            .expect("replica registered");
        assert_eq!(handle.ack_offset.load(Ordering::Acquire), 1600);
        assert_eq!(handle.sync_state(), ReplicaSyncState::Online);

        // A stale ACK cannot move the offset backwards.
        send_command(&mut client, &[b"REPLCONF", b"ACK", b"900"]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.ack_offset.load(Ordering::Acquire), 1600);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_history_falls_back_to_full_resync() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let ctx = standalone_context(Config::default());
        feed_bytes(&ctx, 300);

        let mut client = connect(&ctx);
        // No EOF capability advertised: the snapshot must arrive with the
        // length-prefixed framing.
        send_command(&mut client, &[b"PSYNC", b"?", b"-1"]).await;

        let reply = read_line(&mut client).await;
        let parts: Vec<&str> = reply.split_whitespace().collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "+FULLRESYNC");
        assert_eq!(parts[1], ctx.state.replication.replid());
        assert_eq!(parts[2], "300");

        let preamble = read_line(&mut client).await;
        let len: usize = preamble.strip_prefix('$').unwrap().parse().unwrap();
        let snapshot = read_exactly(&mut client, len).await;
        assert_eq!(snapshot, b"test-snapshot-bytes");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn requests_beyond_the_backlog_are_denied_partial() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let ctx = standalone_context(Config::default());
        let replid = ctx.state.replication.replid();
        feed_bytes(&ctx, 100);

        let mut client = connect(&ctx);
        // Offset 500 was never produced; the only answer is a full sync.
        send_command(&mut client, &[b"PSYNC", replid.as_bytes(), b"500"]).await;
        let reply = read_line(&mut client).await;
        assert!(reply.starts_with("+FULLRESYNC"), "got: {reply}");
        assert_eq!(
            ctx.state.replication.partial_syncs_err.load(Ordering::Relaxed),
            1
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn legacy_sync_ships_the_snapshot_without_a_header() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let ctx = standalone_context(Config::default());
        feed_bytes(&ctx, 10);

        let mut client = connect(&ctx);
        send_command(&mut client, &[b"SYNC"]).await;
        let preamble = read_line(&mut client).await;
        let len: usize = preamble.strip_prefix('$').unwrap().parse().unwrap();
        let snapshot = read_exactly(&mut client, len).await;
        assert_eq!(snapshot, b"test-snapshot-bytes");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn dual_channel_capable_replicas_are_offered_the_second_connection() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let ctx = standalone_context(Config::default());
        feed_bytes(&ctx, 50);

        let mut client = connect(&ctx);
        send_command(&mut client, &[b"REPLCONF", b"capa", b"eof", b"capa", b"dual-channel"])
            .await;
        assert_eq!(read_line(&mut client).await, "+OK");
        send_command(&mut client, &[b"PSYNC", b"?", b"-1"]).await;
        assert_eq!(read_line(&mut client).await, "+DUALCHANNELSYNC");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rdb_channel_sync_announces_endoff_and_ships_the_snapshot() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let ctx = standalone_context(Config::default());
        feed_bytes(&ctx, 2400);

        let mut client = connect(&ctx);
        send_command(
            &mut client,
            &[b"REPLCONF", b"capa", b"eof", b"rdb-channel", b"1", b"listening-port", b"7451"],
        )
        .await;
        assert_eq!(read_line(&mut client).await, "+OK");
        send_command(&mut client, &[b"SYNC"]).await;

        // $ENDOFF:<offset> <replid> <dbid> <client-id>
        let endoff = read_line(&mut client).await;
        let rest = endoff.strip_prefix("$ENDOFF:").expect("endoff line");
        let fields: Vec<&str> = rest.split_whitespace().collect();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0], "2400");
        assert_eq!(fields[1], ctx.state.replication.replid());
        assert_eq!(fields[2], "0");

        // EOF-delimited snapshot follows.
        let preamble = read_line(&mut client).await;
        let delim = preamble.strip_prefix("$EOF:").expect("eof framing");
        assert_eq!(delim.len(), 40);
        let mut payload = read_exactly(&mut client, b"test-snapshot-bytes".len() + 40).await;
        let trailer = payload.split_off(payload.len() - 40);
        assert_eq!(payload, b"test-snapshot-bytes");
        assert_eq!(trailer, delim.as_bytes());
    })
    .await
    .expect("test timed out");
}

// tests/integration/replication_test.rs

//! Full primary/replica synchronization over real TCP: the dual-channel
//! full sync, the live command stream, and ACK convergence.

use crate::common::{replica_context, standalone_context};
use quartzkv::config::Config;
use quartzkv::core::protocol::RespFrame;
use quartzkv::core::replication::{handler, run_replication};
use quartzkv::core::state::ReplicaSyncState;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;

const E2E_TIMEOUT: Duration = Duration::from_secs(15);

/// Polls `probe` every 20ms until it returns true or the timeout hits.
async fn wait_until<F: FnMut() -> bool>(mut probe: F, what: &str) {
    tokio::time::timeout(E2E_TIMEOUT, async {
        loop {
            if probe() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn replica_full_syncs_and_follows_the_live_stream() {
    // --- Primary: real listener feeding accepted sockets to the handler ---
    let primary = standalone_context(Config::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let primary_port = listener.local_addr().unwrap().port();
    {
        let state = primary.state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, addr)) = listener.accept().await else {
                    return;
                };
                stream.set_nodelay(true).ok();
                let state = state.clone();
                let shutdown_rx = state.shutdown_tx.subscribe();
                tokio::spawn(handler::handle_connection(state, addr, stream, shutdown_rx));
            }
        });
    }

    // --- Replica: the regular replication supervisor ---
    let replica = replica_context(primary_port);
    tokio::spawn(run_replication(
        replica.state.clone(),
        replica.state.shutdown_tx.subscribe(),
    ));

    // The full sync must deliver the primary's snapshot bytes.
    let snapshots = replica.snapshots.clone();
    wait_until(
        || {
            snapshots
                .last_loaded
                .lock()
                .as_deref()
                .is_some_and(|b| b == b"test-snapshot-bytes")
        },
        "snapshot load on the replica",
    )
    .await;

    // The replica adopted the primary's replication id.
    assert_eq!(
        replica.state.replication.replid(),
        primary.state.replication.replid()
    );

    // --- Live stream ---
    let cmd = RespFrame::command(&[b"SET", b"user:1", b"quartz"])
        .encode_to_vec()
        .unwrap();
    let offset_after = primary.state.feed_replication_stream(&cmd);

    let engine = replica.engine.clone();
    let cmd_len = cmd.len() as u64;
    wait_until(
        || engine.applied_bytes.load(Ordering::Relaxed) >= cmd_len,
        "replicated bytes applied on the replica",
    )
    .await;

    // The replica's own offset mirrors the primary's.
    wait_until(
        || replica.state.replication.get_offset() == offset_after,
        "replica offset convergence",
    )
    .await;

    // ACKs flow back and flip the replica online on the primary's books.
    let primary_state = primary.state.clone();
    wait_until(
        || {
            primary_state.replicas.iter().any(|e| {
                e.value().sync_state() == ReplicaSyncState::Online
                    && e.value().ack_offset.load(Ordering::Acquire) >= offset_after
            })
        },
        "primary-side ACK bookkeeping",
    )
    .await;

    // A second write keeps the pipeline flowing.
    let cmd2 = RespFrame::command(&[b"DEL", b"user:1"]).encode_to_vec().unwrap();
    let offset_after2 = primary.state.feed_replication_stream(&cmd2);
    wait_until(
        || replica.state.replication.get_offset() == offset_after2,
        "second replicated write",
    )
    .await;
}

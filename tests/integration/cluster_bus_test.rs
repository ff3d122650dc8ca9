// tests/integration/cluster_bus_test.rs

//! Two in-process cluster nodes meeting each other over a real TCP bus:
//! MEET handshake, identity exchange, and gossip bookkeeping.

use quartzkv::config::Config;
use quartzkv::core::cluster::admin;
use quartzkv::core::cluster::gossip;
use quartzkv::core::engine::{MemoryEngine, MemorySnapshots, NullPubSub};
use quartzkv::core::state::ServerState;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const BUS_TIMEOUT: Duration = Duration::from_secs(10);

fn cluster_node(port: u16, tmp: &TempDir, name: &str) -> Arc<ServerState> {
    let mut config = Config::default();
    config.port = port;
    config.cluster.enabled = true;
    config.cluster.config_file = tmp
        .path()
        .join(format!("{name}.conf"))
        .to_string_lossy()
        .to_string();
    let state = ServerState::initialize(
        config,
        Arc::new(MemoryEngine::new()),
        Arc::new(NullPubSub),
        MemorySnapshots::with_payload(bytes::Bytes::new()),
    )
    .expect("state init");
    tokio::spawn(gossip::run(state.clone(), state.shutdown_tx.subscribe()));
    state
}

async fn wait_until<F: FnMut() -> bool>(mut probe: F, what: &str) {
    tokio::time::timeout(BUS_TIMEOUT, async {
        loop {
            if probe() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn meet_handshake_exchanges_identities() {
    let tmp = TempDir::new().unwrap();
    // Fixed ports keep the bus ports (port + 10000) predictable; the pair is
    // unusual enough not to collide with anything else on a test host.
    let node_a = cluster_node(36011, &tmp, "node-a");
    let node_b = cluster_node(36013, &tmp, "node-b");

    let cluster_a = node_a.cluster.clone().unwrap();
    let cluster_b = node_b.cluster.clone().unwrap();
    let a_id = cluster_a.my_id.clone();
    let b_id = cluster_b.my_id.clone();

    admin::meet(&node_a, "127.0.0.1", 36013, None).await.unwrap();

    // Both sides must end up knowing the other under its real id.
    let (ca, cb) = (cluster_a.clone(), cluster_b.clone());
    let (aid, bid) = (a_id.clone(), b_id.clone());
    wait_until(
        move || ca.registry.contains(&bid) && cb.registry.contains(&aid),
        "mutual identity exchange",
    )
    .await;

    // The provisional handshake node is gone; exactly two nodes per side.
    wait_until(
        {
            let ca = cluster_a.clone();
            move || ca.registry.len() == 2
        },
        "handshake node cleanup",
    )
    .await;

    // Gossip keeps the peers fresh: pong timestamps move.
    let ca = cluster_a.clone();
    let bid = b_id.clone();
    wait_until(
        move || {
            ca.registry
                .get(&bid)
                .map(|rt| rt.pong_received > 0)
                .unwrap_or(false)
        },
        "pong bookkeeping",
    )
    .await;
}

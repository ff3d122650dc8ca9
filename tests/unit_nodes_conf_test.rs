// tests/unit_nodes_conf_test.rs

//! Round-trip tests for the persisted cluster configuration file.

mod common;

use common::{add_primary, add_replica, node_id};
use quartzkv::config::Config;
use quartzkv::core::cluster::persistence;
use quartzkv::core::cluster::state::ClusterState;
use std::sync::atomic::Ordering;
use tempfile::TempDir;

fn state_with_config_file(tmp: &TempDir) -> (ClusterState, Config) {
    let mut config = Config::default();
    config.cluster.enabled = true;
    config.cluster.config_file = tmp
        .path()
        .join("nodes.conf")
        .to_string_lossy()
        .to_string();
    let state = ClusterState::new(&config).expect("fresh state");
    (state, config)
}

#[test]
fn serialize_then_parse_restores_the_registry() {
    let tmp = TempDir::new().unwrap();
    let (state, config) = state_with_config_file(&tmp);

    // Myself holds two ranges plus a lone slot.
    let my_id = state.my_id.clone();
    for slot in (0u16..100).chain(200..=205).chain([4000]) {
        state.add_slot(&my_id, slot).unwrap();
    }
    // A peer primary with an epoch, a hostname, and a replica.
    add_primary(&state, &node_id('b'), 7, &[5000, 5001, 5002]);
    state
        .registry
        .get_mut(&node_id('b'))
        .unwrap()
        .info
        .hostname = "peer-b.example".into();
    add_replica(&state, &node_id('c'), &node_id('b'), 0);

    // Migration markers on our own line.
    state.migrating_to.insert(4000, node_id('b'));
    state.importing_from.insert(9999, node_id('b'));

    state.current_epoch.store(42, Ordering::Release);
    state.last_vote_epoch.store(41, Ordering::Release);

    persistence::save_config(&state, true).unwrap();
    let reloaded = persistence::load_from_file(&config.cluster.config_file, &config).unwrap();

    assert_eq!(reloaded.my_id, my_id);
    assert_eq!(reloaded.current_epoch.load(Ordering::Acquire), 42);
    assert_eq!(reloaded.last_vote_epoch.load(Ordering::Acquire), 41);
    assert_eq!(reloaded.registry.len(), 3);

    let myself = reloaded.myself_info();
    assert_eq!(myself.num_slots, 107);
    assert!(myself.slots.test(0));
    assert!(myself.slots.test(99));
    assert!(myself.slots.test(203));
    assert!(myself.slots.test(4000));
    assert!(!myself.slots.test(100));

    let peer = reloaded.registry.get(&node_id('b')).unwrap().info.clone();
    assert!(peer.is_primary());
    assert_eq!(peer.config_epoch, 7);
    assert_eq!(peer.hostname, "peer-b.example");
    assert_eq!(peer.num_slots, 3);
    assert_eq!(peer.replicas, vec![node_id('c')]);
    assert_eq!(reloaded.slot_owner(5001).as_deref(), Some(node_id('b').as_str()));

    let replica = reloaded.registry.get(&node_id('c')).unwrap().info.clone();
    assert!(replica.is_replica());
    assert_eq!(replica.replica_of.as_deref(), Some(node_id('b').as_str()));
    assert_eq!(replica.shard_id, peer.shard_id);

    assert_eq!(
        reloaded.migrating_to.get(&4000).map(|v| v.value().clone()),
        Some(node_id('b'))
    );
    assert_eq!(
        reloaded.importing_from.get(&9999).map(|v| v.value().clone()),
        Some(node_id('b'))
    );
}

#[test]
fn slot_ranges_and_markers_render_in_the_line_format() {
    let tmp = TempDir::new().unwrap();
    let (state, _config) = state_with_config_file(&tmp);
    let my_id = state.my_id.clone();
    for slot in [10u16, 11, 12, 99] {
        state.add_slot(&my_id, slot).unwrap();
    }
    state.migrating_to.insert(12, node_id('b'));

    let rendered = persistence::serialize(&state);
    let my_line = rendered
        .lines()
        .find(|l| l.starts_with(&my_id))
        .expect("myself line");
    assert!(my_line.contains("myself,master"));
    assert!(my_line.contains(" 10-12"));
    assert!(my_line.contains(" 99"));
    assert!(my_line.contains(&format!("[12->-{}]", node_id('b'))));
    assert!(rendered.ends_with(&format!(
        "vars current_epoch {} last_vote_epoch {}\n",
        0, 0
    )));
}

#[test]
fn corrupt_config_is_a_fatal_parse_error() {
    let tmp = TempDir::new().unwrap();
    let (_, config) = state_with_config_file(&tmp);
    std::fs::write(&config.cluster.config_file, "not a node line\n").unwrap();
    assert!(persistence::load_from_file(&config.cluster.config_file, &config).is_err());
}

#[test]
fn second_instance_cannot_take_the_config_lock() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("nodes.conf");
    let path = path.to_string_lossy().to_string();
    let _held = persistence::lock_config_file(&path).unwrap();
    assert!(persistence::lock_config_file(&path).is_err());
}

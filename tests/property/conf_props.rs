// tests/property/conf_props.rs

//! Serialize-then-parse law for the persisted cluster configuration: the
//! node registry after a parse equals the registry before the serialize,
//! modulo explicitly transient state (links, ping/pong timers).

use proptest::prelude::*;
use quartzkv::config::Config;
use quartzkv::core::cluster::node::{ClusterNode, NodeFlags, NodeRuntime};
use quartzkv::core::cluster::persistence;
use quartzkv::core::cluster::state::ClusterState;
use std::sync::atomic::Ordering;
use tempfile::TempDir;

#[derive(Debug, Clone)]
struct PeerSpec {
    id: String,
    epoch: u64,
    slots: Vec<u16>,
    hostname: String,
}

fn hex_id() -> impl Strategy<Value = String> {
    prop::collection::vec(prop::sample::select(&b"0123456789abcdef"[..]), 40)
        .prop_map(|v| String::from_utf8(v).unwrap())
}

fn peer_spec() -> impl Strategy<Value = PeerSpec> {
    (
        hex_id(),
        0u64..1000,
        prop::collection::btree_set(0u16..16384, 0..50),
        "[a-z0-9-]{0,16}",
    )
        .prop_map(|(id, epoch, slots, hostname)| PeerSpec {
            id,
            epoch,
            slots: slots.into_iter().collect(),
            hostname,
        })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 24,
        ..ProptestConfig::default()
    })]

    #[test]
    fn registry_survives_a_config_roundtrip(
        peers in prop::collection::vec(peer_spec(), 0..6),
        current_epoch in 0u64..5000,
    ) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.cluster.enabled = true;
        config.cluster.config_file = tmp.path().join("nodes.conf").to_string_lossy().to_string();

        let state = ClusterState::new(&config).unwrap();
        let mut claimed = std::collections::HashSet::new();
        let mut inserted = Vec::new();
        for peer in &peers {
            if peer.id == state.my_id || inserted.iter().any(|p: &PeerSpec| p.id == peer.id) {
                continue;
            }
            let mut info = ClusterNode::new(peer.id.clone(), NodeFlags::PRIMARY);
            info.config_epoch = peer.epoch;
            info.ip = "10.0.0.9".into();
            info.port = 7450;
            info.bus_port = 17450;
            info.hostname = peer.hostname.clone();
            state.registry.insert(NodeRuntime::new(info));
            for &slot in &peer.slots {
                // One owner per slot; earlier peers win contested slots.
                if claimed.insert(slot) {
                    state.rebind_slot(slot, &peer.id);
                }
            }
            inserted.push(peer.clone());
        }
        state.current_epoch.store(current_epoch, Ordering::Release);

        persistence::save_config(&state, false).unwrap();
        let reloaded = persistence::load_from_file(&config.cluster.config_file, &config).unwrap();

        prop_assert_eq!(reloaded.my_id.clone(), state.my_id.clone());
        prop_assert_eq!(
            reloaded.current_epoch.load(Ordering::Acquire),
            current_epoch
        );
        prop_assert_eq!(reloaded.registry.len(), state.registry.len());

        for peer in &inserted {
            let original = state.registry.get(&peer.id).unwrap().info.clone();
            let restored = reloaded.registry.get(&peer.id).unwrap().info.clone();
            prop_assert_eq!(restored.config_epoch, original.config_epoch);
            prop_assert_eq!(restored.hostname.clone(), original.hostname);
            prop_assert_eq!(restored.num_slots, original.num_slots);
            prop_assert_eq!(restored.slots.as_bytes(), original.slots.as_bytes());
            prop_assert_eq!(restored.shard_id.clone(), original.shard_id);
            prop_assert!(restored.is_primary());
        }

        // Slot table agreement for every claimed slot.
        for slot in 0u16..16384 {
            prop_assert_eq!(state.slot_owner(slot), reloaded.slot_owner(slot));
        }
    }
}

// tests/unit_admin_test.rs

//! Tests for the CLUSTER administrative entry points as state-machine
//! inputs: slot assignment, migration markers, forget/blacklist, and reset.

mod common;

use common::{add_primary, cluster_context, node_id};
use quartzkv::core::cluster::admin::{self, SetSlotOp};
use quartzkv::core::engine::KeyspaceEngine;
use std::sync::atomic::Ordering;

#[tokio::test]
async fn addslots_is_all_or_nothing() {
    let ctx = cluster_context();
    let cluster = ctx.state.cluster.clone().unwrap();

    admin::addslots(&ctx.state, &[1, 2, 3]).await.unwrap();
    assert_eq!(cluster.myself_info().num_slots, 3);

    // One busy slot rejects the whole batch.
    let err = admin::addslots(&ctx.state, &[4, 2]).await.unwrap_err();
    assert!(err.to_string().contains("busy"));
    assert_eq!(cluster.myself_info().num_slots, 3);

    admin::delslots(&ctx.state, &[1, 2, 3]).await.unwrap();
    assert_eq!(cluster.myself_info().num_slots, 0);
    assert!(admin::delslots(&ctx.state, &[1]).await.is_err());
}

#[tokio::test]
async fn setslot_migrating_requires_ownership() {
    let ctx = cluster_context();
    let cluster = ctx.state.cluster.clone().unwrap();
    add_primary(&cluster, &node_id('b'), 1, &[]);

    assert!(
        admin::setslot(&ctx.state, 42, SetSlotOp::Migrating(node_id('b')))
            .await
            .is_err(),
        "cannot migrate a slot we do not own"
    );

    admin::addslots(&ctx.state, &[42]).await.unwrap();
    admin::setslot(&ctx.state, 42, SetSlotOp::Migrating(node_id('b')))
        .await
        .unwrap();
    assert_eq!(
        cluster.migrating_to.get(&42).map(|v| v.value().clone()),
        Some(node_id('b'))
    );

    admin::setslot(&ctx.state, 42, SetSlotOp::Stable).await.unwrap();
    assert!(cluster.migrating_to.get(&42).is_none());
}

#[tokio::test]
async fn setslot_node_finalizing_an_import_bumps_the_epoch() {
    // The importing side of a slot migration: after the keys moved, the
    // importer assigns the slot to itself and must advertise it under a
    // fresh epoch.
    let ctx = cluster_context();
    let cluster = ctx.state.cluster.clone().unwrap();
    add_primary(&cluster, &node_id('a'), 3, &[42]);
    admin::setslot(&ctx.state, 42, SetSlotOp::Importing(node_id('a')))
        .await
        .unwrap();

    let epoch_before = cluster.current_epoch.load(Ordering::Acquire);
    let my_id = cluster.my_id.clone();
    admin::setslot(&ctx.state, 42, SetSlotOp::Node(my_id.clone()))
        .await
        .unwrap();

    assert_eq!(cluster.slot_owner(42).as_deref(), Some(my_id.as_str()));
    assert!(cluster.importing_from.get(&42).is_none());
    assert!(cluster.current_epoch.load(Ordering::Acquire) > epoch_before);
    assert_eq!(
        cluster.myself_info().config_epoch,
        cluster.current_epoch.load(Ordering::Acquire)
    );
}

#[tokio::test]
async fn setslot_node_away_refuses_while_keys_remain() {
    let ctx = cluster_context();
    let cluster = ctx.state.cluster.clone().unwrap();
    add_primary(&cluster, &node_id('b'), 1, &[]);
    admin::addslots(&ctx.state, &[7]).await.unwrap();

    ctx.engine.insert_key(7, bytes::Bytes::from_static(b"key-in-slot-7"));
    assert!(
        admin::setslot(&ctx.state, 7, SetSlotOp::Node(node_id('b')))
            .await
            .is_err()
    );

    ctx.engine.delete_keys_in_slot(7).await;
    admin::setslot(&ctx.state, 7, SetSlotOp::Node(node_id('b')))
        .await
        .unwrap();
    assert_eq!(cluster.slot_owner(7).as_deref(), Some(node_id('b').as_str()));
}

#[tokio::test]
async fn forget_blacklists_the_node() {
    let ctx = cluster_context();
    let cluster = ctx.state.cluster.clone().unwrap();
    add_primary(&cluster, &node_id('b'), 1, &[]);

    admin::forget(&ctx.state, &node_id('b')).await.unwrap();
    assert!(!cluster.registry.contains(&node_id('b')));
    assert!(cluster.registry.blacklist_contains(&node_id('b')));

    // Forgetting the unknown or ourselves is refused.
    assert!(admin::forget(&ctx.state, &node_id('b')).await.is_err());
    let my_id = cluster.my_id.clone();
    assert!(admin::forget(&ctx.state, &my_id).await.is_err());
}

#[tokio::test]
async fn soft_reset_drops_peers_and_slots() {
    let ctx = cluster_context();
    let cluster = ctx.state.cluster.clone().unwrap();
    add_primary(&cluster, &node_id('b'), 4, &[100]);
    admin::addslots(&ctx.state, &[1, 2]).await.unwrap();
    cluster.current_epoch.store(9, Ordering::Release);

    admin::reset(&ctx.state, false).await.unwrap();
    assert_eq!(cluster.registry.len(), 1);
    assert_eq!(cluster.myself_info().num_slots, 0);
    assert!(cluster.slot_owner(100).is_none());
    // A soft reset keeps the epochs.
    assert_eq!(cluster.current_epoch.load(Ordering::Acquire), 9);
}

#[tokio::test]
async fn hard_reset_zeroes_epochs() {
    let ctx = cluster_context();
    let cluster = ctx.state.cluster.clone().unwrap();
    cluster.current_epoch.store(9, Ordering::Release);
    cluster
        .registry
        .get_mut(&cluster.my_id.clone())
        .unwrap()
        .info
        .config_epoch = 9;
    let shard_before = cluster.myself_info().shard_id;

    admin::reset(&ctx.state, true).await.unwrap();
    assert_eq!(cluster.current_epoch.load(Ordering::Acquire), 0);
    assert_eq!(cluster.myself_info().config_epoch, 0);
    assert_ne!(cluster.myself_info().shard_id, shard_before);
}

#[tokio::test]
async fn bumpepoch_and_failure_report_queries() {
    let ctx = cluster_context();
    let cluster = ctx.state.cluster.clone().unwrap();
    add_primary(&cluster, &node_id('b'), 1, &[]);

    let bumped = admin::bumpepoch(&ctx.state).await.unwrap();
    assert_eq!(bumped, 1);
    assert_eq!(cluster.myself_info().config_epoch, 1);

    assert_eq!(
        admin::count_failure_reports(&ctx.state, &node_id('b'))
            .await
            .unwrap(),
        0
    );
    cluster
        .registry
        .get_mut(&node_id('b'))
        .unwrap()
        .add_fail_report(&node_id('c'));
    assert_eq!(
        admin::count_failure_reports(&ctx.state, &node_id('b'))
            .await
            .unwrap(),
        1
    );
    assert!(admin::check_node_id(&node_id('b')).is_ok());
    assert!(admin::check_node_id("zz").is_err());
}

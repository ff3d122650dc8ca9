// tests/unit_epoch_test.rs

//! Tests for the epoch and slot-configuration engine: collision resolution,
//! slot rebinding on newer claims, release flags, and import finalization.

mod common;

use common::{add_primary, cluster_context, node_id};
use quartzkv::core::cluster::epoch;
use quartzkv::core::cluster::message::{MsgFlags, MsgHeader, MsgType};
use quartzkv::core::cluster::node::NodeFlags;
use quartzkv::core::cluster::slot::SlotBitmap;
use std::sync::atomic::Ordering;

fn header_from(sender: &str, config_epoch: u64, slots: SlotBitmap) -> MsgHeader {
    MsgHeader {
        mtype: MsgType::Ping,
        port: 7450,
        pport: 0,
        cport: 17450,
        current_epoch: config_epoch,
        config_epoch,
        offset: 0,
        sender: sender.to_string(),
        myslots: slots,
        replicaof: None,
        myip: "10.1.1.2".into(),
        sender_flags: NodeFlags::PRIMARY,
        state_ok: true,
        mflags: MsgFlags::empty(),
    }
}

#[tokio::test]
async fn collision_bumps_only_the_larger_id() {
    // Our own id is random hex, so the all-'0' id is always smaller and the
    // all-'z'... hex caps at 'f', so repeat 'f' is always >= ours; ties are
    // impossible against a 40-char random id in practice.
    let ctx = cluster_context();
    let cluster = ctx.state.cluster.clone().unwrap();
    let my_id = cluster.my_id.clone();
    cluster.add_slot(&my_id, 1).unwrap();
    cluster.registry.get_mut(&my_id).unwrap().info.config_epoch = 5;
    cluster.current_epoch.store(5, Ordering::Release);

    // Sender with the smaller id and the same epoch: we are the larger side
    // and must move to a fresh epoch.
    add_primary(&cluster, &node_id('0'), 5, &[2]);
    let header = header_from(&node_id('0'), 5, SlotBitmap::new());
    epoch::handle_epoch_collision(&ctx.state, &cluster, &header).await;
    assert_eq!(cluster.myself_info().config_epoch, 6);
    assert_eq!(cluster.current_epoch.load(Ordering::Acquire), 6);

    // Sender with the larger id and our (new) epoch: we are the stable side.
    add_primary(&cluster, &node_id('f'), 6, &[3]);
    let header = header_from(&node_id('f'), 6, SlotBitmap::new());
    epoch::handle_epoch_collision(&ctx.state, &cluster, &header).await;
    assert_eq!(cluster.myself_info().config_epoch, 6);
}

#[tokio::test]
async fn newer_epoch_claim_rebinds_slots() {
    let ctx = cluster_context();
    let cluster = ctx.state.cluster.clone().unwrap();
    add_primary(&cluster, &node_id('a'), 3, &[42]);
    add_primary(&cluster, &node_id('b'), 0, &[]);

    let mut claim = SlotBitmap::new();
    claim.set(42);

    // A stale claim does not move the slot.
    epoch::update_slots_from_claim(&ctx.state, &cluster, &node_id('b'), 2, &claim).await;
    assert_eq!(cluster.slot_owner(42).as_deref(), Some(node_id('a').as_str()));

    // A strictly newer claim does.
    epoch::update_slots_from_claim(&ctx.state, &cluster, &node_id('b'), 4, &claim).await;
    assert_eq!(cluster.slot_owner(42).as_deref(), Some(node_id('b').as_str()));
    assert!(cluster.registry.get(&node_id('b')).unwrap().info.slots.test(42));
    assert!(!cluster.registry.get(&node_id('a')).unwrap().info.slots.test(42));
}

#[tokio::test]
async fn dropped_claim_sets_release_flag_instead_of_unbinding() {
    let ctx = cluster_context();
    let cluster = ctx.state.cluster.clone().unwrap();
    add_primary(&cluster, &node_id('a'), 3, &[7, 8]);

    // The owner keeps claiming slot 7 but stops claiming slot 8.
    let mut claim = SlotBitmap::new();
    claim.set(7);
    epoch::update_slots_from_claim(&ctx.state, &cluster, &node_id('a'), 3, &claim).await;

    assert_eq!(cluster.slot_owner(8).as_deref(), Some(node_id('a').as_str()));
    assert!(cluster.owner_not_claiming.lock().test(8));

    // A later claim by someone else wins slot 8 even at the same epoch,
    // because the owner released it.
    add_primary(&cluster, &node_id('b'), 3, &[]);
    let mut other = SlotBitmap::new();
    other.set(8);
    epoch::update_slots_from_claim(&ctx.state, &cluster, &node_id('b'), 3, &other).await;
    assert_eq!(cluster.slot_owner(8).as_deref(), Some(node_id('b').as_str()));
    assert!(!cluster.owner_not_claiming.lock().test(8));
}

#[tokio::test]
async fn migration_completes_when_target_claims_the_slot() {
    // Slot 42 migrating from myself to B; B takes ownership with a newer
    // epoch; the migrating marker must clear.
    let ctx = cluster_context();
    let cluster = ctx.state.cluster.clone().unwrap();
    let my_id = cluster.my_id.clone();
    cluster.add_slot(&my_id, 42).unwrap();
    add_primary(&cluster, &node_id('b'), 9, &[]);
    cluster.migrating_to.insert(42, node_id('b'));

    let mut claim = SlotBitmap::new();
    claim.set(42);
    epoch::update_slots_from_claim(&ctx.state, &cluster, &node_id('b'), 9, &claim).await;

    assert_eq!(cluster.slot_owner(42).as_deref(), Some(node_id('b').as_str()));
    assert!(cluster.migrating_to.get(&42).is_none());
}

#[tokio::test]
async fn source_releasing_an_importing_slot_finalizes_the_import() {
    let ctx = cluster_context();
    let cluster = ctx.state.cluster.clone().unwrap();
    let my_id = cluster.my_id.clone();
    add_primary(&cluster, &node_id('a'), 3, &[42, 43]);
    cluster.importing_from.insert(42, node_id('a'));

    // A's claim drops slot 42 while keeping 43: our import is complete and
    // we take the slot with a freshly bumped epoch.
    let mut claim = SlotBitmap::new();
    claim.set(43);
    let epoch_before = cluster.current_epoch.load(Ordering::Acquire);
    epoch::update_slots_from_claim(&ctx.state, &cluster, &node_id('a'), 3, &claim).await;

    assert_eq!(cluster.slot_owner(42).as_deref(), Some(my_id.as_str()));
    assert!(cluster.importing_from.get(&42).is_none());
    assert!(cluster.current_epoch.load(Ordering::Acquire) > epoch_before);
    assert_eq!(
        cluster.myself_info().config_epoch,
        cluster.current_epoch.load(Ordering::Acquire)
    );
}

#[tokio::test]
async fn bump_without_consensus_raises_both_epochs() {
    let ctx = cluster_context();
    let cluster = ctx.state.cluster.clone().unwrap();
    cluster.current_epoch.store(10, Ordering::Release);
    let new_epoch = epoch::bump_epoch_without_consensus(&cluster);
    assert_eq!(new_epoch, 11);
    assert_eq!(cluster.myself_info().config_epoch, 11);
    assert_eq!(cluster.current_epoch.load(Ordering::Acquire), 11);
}

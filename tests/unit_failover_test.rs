// tests/unit_failover_test.rs

//! Tests for the failover coordinator: rank computation, the voting rules,
//! promotion after a won election, and the manual failover handshake.

mod common;

use common::{add_primary, add_replica, cluster_context, node_id};
use quartzkv::config::ReplicationConfig;
use quartzkv::core::cluster::failover;
use quartzkv::core::cluster::message::{MsgFlags, MsgHeader, MsgType};
use quartzkv::core::cluster::node::NodeFlags;
use quartzkv::core::cluster::slot::SlotBitmap;
use quartzkv::core::state::PrimaryLinkInfo;
use std::sync::atomic::Ordering;

fn auth_request(sender: &str, current_epoch: u64, config_epoch: u64, slots: SlotBitmap) -> MsgHeader {
    MsgHeader {
        mtype: MsgType::FailoverAuthRequest,
        port: 7450,
        pport: 0,
        cport: 17450,
        current_epoch,
        config_epoch,
        offset: 0,
        sender: sender.to_string(),
        myslots: slots,
        replicaof: None,
        myip: "10.1.1.3".into(),
        sender_flags: NodeFlags::REPLICA,
        state_ok: true,
        mflags: MsgFlags::empty(),
    }
}

fn mark_failed(cluster: &quartzkv::core::cluster::state::ClusterState, id: &str) {
    let mut rt = cluster.registry.get_mut(id).unwrap();
    rt.info.flags.insert(NodeFlags::FAIL);
}

#[test]
fn rank_counts_siblings_with_more_data() {
    let ctx = cluster_context();
    let cluster = ctx.state.cluster.clone().unwrap();
    let my_id = cluster.my_id.clone();

    add_primary(&cluster, &node_id('a'), 1, &[1]);
    cluster.set_myself_replica_of(&node_id('a'));
    add_replica(&cluster, &node_id('b'), &node_id('a'), 2000);
    add_replica(&cluster, &node_id('c'), &node_id('a'), 500);

    // One sibling (b) is ahead of our offset of 1000; c is behind.
    assert_eq!(failover::failover_rank(&cluster, &node_id('a'), 1000), 1);
    // At 2000 the tie against b is broken by id order.
    let expected = usize::from(node_id('b').as_str() < my_id.as_str());
    assert_eq!(failover::failover_rank(&cluster, &node_id('a'), 2000), expected);
    // With the most data we rank first.
    assert_eq!(failover::failover_rank(&cluster, &node_id('a'), 3000), 0);
}

#[tokio::test]
async fn a_voter_never_votes_twice_in_one_epoch() {
    let ctx = cluster_context();
    let cluster = ctx.state.cluster.clone().unwrap();
    let my_id = cluster.my_id.clone();

    // Myself is a voting primary; candidate is a replica of a failed peer.
    cluster.add_slot(&my_id, 1).unwrap();
    add_primary(&cluster, &node_id('d'), 2, &[2, 3]);
    add_replica(&cluster, &node_id('e'), &node_id('d'), 100);
    mark_failed(&cluster, &node_id('d'));
    cluster.recompute_size();
    cluster.current_epoch.store(7, Ordering::Release);

    let mut claimed = SlotBitmap::new();
    claimed.set(2);
    claimed.set(3);

    failover::handle_auth_request(&ctx.state, &cluster, &auth_request(&node_id('e'), 7, 2, claimed.clone()))
        .await;
    assert_eq!(cluster.last_vote_epoch.load(Ordering::Acquire), 7);
    let voted_at = cluster.registry.get(&node_id('d')).unwrap().voted_time;
    assert!(voted_at > 0);

    // The same epoch cannot collect a second vote, even for a different
    // candidate.
    add_replica(&cluster, &node_id('f'), &node_id('d'), 100);
    failover::handle_auth_request(&ctx.state, &cluster, &auth_request(&node_id('f'), 7, 2, claimed))
        .await;
    assert_eq!(cluster.registry.get(&node_id('d')).unwrap().voted_time, voted_at);
}

#[tokio::test]
async fn votes_are_refused_for_stale_epochs_and_stale_slot_claims() {
    let ctx = cluster_context();
    let cluster = ctx.state.cluster.clone().unwrap();
    let my_id = cluster.my_id.clone();

    cluster.add_slot(&my_id, 1).unwrap();
    add_primary(&cluster, &node_id('d'), 5, &[2]);
    add_replica(&cluster, &node_id('e'), &node_id('d'), 100);
    mark_failed(&cluster, &node_id('d'));
    cluster.recompute_size();
    cluster.current_epoch.store(9, Ordering::Release);

    let mut claimed = SlotBitmap::new();
    claimed.set(2);

    // Request epoch older than ours: refused.
    failover::handle_auth_request(&ctx.state, &cluster, &auth_request(&node_id('e'), 8, 5, claimed.clone()))
        .await;
    assert_eq!(cluster.last_vote_epoch.load(Ordering::Acquire), 0);

    // Claimed slot owned under a newer epoch than the request carries:
    // refused.
    add_primary(&cluster, &node_id('g'), 6, &[4]);
    let mut stale = SlotBitmap::new();
    stale.set(4);
    failover::handle_auth_request(&ctx.state, &cluster, &auth_request(&node_id('e'), 9, 5, stale))
        .await;
    assert_eq!(cluster.last_vote_epoch.load(Ordering::Acquire), 0);

    // A clean request collects the vote.
    failover::handle_auth_request(&ctx.state, &cluster, &auth_request(&node_id('e'), 9, 5, claimed))
        .await;
    assert_eq!(cluster.last_vote_epoch.load(Ordering::Acquire), 9);
}

#[tokio::test]
async fn quorum_of_acks_promotes_the_replica() {
    let ctx = cluster_context();
    let cluster = ctx.state.cluster.clone().unwrap();

    // Shard layout: we replicate d (failed, owns slots 2-3); b and c are the
    // other voting primaries.
    add_primary(&cluster, &node_id('b'), 1, &[10]);
    add_primary(&cluster, &node_id('c'), 1, &[11]);
    add_primary(&cluster, &node_id('d'), 2, &[2, 3]);
    cluster.set_myself_replica_of(&node_id('d'));
    mark_failed(&cluster, &node_id('d'));
    cluster.recompute_size();
    {
        let mut config = ctx.state.config.lock().await;
        config.replication = ReplicationConfig::Replica {
            primary_host: "10.1.1.9".into(),
            primary_port: 7450,
            tls_enabled: false,
        };
    }
    *ctx.state.replication.primary_link.lock().await = Some(PrimaryLinkInfo {
        replid: "x".repeat(40),
        processed_offset: 1000,
        fsynced_offset: 1000,
    });

    // An election in flight at epoch 7.
    cluster.current_epoch.store(7, Ordering::Release);
    {
        let mut election = cluster.election.lock();
        election.auth_time = 1;
        election.auth_sent = true;
        election.auth_epoch = 7;
        election.auth_count = 0;
    }

    let old_replid = ctx.state.replication.replid();

    let ack = |sender: &str| MsgHeader {
        mtype: MsgType::FailoverAuthAck,
        port: 7450,
        pport: 0,
        cport: 17450,
        current_epoch: 7,
        config_epoch: 1,
        offset: 0,
        sender: sender.to_string(),
        myslots: SlotBitmap::new(),
        replicaof: None,
        myip: "10.1.1.4".into(),
        sender_flags: NodeFlags::PRIMARY,
        state_ok: true,
        mflags: MsgFlags::empty(),
    };

    // size = 3 voting primaries -> quorum = 2.
    failover::handle_auth_ack(&ctx.state, &cluster, &ack(&node_id('b'))).await;
    assert!(cluster.myself_info().is_replica(), "one vote is not enough");
    failover::handle_auth_ack(&ctx.state, &cluster, &ack(&node_id('c'))).await;

    let myself = cluster.myself_info();
    assert!(myself.is_primary(), "promoted after reaching quorum");
    assert_eq!(myself.config_epoch, 7);
    // Every slot of the failed primary now belongs to us.
    assert_eq!(cluster.slot_owner(2).as_deref(), Some(cluster.my_id.as_str()));
    assert_eq!(cluster.slot_owner(3).as_deref(), Some(cluster.my_id.as_str()));
    assert_eq!(cluster.registry.get(&node_id('d')).unwrap().info.num_slots, 0);
    // The replication id rotated, honoring the old history for partials.
    assert_ne!(ctx.state.replication.replid(), old_replid);
    assert_eq!(ctx.state.replication.replid2(), old_replid);
    // The server role flipped to primary.
    assert!(ctx.state.config.lock().await.is_primary());
}

#[tokio::test]
async fn mfstart_pauses_writes_for_a_known_replica() {
    let ctx = cluster_context();
    let cluster = ctx.state.cluster.clone().unwrap();
    let my_id = cluster.my_id.clone();
    cluster.add_slot(&my_id, 1).unwrap();
    add_replica(&cluster, &node_id('r'), &my_id, 0);

    // A stranger cannot trigger the pause.
    failover::handle_mfstart(&ctx.state, &cluster, &node_id('z')).await;
    assert!(!ctx.state.writes_paused());

    failover::handle_mfstart(&ctx.state, &cluster, &node_id('r')).await;
    assert!(ctx.state.writes_paused());
    let mf = cluster.manual_failover.lock();
    assert!(mf.in_progress());
    assert_eq!(mf.replica.as_deref(), Some(node_id('r').as_str()));
}

#[tokio::test]
async fn paused_primary_offset_arms_the_manual_failover() {
    let ctx = cluster_context();
    let cluster = ctx.state.cluster.clone().unwrap();
    add_primary(&cluster, &node_id('p'), 1, &[1]);
    cluster.set_myself_replica_of(&node_id('p'));
    {
        let mut mf = cluster.manual_failover.lock();
        mf.end_time = quartzkv::core::now_ms() + 5000;
    }

    let mut header = auth_request(&node_id('p'), 1, 1, SlotBitmap::new());
    header.mtype = MsgType::Ping;
    header.offset = 1000;
    header.mflags = MsgFlags::PAUSED;
    failover::observe_pause_flag(&ctx.state, &cluster, &header).await;

    let mf = cluster.manual_failover.lock();
    assert_eq!(mf.primary_offset, Some(1000));
}

// tests/property/codec_props.rs

//! Encode-then-decode laws for the cluster bus codec: every message type,
//! arbitrary gossip sections, and arbitrary extension combinations must
//! survive a round trip bit-exactly.

use bytes::Bytes;
use proptest::prelude::*;
use quartzkv::core::cluster::message::{
    ClusterPacket, GossipEntry, MsgFlags, MsgHeader, MsgPayload, MsgType, PingExt,
};
use quartzkv::core::cluster::node::NodeFlags;
use quartzkv::core::cluster::slot::SlotBitmap;

fn hex_id() -> impl Strategy<Value = String> {
    prop::collection::vec(prop::sample::select(&b"0123456789abcdef"[..]), 40)
        .prop_map(|v| String::from_utf8(v).unwrap())
}

fn slot_bitmap() -> impl Strategy<Value = SlotBitmap> {
    prop::collection::vec(0u16..16384, 0..64).prop_map(|slots| {
        let mut map = SlotBitmap::new();
        for slot in slots {
            map.set(slot);
        }
        map
    })
}

fn gossip_entry() -> impl Strategy<Value = GossipEntry> {
    (hex_id(), any::<u32>(), any::<u32>(), any::<u16>(), any::<u16>(), any::<u16>()).prop_map(
        |(node_id, ping, pong, port, cport, pport)| GossipEntry {
            node_id,
            ping_sent_secs: ping,
            pong_received_secs: pong,
            ip: "192.168.200.77".into(),
            port,
            cport,
            flags: NodeFlags::PRIMARY | NodeFlags::PFAIL,
            pport,
        },
    )
}

fn ping_ext() -> impl Strategy<Value = PingExt> {
    prop_oneof![
        "[a-z0-9.-]{0,40}".prop_map(PingExt::Hostname),
        "[a-z0-9-]{0,32}".prop_map(PingExt::HumanNodename),
        (hex_id(), (1u64..86400).prop_map(|s| s * 1000))
            .prop_map(|(id, ttl_ms)| PingExt::ForgottenNode { id, ttl_ms }),
        hex_id().prop_map(PingExt::ShardId),
        any::<[u8; 4]>().prop_map(|o| PingExt::ClientIpv4(o.into())),
        any::<[u8; 16]>().prop_map(|o| PingExt::ClientIpv6(o.into())),
    ]
}

fn header(mtype: MsgType) -> impl Strategy<Value = MsgHeader> {
    (
        hex_id(),
        prop::option::of(hex_id()),
        slot_bitmap(),
        any::<u64>(),
        any::<u64>(),
        any::<u64>(),
        any::<u16>(),
        any::<bool>(),
    )
        .prop_map(
            move |(sender, replicaof, myslots, current_epoch, config_epoch, offset, port, ok)| {
                MsgHeader {
                    mtype,
                    port,
                    pport: port.wrapping_add(1),
                    cport: port.wrapping_add(10000),
                    current_epoch,
                    config_epoch,
                    offset,
                    sender,
                    myslots,
                    replicaof,
                    myip: "10.9.8.7".into(),
                    sender_flags: NodeFlags::PRIMARY | NodeFlags::EXTENSIONS_SUPPORTED,
                    state_ok: ok,
                    mflags: MsgFlags::empty(),
                }
            },
        )
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    #[test]
    fn gossip_frames_roundtrip(
        hdr in header(MsgType::Ping),
        entries in prop::collection::vec(gossip_entry(), 0..8),
        extensions in prop::collection::vec(ping_ext(), 0..6),
    ) {
        let packet = ClusterPacket::Full(hdr, MsgPayload::Gossip { entries: entries.clone(), extensions: extensions.clone() });
        let raw = packet.encode();
        prop_assert_eq!(raw.len() % 8, 0);
        let decoded = ClusterPacket::decode(&raw).unwrap();
        prop_assert_eq!(decoded.encode(), raw);
        let ClusterPacket::Full(_, MsgPayload::Gossip { entries: e2, extensions: x2 }) = decoded else {
            panic!("wrong payload shape");
        };
        prop_assert_eq!(e2, entries);
        prop_assert_eq!(x2, extensions);
    }

    #[test]
    fn publish_frames_roundtrip(
        hdr in header(MsgType::Publish),
        channel in prop::collection::vec(any::<u8>(), 0..128),
        message in prop::collection::vec(any::<u8>(), 0..512),
        light in any::<bool>(),
    ) {
        let payload = MsgPayload::Publish {
            channel: Bytes::from(channel),
            message: Bytes::from(message),
        };
        let packet = if light {
            ClusterPacket::Light { mtype: MsgType::Publish, payload }
        } else {
            ClusterPacket::Full(hdr, payload)
        };
        let raw = packet.encode();
        let decoded = ClusterPacket::decode(&raw).unwrap();
        prop_assert_eq!(decoded.encode(), raw);
    }

    #[test]
    fn update_and_fail_frames_roundtrip(
        hdr in header(MsgType::Update),
        target in hex_id(),
        epoch in any::<u64>(),
        slots in slot_bitmap(),
    ) {
        let update = ClusterPacket::Full(hdr.clone(), MsgPayload::Update {
            config_epoch: epoch,
            node_id: target.clone(),
            slots,
        });
        let raw = update.encode();
        prop_assert_eq!(ClusterPacket::decode(&raw).unwrap().encode(), raw);

        let mut fail_hdr = hdr;
        fail_hdr.mtype = MsgType::Fail;
        let fail = ClusterPacket::Full(fail_hdr, MsgPayload::Fail { node_id: target });
        let raw = fail.encode();
        prop_assert_eq!(ClusterPacket::decode(&raw).unwrap().encode(), raw);
    }

    #[test]
    fn truncated_frames_never_decode(
        hdr in header(MsgType::Ping),
        cut in 1usize..100,
    ) {
        let packet = ClusterPacket::Full(hdr, MsgPayload::Gossip { entries: vec![], extensions: vec![] });
        let raw = packet.encode();
        let cut = cut.min(raw.len() - 1);
        prop_assert!(ClusterPacket::decode(&raw[..raw.len() - cut]).is_err());
    }
}

// src/core/cluster/message.rs

//! The cluster bus wire codec: fixed-header messages with typed payloads and
//! 8-byte-aligned optional extensions.
//!
//! Field offsets of the fixed header are part of the deployed protocol;
//! nodes of different releases exchange these frames during rolling
//! upgrades, so the layout must never change. All multi-byte integers are
//! network byte order, except the module id which is carried in the sender's
//! native endianness.

use crate::core::QuartzError;
use crate::core::cluster::node::{NODE_ID_LEN, NodeFlags};
use crate::core::cluster::slot::{SLOT_BITMAP_LEN, SlotBitmap};
use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr};
use strum_macros::{Display, FromRepr};

/// Signature prefixing every bus frame.
pub const MSG_SIG: &[u8; 4] = b"RCmb";

/// Current bus protocol version.
pub const PROTO_VER: u16 = 1;

/// Length of an IP string field on the wire.
pub const NET_IP_LEN: usize = 46;

/// Fixed header length of a full message; payload starts here.
pub const MSG_HEADER_LEN: usize = 2256;

/// Fixed header length of a light message; payload starts here.
pub const MSG_LIGHT_HEADER_LEN: usize = 16;

/// One gossip section entry.
pub const GOSSIP_ENTRY_LEN: usize = 104;

/// Modifier bit marking a light-header frame in the `type` field.
pub const MSG_LIGHT_BIT: u16 = 0x8000;

// The header is field-by-field serialization, so drift between the declared
// length and the field widths is an encoder bug caught here at compile time.
const _: () = assert!(
    MSG_HEADER_LEN
        == 4 + 4 + 2 + 2 + 2 + 2 + 8 + 8 + 8 + NODE_ID_LEN + SLOT_BITMAP_LEN + NODE_ID_LEN
            + NET_IP_LEN
            + 2
            + 30
            + 2
            + 2
            + 2
            + 1
            + 3
);

/// Message types carried in the header `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u16)]
pub enum MsgType {
    Ping = 0,
    Pong = 1,
    Meet = 2,
    Fail = 3,
    Publish = 4,
    FailoverAuthRequest = 5,
    FailoverAuthAck = 6,
    Update = 7,
    MfStart = 8,
    Module = 9,
    PublishShard = 10,
}

/// Number of distinct message types, for per-type counters.
pub const MSG_TYPE_COUNT: usize = 11;

impl MsgType {
    /// Whether this type may travel under a light header, i.e. its semantics
    /// need no sender identity context.
    pub fn supports_light_header(&self) -> bool {
        matches!(self, MsgType::Publish | MsgType::PublishShard)
    }
}

bitflags! {
    /// Message flags from the first `mflags` byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgFlags: u8 {
        /// Primary paused for manual failover.
        const PAUSED   = 1 << 0;
        /// Grant the AUTH_REQUEST even if the primary is up.
        const FORCEACK = 1 << 1;
        /// Frame carries extension data after the gossip section.
        const EXT_DATA = 1 << 2;
    }
}

/// The full fixed header, minus signature/length/version which the codec
/// owns.
#[derive(Debug, Clone)]
pub struct MsgHeader {
    pub mtype: MsgType,
    /// Primary client port (TCP or TLS, whichever is primary).
    pub port: u16,
    /// Secondary client port (the other of TCP/TLS).
    pub pport: u16,
    /// Cluster bus port.
    pub cport: u16,
    pub current_epoch: u64,
    pub config_epoch: u64,
    pub offset: u64,
    pub sender: String,
    pub myslots: SlotBitmap,
    /// Zeroed on the wire when the sender is a primary.
    pub replicaof: Option<String>,
    pub myip: String,
    pub sender_flags: NodeFlags,
    pub state_ok: bool,
    pub mflags: MsgFlags,
}

/// One gossip section entry about a third node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipEntry {
    pub node_id: String,
    pub ping_sent_secs: u32,
    pub pong_received_secs: u32,
    pub ip: String,
    pub port: u16,
    pub cport: u16,
    pub flags: NodeFlags,
    pub pport: u16,
}

/// Optional 8-byte-aligned extensions appended to PING/PONG/MEET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingExt {
    Hostname(String),
    HumanNodename(String),
    ForgottenNode { id: String, ttl_ms: u64 },
    ShardId(String),
    ClientIpv4(Ipv4Addr),
    ClientIpv6(Ipv6Addr),
}

const EXT_TYPE_HOSTNAME: u16 = 0;
const EXT_TYPE_HUMAN_NODENAME: u16 = 1;
const EXT_TYPE_FORGOTTEN_NODE: u16 = 2;
const EXT_TYPE_SHARD_ID: u16 = 3;
const EXT_TYPE_CLIENT_IPV4: u16 = 4;
const EXT_TYPE_CLIENT_IPV6: u16 = 5;

/// Typed payloads, one per message family.
#[derive(Debug, Clone)]
pub enum MsgPayload {
    Gossip {
        entries: Vec<GossipEntry>,
        extensions: Vec<PingExt>,
    },
    Fail {
        node_id: String,
    },
    Publish {
        channel: Bytes,
        message: Bytes,
    },
    Update {
        config_epoch: u64,
        node_id: String,
        slots: SlotBitmap,
    },
    Empty,
    Module {
        module_id: u64,
        type_tag: u8,
        payload: Bytes,
    },
}

/// A decoded bus frame: either the full header or the light variant.
#[derive(Debug, Clone)]
pub enum ClusterPacket {
    Full(MsgHeader, MsgPayload),
    Light { mtype: MsgType, payload: MsgPayload },
}

impl ClusterPacket {
    pub fn mtype(&self) -> MsgType {
        match self {
            ClusterPacket::Full(header, _) => header.mtype,
            ClusterPacket::Light { mtype, .. } => *mtype,
        }
    }

    /// Serializes the packet into an exactly-sized buffer.
    pub fn encode(&self) -> Bytes {
        match self {
            ClusterPacket::Full(header, payload) => encode_full(header, payload),
            ClusterPacket::Light { mtype, payload } => encode_light(*mtype, payload),
        }
    }

    /// Parses a complete frame. `buf` must hold exactly the announced frame;
    /// any mismatch between the declared length and the type-expected length
    /// rejects the frame.
    pub fn decode(buf: &[u8]) -> Result<ClusterPacket, QuartzError> {
        if buf.len() < MSG_LIGHT_HEADER_LEN {
            return Err(QuartzError::Protocol("bus frame shorter than any header".into()));
        }
        if &buf[0..4] != MSG_SIG {
            return Err(QuartzError::Protocol("bad bus frame signature".into()));
        }
        let totlen = read_u32(buf, 4) as usize;
        if totlen != buf.len() {
            return Err(QuartzError::Protocol(format!(
                "bus frame length mismatch: declared {totlen}, got {}",
                buf.len()
            )));
        }
        let ver = read_u16(buf, 8);
        if ver != PROTO_VER {
            return Err(QuartzError::Protocol(format!(
                "unsupported bus protocol version {ver}"
            )));
        }
        let raw_type = read_u16(buf, 12);
        if raw_type & MSG_LIGHT_BIT != 0 {
            decode_light(buf, raw_type & !MSG_LIGHT_BIT)
        } else {
            decode_full(buf, raw_type)
        }
    }
}

// --- Fixed-width field helpers ---

fn put_fixed_str(dst: &mut BytesMut, value: &str, width: usize) {
    let raw = value.as_bytes();
    let take = raw.len().min(width);
    dst.put_slice(&raw[..take]);
    dst.put_bytes(0, width - take);
}

fn read_fixed_str(buf: &[u8], off: usize, width: usize) -> String {
    let raw = &buf[off..off + width];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
    String::from_utf8_lossy(&raw[..end]).to_string()
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[off..off + 8]);
    u64::from_be_bytes(raw)
}

fn eight_byte_align(len: usize) -> usize {
    len.div_ceil(8) * 8
}

// --- Payload sizing ---

fn payload_len(payload: &MsgPayload) -> usize {
    match payload {
        MsgPayload::Gossip { entries, extensions } => {
            entries.len() * GOSSIP_ENTRY_LEN
                + extensions.iter().map(|e| ext_wire_len(e)).sum::<usize>()
        }
        MsgPayload::Fail { .. } => NODE_ID_LEN,
        MsgPayload::Publish { channel, message } => 8 + channel.len() + message.len(),
        MsgPayload::Update { .. } => 8 + NODE_ID_LEN + SLOT_BITMAP_LEN,
        MsgPayload::Empty => 0,
        MsgPayload::Module { payload, .. } => 13 + payload.len(),
    }
}

fn ext_wire_len(ext: &PingExt) -> usize {
    // 8-byte extension header (u32 length, u16 type, u16 unused) + payload,
    // padded so the next extension stays 8-byte aligned.
    8 + match ext {
        PingExt::Hostname(h) => eight_byte_align(h.len() + 1),
        PingExt::HumanNodename(n) => eight_byte_align(n.len() + 1),
        PingExt::ForgottenNode { .. } => NODE_ID_LEN + 8,
        PingExt::ShardId(_) => NODE_ID_LEN,
        PingExt::ClientIpv4(ip) => eight_byte_align(ip.to_string().len() + 1),
        PingExt::ClientIpv6(ip) => eight_byte_align(ip.to_string().len() + 1),
    }
}

// --- Encoding ---

fn encode_full(header: &MsgHeader, payload: &MsgPayload) -> Bytes {
    let totlen = MSG_HEADER_LEN + payload_len(payload);
    let mut dst = BytesMut::with_capacity(totlen);

    dst.put_slice(MSG_SIG);
    dst.put_u32(totlen as u32);
    dst.put_u16(PROTO_VER);
    dst.put_u16(header.port);
    dst.put_u16(header.mtype as u16);
    let count = match payload {
        MsgPayload::Gossip { entries, .. } => entries.len() as u16,
        _ => 0,
    };
    dst.put_u16(count);
    dst.put_u64(header.current_epoch);
    dst.put_u64(header.config_epoch);
    dst.put_u64(header.offset);
    put_fixed_str(&mut dst, &header.sender, NODE_ID_LEN);
    dst.put_slice(header.myslots.as_bytes());
    put_fixed_str(
        &mut dst,
        header.replicaof.as_deref().unwrap_or(""),
        NODE_ID_LEN,
    );
    put_fixed_str(&mut dst, &header.myip, NET_IP_LEN);
    let (ext_count, mflags) = match payload {
        MsgPayload::Gossip { extensions, .. } if !extensions.is_empty() => (
            extensions.len() as u16,
            header.mflags | MsgFlags::EXT_DATA,
        ),
        _ => (0, header.mflags),
    };
    dst.put_u16(ext_count);
    dst.put_bytes(0, 30); // reserved
    dst.put_u16(header.pport);
    dst.put_u16(header.cport);
    dst.put_u16(header.sender_flags.bits());
    dst.put_u8(if header.state_ok { 0 } else { 1 });
    dst.put_u8(mflags.bits());
    dst.put_bytes(0, 2); // remaining mflags bytes
    debug_assert_eq!(dst.len(), MSG_HEADER_LEN);

    encode_payload(&mut dst, payload);
    debug_assert_eq!(dst.len(), totlen);
    dst.freeze()
}

fn encode_light(mtype: MsgType, payload: &MsgPayload) -> Bytes {
    let totlen = MSG_LIGHT_HEADER_LEN + payload_len(payload);
    let mut dst = BytesMut::with_capacity(totlen);
    dst.put_slice(MSG_SIG);
    dst.put_u32(totlen as u32);
    dst.put_u16(PROTO_VER);
    dst.put_u16(0);
    dst.put_u16(mtype as u16 | MSG_LIGHT_BIT);
    dst.put_u16(0);
    debug_assert_eq!(dst.len(), MSG_LIGHT_HEADER_LEN);
    encode_payload(&mut dst, payload);
    debug_assert_eq!(dst.len(), totlen);
    dst.freeze()
}

fn encode_payload(dst: &mut BytesMut, payload: &MsgPayload) {
    match payload {
        MsgPayload::Gossip { entries, extensions } => {
            for entry in entries {
                put_fixed_str(dst, &entry.node_id, NODE_ID_LEN);
                dst.put_u32(entry.ping_sent_secs);
                dst.put_u32(entry.pong_received_secs);
                put_fixed_str(dst, &entry.ip, NET_IP_LEN);
                dst.put_u16(entry.port);
                dst.put_u16(entry.cport);
                dst.put_u16(entry.flags.bits());
                dst.put_u16(entry.pport);
                dst.put_u16(0);
            }
            for ext in extensions {
                encode_extension(dst, ext);
            }
        }
        MsgPayload::Fail { node_id } => {
            put_fixed_str(dst, node_id, NODE_ID_LEN);
        }
        MsgPayload::Publish { channel, message } => {
            dst.put_u32(channel.len() as u32);
            dst.put_u32(message.len() as u32);
            dst.put_slice(channel);
            dst.put_slice(message);
        }
        MsgPayload::Update {
            config_epoch,
            node_id,
            slots,
        } => {
            dst.put_u64(*config_epoch);
            put_fixed_str(dst, node_id, NODE_ID_LEN);
            dst.put_slice(slots.as_bytes());
        }
        MsgPayload::Empty => {}
        MsgPayload::Module {
            module_id,
            type_tag,
            payload,
        } => {
            // The module id is deliberately not byte-swapped; receivers hand
            // it back to the owning module verbatim.
            dst.put_slice(&module_id.to_ne_bytes());
            dst.put_u32(payload.len() as u32);
            dst.put_u8(*type_tag);
            dst.put_slice(payload);
        }
    }
}

fn encode_extension(dst: &mut BytesMut, ext: &PingExt) {
    let totlen = ext_wire_len(ext);
    dst.put_u32(totlen as u32);
    let (ext_type, body): (u16, Vec<u8>) = match ext {
        PingExt::Hostname(h) => (EXT_TYPE_HOSTNAME, cstr_padded(h)),
        PingExt::HumanNodename(n) => (EXT_TYPE_HUMAN_NODENAME, cstr_padded(n)),
        PingExt::ForgottenNode { id, ttl_ms } => {
            let mut body = Vec::with_capacity(NODE_ID_LEN + 8);
            body.extend_from_slice(&fixed_id_bytes(id));
            body.extend_from_slice(&(ttl_ms / 1000).to_be_bytes());
            (EXT_TYPE_FORGOTTEN_NODE, body)
        }
        PingExt::ShardId(shard) => (EXT_TYPE_SHARD_ID, fixed_id_bytes(shard).to_vec()),
        PingExt::ClientIpv4(ip) => (EXT_TYPE_CLIENT_IPV4, cstr_padded(&ip.to_string())),
        PingExt::ClientIpv6(ip) => (EXT_TYPE_CLIENT_IPV6, cstr_padded(&ip.to_string())),
    };
    dst.put_u16(ext_type);
    dst.put_u16(0);
    dst.put_slice(&body);
    debug_assert_eq!(body.len() + 8, totlen);
}

fn cstr_padded(value: &str) -> Vec<u8> {
    let mut body = value.as_bytes().to_vec();
    body.push(0);
    body.resize(eight_byte_align(body.len()), 0);
    body
}

fn fixed_id_bytes(id: &str) -> [u8; NODE_ID_LEN] {
    let mut raw = [0u8; NODE_ID_LEN];
    let take = id.len().min(NODE_ID_LEN);
    raw[..take].copy_from_slice(&id.as_bytes()[..take]);
    raw
}

// --- Decoding ---

fn decode_full(buf: &[u8], raw_type: u16) -> Result<ClusterPacket, QuartzError> {
    if buf.len() < MSG_HEADER_LEN {
        return Err(QuartzError::Protocol("truncated full bus header".into()));
    }
    let mtype = MsgType::from_repr(raw_type)
        .ok_or_else(|| QuartzError::Protocol(format!("unknown bus message type {raw_type}")))?;

    let count = read_u16(buf, 14) as usize;
    let sender = read_fixed_str(buf, 40, NODE_ID_LEN);
    let myslots = SlotBitmap::from_bytes(&buf[80..80 + SLOT_BITMAP_LEN])
        .expect("slice length is SLOT_BITMAP_LEN");
    let replicaof_raw = read_fixed_str(buf, 2128, NODE_ID_LEN);
    let ext_count = read_u16(buf, 2214) as usize;

    let header = MsgHeader {
        mtype,
        port: read_u16(buf, 10),
        pport: read_u16(buf, 2246),
        cport: read_u16(buf, 2248),
        current_epoch: read_u64(buf, 16),
        config_epoch: read_u64(buf, 24),
        offset: read_u64(buf, 32),
        sender,
        myslots,
        replicaof: if replicaof_raw.is_empty() {
            None
        } else {
            Some(replicaof_raw)
        },
        myip: read_fixed_str(buf, 2168, NET_IP_LEN),
        sender_flags: NodeFlags::from_bits_truncate(read_u16(buf, 2250)),
        state_ok: buf[2252] == 0,
        mflags: MsgFlags::from_bits_truncate(buf[2253]),
    };

    let body = &buf[MSG_HEADER_LEN..];
    let payload = match mtype {
        MsgType::Ping | MsgType::Pong | MsgType::Meet => {
            decode_gossip_payload(body, count, ext_count)?
        }
        MsgType::Fail => decode_fail_payload(body)?,
        MsgType::Publish | MsgType::PublishShard => decode_publish_payload(body)?,
        MsgType::Update => decode_update_payload(body)?,
        MsgType::FailoverAuthRequest | MsgType::FailoverAuthAck | MsgType::MfStart => {
            if !body.is_empty() {
                return Err(QuartzError::Protocol(format!(
                    "{mtype} carries no payload but frame has {} extra bytes",
                    body.len()
                )));
            }
            MsgPayload::Empty
        }
        MsgType::Module => decode_module_payload(body)?,
    };
    Ok(ClusterPacket::Full(header, payload))
}

fn decode_light(buf: &[u8], raw_type: u16) -> Result<ClusterPacket, QuartzError> {
    let mtype = MsgType::from_repr(raw_type)
        .ok_or_else(|| QuartzError::Protocol(format!("unknown bus message type {raw_type}")))?;
    if !mtype.supports_light_header() {
        return Err(QuartzError::Protocol(format!(
            "{mtype} cannot use the light header"
        )));
    }
    let body = &buf[MSG_LIGHT_HEADER_LEN..];
    let payload = decode_publish_payload(body)?;
    Ok(ClusterPacket::Light { mtype, payload })
}

fn decode_gossip_payload(
    body: &[u8],
    count: usize,
    ext_count: usize,
) -> Result<MsgPayload, QuartzError> {
    let gossip_len = count * GOSSIP_ENTRY_LEN;
    if body.len() < gossip_len {
        return Err(QuartzError::Protocol(
            "gossip section shorter than announced count".into(),
        ));
    }
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let off = i * GOSSIP_ENTRY_LEN;
        entries.push(GossipEntry {
            node_id: read_fixed_str(body, off, NODE_ID_LEN),
            ping_sent_secs: read_u32(body, off + 40),
            pong_received_secs: read_u32(body, off + 44),
            ip: read_fixed_str(body, off + 48, NET_IP_LEN),
            port: read_u16(body, off + 94),
            cport: read_u16(body, off + 96),
            flags: NodeFlags::from_bits_truncate(read_u16(body, off + 98)),
            pport: read_u16(body, off + 100),
        });
    }

    let mut extensions = Vec::with_capacity(ext_count);
    let mut cursor = gossip_len;
    for _ in 0..ext_count {
        if body.len() < cursor + 8 {
            return Err(QuartzError::Protocol("truncated ping extension header".into()));
        }
        let ext_len = read_u32(body, cursor) as usize;
        if ext_len < 8 || ext_len % 8 != 0 || body.len() < cursor + ext_len {
            return Err(QuartzError::Protocol(format!(
                "invalid ping extension length {ext_len}"
            )));
        }
        let ext_type = read_u16(body, cursor + 4);
        let ext_body = &body[cursor + 8..cursor + ext_len];
        if let Some(ext) = decode_extension(ext_type, ext_body)? {
            extensions.push(ext);
        }
        cursor += ext_len;
    }
    if cursor != body.len() {
        return Err(QuartzError::Protocol(
            "gossip frame length does not match entries plus extensions".into(),
        ));
    }
    Ok(MsgPayload::Gossip { entries, extensions })
}

fn decode_extension(ext_type: u16, body: &[u8]) -> Result<Option<PingExt>, QuartzError> {
    let cstr = |raw: &[u8]| -> String {
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).to_string()
    };
    let ext = match ext_type {
        EXT_TYPE_HOSTNAME => Some(PingExt::Hostname(cstr(body))),
        EXT_TYPE_HUMAN_NODENAME => Some(PingExt::HumanNodename(cstr(body))),
        EXT_TYPE_FORGOTTEN_NODE => {
            if body.len() < NODE_ID_LEN + 8 {
                return Err(QuartzError::Protocol("short forgotten-node extension".into()));
            }
            Some(PingExt::ForgottenNode {
                id: read_fixed_str(body, 0, NODE_ID_LEN),
                ttl_ms: read_u64(body, NODE_ID_LEN) * 1000,
            })
        }
        EXT_TYPE_SHARD_ID => {
            if body.len() < NODE_ID_LEN {
                return Err(QuartzError::Protocol("short shard-id extension".into()));
            }
            Some(PingExt::ShardId(read_fixed_str(body, 0, NODE_ID_LEN)))
        }
        EXT_TYPE_CLIENT_IPV4 => cstr(body).parse().ok().map(PingExt::ClientIpv4),
        EXT_TYPE_CLIENT_IPV6 => cstr(body).parse().ok().map(PingExt::ClientIpv6),
        // Unknown extensions from newer peers are skipped, not rejected.
        _ => None,
    };
    Ok(ext)
}

fn decode_fail_payload(body: &[u8]) -> Result<MsgPayload, QuartzError> {
    if body.len() != NODE_ID_LEN {
        return Err(QuartzError::Protocol("FAIL payload must be one node id".into()));
    }
    Ok(MsgPayload::Fail {
        node_id: read_fixed_str(body, 0, NODE_ID_LEN),
    })
}

fn decode_publish_payload(body: &[u8]) -> Result<MsgPayload, QuartzError> {
    if body.len() < 8 {
        return Err(QuartzError::Protocol("short publish payload".into()));
    }
    let channel_len = read_u32(body, 0) as usize;
    let message_len = read_u32(body, 4) as usize;
    if body.len() != 8 + channel_len + message_len {
        return Err(QuartzError::Protocol(
            "publish payload length does not match declared sizes".into(),
        ));
    }
    Ok(MsgPayload::Publish {
        channel: Bytes::copy_from_slice(&body[8..8 + channel_len]),
        message: Bytes::copy_from_slice(&body[8 + channel_len..]),
    })
}

fn decode_update_payload(body: &[u8]) -> Result<MsgPayload, QuartzError> {
    if body.len() != 8 + NODE_ID_LEN + SLOT_BITMAP_LEN {
        return Err(QuartzError::Protocol("UPDATE payload has fixed size".into()));
    }
    Ok(MsgPayload::Update {
        config_epoch: read_u64(body, 0),
        node_id: read_fixed_str(body, 8, NODE_ID_LEN),
        slots: SlotBitmap::from_bytes(&body[8 + NODE_ID_LEN..])
            .expect("slice length is SLOT_BITMAP_LEN"),
    })
}

fn decode_module_payload(body: &[u8]) -> Result<MsgPayload, QuartzError> {
    if body.len() < 13 {
        return Err(QuartzError::Protocol("short module payload".into()));
    }
    let mut id_raw = [0u8; 8];
    id_raw.copy_from_slice(&body[0..8]);
    let declared = read_u32(body, 8) as usize;
    if body.len() != 13 + declared {
        return Err(QuartzError::Protocol(
            "module payload length does not match declared size".into(),
        ));
    }
    Ok(MsgPayload::Module {
        module_id: u64::from_ne_bytes(id_raw),
        type_tag: body[12],
        payload: Bytes::copy_from_slice(&body[13..]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(mtype: MsgType) -> MsgHeader {
        let mut myslots = SlotBitmap::new();
        myslots.set(0);
        myslots.set(42);
        myslots.set(16383);
        MsgHeader {
            mtype,
            port: 7450,
            pport: 7451,
            cport: 17450,
            current_epoch: 9,
            config_epoch: 7,
            offset: 123_456,
            sender: "a".repeat(40),
            myslots,
            replicaof: None,
            myip: "10.0.0.1".into(),
            sender_flags: NodeFlags::PRIMARY | NodeFlags::EXTENSIONS_SUPPORTED,
            state_ok: true,
            mflags: MsgFlags::empty(),
        }
    }

    #[test]
    fn header_fields_sit_at_fixed_offsets() {
        let packet = ClusterPacket::Full(sample_header(MsgType::Ping), MsgPayload::Gossip {
            entries: vec![],
            extensions: vec![],
        });
        let raw = packet.encode();
        assert_eq!(&raw[0..4], MSG_SIG);
        assert_eq!(read_u32(&raw, 4) as usize, raw.len());
        assert_eq!(read_u16(&raw, 8), PROTO_VER);
        assert_eq!(read_u16(&raw, 10), 7450);
        assert_eq!(read_u16(&raw, 12), MsgType::Ping as u16);
        assert_eq!(read_u64(&raw, 16), 9);
        assert_eq!(read_u64(&raw, 24), 7);
        assert_eq!(read_u64(&raw, 32), 123_456);
        assert_eq!(&raw[40..80], "a".repeat(40).as_bytes());
        assert_eq!(read_u16(&raw, 2246), 7451);
        assert_eq!(read_u16(&raw, 2248), 17450);
        assert_eq!(raw.len(), MSG_HEADER_LEN);
    }

    #[test]
    fn gossip_with_extensions_roundtrips() {
        let entries = vec![GossipEntry {
            node_id: "b".repeat(40),
            ping_sent_secs: 100,
            pong_received_secs: 101,
            ip: "10.0.0.2".into(),
            port: 7450,
            cport: 17450,
            flags: NodeFlags::PRIMARY,
            pport: 0,
        }];
        let extensions = vec![
            PingExt::Hostname("node-b.example".into()),
            PingExt::HumanNodename("b-side".into()),
            PingExt::ForgottenNode {
                id: "c".repeat(40),
                ttl_ms: 60_000,
            },
            PingExt::ShardId("d".repeat(40)),
            PingExt::ClientIpv4("192.168.1.5".parse().unwrap()),
            PingExt::ClientIpv6("::1".parse().unwrap()),
        ];
        let packet = ClusterPacket::Full(sample_header(MsgType::Pong), MsgPayload::Gossip {
            entries: entries.clone(),
            extensions: extensions.clone(),
        });
        let raw = packet.encode();
        assert_eq!(raw.len() % 8, 0);

        let decoded = ClusterPacket::decode(&raw).unwrap();
        let ClusterPacket::Full(header, MsgPayload::Gossip { entries: e2, extensions: x2 }) =
            decoded
        else {
            panic!("expected full gossip packet");
        };
        assert_eq!(header.mtype, MsgType::Pong);
        assert!(header.mflags.contains(MsgFlags::EXT_DATA));
        assert_eq!(e2, entries);
        assert_eq!(x2, extensions);
    }

    #[test]
    fn every_fixed_payload_type_roundtrips() {
        let fail = ClusterPacket::Full(sample_header(MsgType::Fail), MsgPayload::Fail {
            node_id: "f".repeat(40),
        });
        let update = ClusterPacket::Full(sample_header(MsgType::Update), MsgPayload::Update {
            config_epoch: 11,
            node_id: "u".repeat(40),
            slots: SlotBitmap::new(),
        });
        let auth = ClusterPacket::Full(
            sample_header(MsgType::FailoverAuthRequest),
            MsgPayload::Empty,
        );
        let module = ClusterPacket::Full(sample_header(MsgType::Module), MsgPayload::Module {
            module_id: 0xDEAD_BEEF,
            type_tag: 3,
            payload: Bytes::from_static(b"module-bytes"),
        });
        for packet in [fail, update, auth, module] {
            let raw = packet.encode();
            let decoded = ClusterPacket::decode(&raw).unwrap();
            assert_eq!(decoded.encode(), raw);
        }
    }

    #[test]
    fn light_publish_roundtrips_and_rejects_wrong_types() {
        let packet = ClusterPacket::Light {
            mtype: MsgType::PublishShard,
            payload: MsgPayload::Publish {
                channel: Bytes::from_static(b"chan"),
                message: Bytes::from_static(b"payload"),
            },
        };
        let raw = packet.encode();
        assert_eq!(read_u16(&raw, 12) & MSG_LIGHT_BIT, MSG_LIGHT_BIT);
        let decoded = ClusterPacket::decode(&raw).unwrap();
        assert_eq!(decoded.encode(), raw);

        // A light PING is not a valid frame.
        let mut forged = raw.to_vec();
        forged[13] = MsgType::Ping as u8;
        forged[12] = (MSG_LIGHT_BIT >> 8) as u8;
        assert!(ClusterPacket::decode(&forged).is_err());
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let packet = ClusterPacket::Full(sample_header(MsgType::Fail), MsgPayload::Fail {
            node_id: "f".repeat(40),
        });
        let mut raw = packet.encode().to_vec();
        raw.push(0); // one trailing byte breaks the exact-length rule
        assert!(ClusterPacket::decode(&raw).is_err());
    }
}

//! Cluster bus wire format.
//!
//! Every message is a fixed header followed by a body whose shape depends on
//! the message type. All integers are big-endian. The header carries the
//! sender's complete view of itself (epochs, slots, master, address, flags),
//! so any message doubles as a heartbeat.
//!
//! Decoding is incremental: [`ClusterMessage::decode`] returns `Ok(None)`
//! until a whole frame is buffered, which lets the caller feed it whatever a
//! socket read produced.

use std::fmt;
use std::net::IpAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::slots::{SlotBitmap, SLOT_BITMAP_LEN};
use crate::topology::{NodeFlags, NAME_LEN};
use crate::{ClusterError, ClusterHealth, NodeName};

/// Leading bytes of every bus message.
pub const SIGNATURE: [u8; 4] = *b"RCmb";

pub const PROTOCOL_VERSION: u16 = 1;

/// Size of the ip field, NUL padded.
pub const IP_LEN: usize = 46;

const HEADER_RESERVED: usize = 34;

/// Size of the fixed header.
pub const HEADER_LEN: usize = 4 + 4 + 2 + 2 + 2 + 2 // sig, totlen, ver, port, type, count
    + 8 + 8 + 8 // current epoch, config epoch, offset
    + NAME_LEN + SLOT_BITMAP_LEN + NAME_LEN
    + IP_LEN + HEADER_RESERVED
    + 2 + 2 + 1 + 3; // cport, flags, state, mflags

/// Size of one gossip entry.
pub const GOSSIP_ENTRY_LEN: usize = NAME_LEN + 4 + 4 + IP_LEN + 2 + 2 + 2 + 4;

const UPDATE_BODY_LEN: usize = 8 + NAME_LEN + SLOT_BITMAP_LEN;
const PUBLISH_PREFIX_LEN: usize = 8;
const MODULE_PREFIX_LEN: usize = 8 + 4 + 1;

/// Frames larger than this are rejected before buffering the rest.
pub const MAX_MESSAGE_LEN: usize = 8 * 1024 * 1024;

bitflags::bitflags! {
    /// First byte of the header's message flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MessageFlags: u8 {
        /// Sender is a master with writes paused for a manual failover.
        const PAUSED = 1 << 0;
        /// Vote for this AUTH_REQUEST even though the master isn't failed.
        const FORCEACK = 1 << 1;
    }
}

/// Message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Ping = 0,
    Pong = 1,
    Meet = 2,
    Fail = 3,
    Publish = 4,
    AuthRequest = 5,
    AuthAck = 6,
    Update = 7,
    MfStart = 8,
    Module = 9,
}

impl MessageType {
    pub const COUNT: usize = 10;

    pub const ALL: [MessageType; Self::COUNT] = [
        MessageType::Ping,
        MessageType::Pong,
        MessageType::Meet,
        MessageType::Fail,
        MessageType::Publish,
        MessageType::AuthRequest,
        MessageType::AuthAck,
        MessageType::Update,
        MessageType::MfStart,
        MessageType::Module,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u16> for MessageType {
    type Error = ClusterError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        MessageType::ALL
            .get(code as usize)
            .copied()
            .ok_or_else(|| ClusterError::malformed(format!("unknown message type {code}")))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Meet => "meet",
            MessageType::Fail => "fail",
            MessageType::Publish => "publish",
            MessageType::AuthRequest => "auth-req",
            MessageType::AuthAck => "auth-ack",
            MessageType::Update => "update",
            MessageType::MfStart => "mfstart",
            MessageType::Module => "module",
        };
        f.write_str(name)
    }
}

/// The sender's description of itself, present on every message.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    /// Client port.
    pub port: u16,
    pub current_epoch: u64,
    /// The sender's config epoch, or its master's if it is a replica.
    pub config_epoch: u64,
    /// Replication offset.
    pub offset: u64,
    pub sender: NodeName,
    /// Slots served by the sender, or by its master if it is a replica.
    pub slots: SlotBitmap,
    pub replicates: Option<NodeName>,
    /// `None` lets the receiver use the address the link came from.
    pub ip: Option<IpAddr>,
    /// Bus port.
    pub cport: u16,
    pub flags: NodeFlags,
    pub state: ClusterHealth,
    pub mflags: MessageFlags,
}

/// A peer summary carried by PING, PONG and MEET.
///
/// `ping_sent` and `pong_received` are ages in milliseconds as seen by the
/// sender; zero means never.
#[derive(Debug, Clone, PartialEq)]
pub struct GossipEntry {
    pub name: NodeName,
    pub ping_sent: u32,
    pub pong_received: u32,
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub cport: u16,
    pub flags: NodeFlags,
}

/// Type-specific payload.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Ping(Vec<GossipEntry>),
    Pong(Vec<GossipEntry>),
    /// Like PING, and asks the receiver to add the sender even if unknown.
    Meet(Vec<GossipEntry>),
    /// The named node was confirmed failed.
    Fail { node: NodeName },
    Publish { channel: Bytes, message: Bytes },
    AuthRequest,
    AuthAck,
    /// Authoritative slot configuration of `node`.
    Update {
        config_epoch: u64,
        node: NodeName,
        slots: SlotBitmap,
    },
    MfStart,
    /// Opaque module payload.
    Module {
        module_id: u64,
        module_type: u8,
        payload: Bytes,
    },
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::Ping(_) => MessageType::Ping,
            MessageBody::Pong(_) => MessageType::Pong,
            MessageBody::Meet(_) => MessageType::Meet,
            MessageBody::Fail { .. } => MessageType::Fail,
            MessageBody::Publish { .. } => MessageType::Publish,
            MessageBody::AuthRequest => MessageType::AuthRequest,
            MessageBody::AuthAck => MessageType::AuthAck,
            MessageBody::Update { .. } => MessageType::Update,
            MessageBody::MfStart => MessageType::MfStart,
            MessageBody::Module { .. } => MessageType::Module,
        }
    }

    fn gossip(&self) -> &[GossipEntry] {
        match self {
            MessageBody::Ping(g) | MessageBody::Pong(g) | MessageBody::Meet(g) => g,
            _ => &[],
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            MessageBody::Ping(g) | MessageBody::Pong(g) | MessageBody::Meet(g) => {
                g.len() * GOSSIP_ENTRY_LEN
            }
            MessageBody::Fail { .. } => NAME_LEN,
            MessageBody::Publish { channel, message } => {
                PUBLISH_PREFIX_LEN + channel.len() + message.len()
            }
            MessageBody::AuthRequest | MessageBody::AuthAck | MessageBody::MfStart => 0,
            MessageBody::Update { .. } => UPDATE_BODY_LEN,
            MessageBody::Module { payload, .. } => MODULE_PREFIX_LEN + payload.len(),
        }
    }
}

/// A complete bus message.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterMessage {
    pub header: Header,
    pub body: MessageBody,
}

impl ClusterMessage {
    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    /// Total encoded length, header included.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.body.encoded_len()
    }

    /// Serializes the message to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Serializes the message into the given buffer.
    ///
    /// At most `u16::MAX` gossip entries are written.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let h = &self.header;
        let gossip = self.body.gossip();
        let count = gossip.len().min(u16::MAX as usize);
        let totlen = self.encoded_len() - (gossip.len() - count) * GOSSIP_ENTRY_LEN;

        buf.put_slice(&SIGNATURE);
        buf.put_u32(totlen as u32);
        buf.put_u16(PROTOCOL_VERSION);
        buf.put_u16(h.port);
        buf.put_u16(self.message_type() as u16);
        buf.put_u16(count as u16);
        buf.put_u64(h.current_epoch);
        buf.put_u64(h.config_epoch);
        buf.put_u64(h.offset);
        buf.put_slice(h.sender.as_bytes());
        buf.put_slice(h.slots.as_bytes());
        buf.put_slice(h.replicates.unwrap_or(NodeName::NULL).as_bytes());
        put_ip(buf, h.ip);
        buf.put_bytes(0, HEADER_RESERVED);
        buf.put_u16(h.cport);
        buf.put_u16(h.flags.bits());
        buf.put_u8(h.state.wire_code());
        buf.put_u8(h.mflags.bits());
        buf.put_bytes(0, 2);

        match &self.body {
            MessageBody::Ping(_) | MessageBody::Pong(_) | MessageBody::Meet(_) => {
                for entry in &gossip[..count] {
                    buf.put_slice(entry.name.as_bytes());
                    buf.put_u32(entry.ping_sent);
                    buf.put_u32(entry.pong_received);
                    put_ip(buf, entry.ip);
                    buf.put_u16(entry.port);
                    buf.put_u16(entry.cport);
                    buf.put_u16(entry.flags.bits());
                    buf.put_bytes(0, 4);
                }
            }
            MessageBody::Fail { node } => buf.put_slice(node.as_bytes()),
            MessageBody::Publish { channel, message } => {
                buf.put_u32(channel.len() as u32);
                buf.put_u32(message.len() as u32);
                buf.put_slice(channel);
                buf.put_slice(message);
            }
            MessageBody::AuthRequest | MessageBody::AuthAck | MessageBody::MfStart => {}
            MessageBody::Update {
                config_epoch,
                node,
                slots,
            } => {
                buf.put_u64(*config_epoch);
                buf.put_slice(node.as_bytes());
                buf.put_slice(slots.as_bytes());
            }
            MessageBody::Module {
                module_id,
                module_type,
                payload,
            } => {
                buf.put_u64(*module_id);
                buf.put_u32(payload.len() as u32);
                buf.put_u8(*module_type);
                buf.put_slice(payload);
            }
        }
    }

    /// Tries to decode one message from the front of `buf`.
    ///
    /// Returns `Ok(Some((message, consumed)))` when a whole frame is present,
    /// `Ok(None)` when more bytes are needed, and `Err(Malformed)` when the
    /// bytes can never form a valid frame.
    pub fn decode(buf: &[u8]) -> Result<Option<(ClusterMessage, usize)>, ClusterError> {
        let sig_len = buf.len().min(SIGNATURE.len());
        if buf[..sig_len] != SIGNATURE[..sig_len] {
            return Err(ClusterError::malformed("bad signature"));
        }
        if buf.len() < 8 {
            return Ok(None);
        }

        let totlen = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        if totlen < HEADER_LEN {
            return Err(ClusterError::malformed(format!(
                "declared length {totlen} is shorter than the header"
            )));
        }
        if totlen > MAX_MESSAGE_LEN {
            return Err(ClusterError::malformed(format!(
                "declared length {totlen} exceeds limit"
            )));
        }
        if buf.len() < totlen {
            return Ok(None);
        }

        let mut frame = &buf[8..totlen];
        let version = frame.get_u16();
        if version != PROTOCOL_VERSION {
            return Err(ClusterError::malformed(format!(
                "unsupported protocol version {version}"
            )));
        }
        let port = frame.get_u16();
        let msg_type = MessageType::try_from(frame.get_u16())?;
        let count = frame.get_u16() as usize;
        let current_epoch = frame.get_u64();
        let config_epoch = frame.get_u64();
        let offset = frame.get_u64();
        let sender = get_name(&mut frame);
        let slots = SlotBitmap::from_bytes(&frame[..SLOT_BITMAP_LEN])?;
        frame.advance(SLOT_BITMAP_LEN);
        let replicates = Some(get_name(&mut frame)).filter(|n| !n.is_null());
        let ip = get_ip(&mut frame)?;
        frame.advance(HEADER_RESERVED);
        let cport = frame.get_u16();
        let flags = NodeFlags::from_bits_truncate(frame.get_u16());
        let state = ClusterHealth::from_wire(frame.get_u8())?;
        let mflags = MessageFlags::from_bits_truncate(frame.get_u8());
        frame.advance(2);

        let header = Header {
            port,
            current_epoch,
            config_epoch,
            offset,
            sender,
            slots,
            replicates,
            ip,
            cport,
            flags,
            state,
            mflags,
        };
        let body = decode_body(msg_type, count, frame)?;
        Ok(Some((ClusterMessage { header, body }, totlen)))
    }
}

fn decode_body(
    msg_type: MessageType,
    count: usize,
    mut body: &[u8],
) -> Result<MessageBody, ClusterError> {
    let expect_len = |expected: usize, body: &[u8]| {
        if body.len() == expected {
            Ok(())
        } else {
            Err(ClusterError::malformed(format!(
                "{msg_type} body is {} bytes, expected {expected}",
                body.len()
            )))
        }
    };

    match msg_type {
        MessageType::Ping | MessageType::Pong | MessageType::Meet => {
            expect_len(count * GOSSIP_ENTRY_LEN, body)?;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let name = get_name(&mut body);
                let ping_sent = body.get_u32();
                let pong_received = body.get_u32();
                let ip = get_ip(&mut body)?;
                let port = body.get_u16();
                let cport = body.get_u16();
                let flags = NodeFlags::from_bits_truncate(body.get_u16());
                body.advance(4);
                entries.push(GossipEntry {
                    name,
                    ping_sent,
                    pong_received,
                    ip,
                    port,
                    cport,
                    flags,
                });
            }
            Ok(match msg_type {
                MessageType::Ping => MessageBody::Ping(entries),
                MessageType::Pong => MessageBody::Pong(entries),
                _ => MessageBody::Meet(entries),
            })
        }
        MessageType::Fail => {
            expect_len(NAME_LEN, body)?;
            Ok(MessageBody::Fail {
                node: get_name(&mut body),
            })
        }
        MessageType::Publish => {
            if body.len() < PUBLISH_PREFIX_LEN {
                return Err(ClusterError::malformed("truncated publish body"));
            }
            let channel_len = body.get_u32() as usize;
            let message_len = body.get_u32() as usize;
            expect_len(channel_len.saturating_add(message_len), body)?;
            let channel = Bytes::copy_from_slice(&body[..channel_len]);
            let message = Bytes::copy_from_slice(&body[channel_len..]);
            Ok(MessageBody::Publish { channel, message })
        }
        MessageType::AuthRequest | MessageType::AuthAck | MessageType::MfStart => {
            expect_len(0, body)?;
            Ok(match msg_type {
                MessageType::AuthRequest => MessageBody::AuthRequest,
                MessageType::AuthAck => MessageBody::AuthAck,
                _ => MessageBody::MfStart,
            })
        }
        MessageType::Update => {
            expect_len(UPDATE_BODY_LEN, body)?;
            let config_epoch = body.get_u64();
            let node = get_name(&mut body);
            let slots = SlotBitmap::from_bytes(body)?;
            Ok(MessageBody::Update {
                config_epoch,
                node,
                slots,
            })
        }
        MessageType::Module => {
            if body.len() < MODULE_PREFIX_LEN {
                return Err(ClusterError::malformed("truncated module body"));
            }
            let module_id = body.get_u64();
            let len = body.get_u32() as usize;
            let module_type = body.get_u8();
            expect_len(len, body)?;
            Ok(MessageBody::Module {
                module_id,
                module_type,
                payload: Bytes::copy_from_slice(body),
            })
        }
    }
}

// callers have already checked the frame length

fn get_name(buf: &mut &[u8]) -> NodeName {
    let mut bytes = [0u8; NAME_LEN];
    buf.copy_to_slice(&mut bytes);
    NodeName::from_bytes(bytes)
}

fn get_ip(buf: &mut &[u8]) -> Result<Option<IpAddr>, ClusterError> {
    let raw = &buf[..IP_LEN];
    buf.advance(IP_LEN);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(IP_LEN);
    if end == 0 {
        return Ok(None);
    }
    std::str::from_utf8(&raw[..end])
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Some)
        .ok_or_else(|| ClusterError::malformed("invalid ip address"))
}

fn put_ip(buf: &mut BytesMut, ip: Option<IpAddr>) {
    let text = ip.map(|ip| ip.to_string()).unwrap_or_default();
    let bytes = &text.as_bytes()[..text.len().min(IP_LEN - 1)];
    buf.put_slice(bytes);
    buf.put_bytes(0, IP_LEN - bytes.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Header {
        Header {
            port: 7000,
            current_epoch: 12,
            config_epoch: 9,
            offset: 123_456,
            sender: NodeName::random(),
            slots: (0..=100).collect(),
            replicates: None,
            ip: Some("10.1.2.3".parse().unwrap()),
            cport: 17000,
            flags: NodeFlags::PRIMARY,
            state: ClusterHealth::Ok,
            mflags: MessageFlags::empty(),
        }
    }

    fn entry(port: u16) -> GossipEntry {
        GossipEntry {
            name: NodeName::random(),
            ping_sent: 0,
            pong_received: 250,
            ip: Some("::1".parse().unwrap()),
            port,
            cport: port + 10000,
            flags: NodeFlags::REPLICA | NodeFlags::PFAIL,
        }
    }

    fn round_trip(msg: ClusterMessage) {
        let bytes = msg.encode();
        assert_eq!(bytes.len(), msg.encoded_len());
        let (decoded, used) = ClusterMessage::decode(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn header_layout() {
        assert_eq!(HEADER_LEN, 2216);
        assert_eq!(GOSSIP_ENTRY_LEN, 84);

        let msg = ClusterMessage {
            header: header(),
            body: MessageBody::AuthRequest,
        };
        let bytes = msg.encode();
        assert_eq!(&bytes[..4], b"RCmb");
        assert_eq!(&bytes[4..8], &(HEADER_LEN as u32).to_be_bytes());
        assert_eq!(&bytes[8..10], &[0, 1]);
        assert_eq!(&bytes[10..12], &7000u16.to_be_bytes());
        assert_eq!(&bytes[12..14], &[0, 5]);
    }

    #[test]
    fn gossip_messages() {
        let mut h = header();
        h.replicates = Some(NodeName::random());
        h.flags = NodeFlags::REPLICA;
        round_trip(ClusterMessage {
            header: h,
            body: MessageBody::Ping(vec![entry(7001), entry(7002)]),
        });
        round_trip(ClusterMessage {
            header: header(),
            body: MessageBody::Meet(Vec::new()),
        });
    }

    #[test]
    fn other_bodies() {
        let bodies = [
            MessageBody::Fail {
                node: NodeName::random(),
            },
            MessageBody::Publish {
                channel: Bytes::from_static(b"news"),
                message: Bytes::from_static(b"hello"),
            },
            MessageBody::AuthAck,
            MessageBody::MfStart,
            MessageBody::Update {
                config_epoch: 44,
                node: NodeName::random(),
                slots: (5000..6000).collect(),
            },
            MessageBody::Module {
                module_id: 0xdead_beef,
                module_type: 3,
                payload: Bytes::from_static(b"opaque"),
            },
        ];
        for body in bodies {
            let mut h = header();
            h.mflags = MessageFlags::PAUSED | MessageFlags::FORCEACK;
            h.state = ClusterHealth::Fail;
            h.ip = None;
            round_trip(ClusterMessage { header: h, body });
        }
    }

    #[test]
    fn partial_input_needs_more() {
        let bytes = ClusterMessage {
            header: header(),
            body: MessageBody::Pong(vec![entry(7005)]),
        }
        .encode();
        for cut in [0, 3, 7, 8, HEADER_LEN, bytes.len() - 1] {
            assert!(ClusterMessage::decode(&bytes[..cut]).unwrap().is_none(), "cut {cut}");
        }
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let first = ClusterMessage {
            header: header(),
            body: MessageBody::AuthRequest,
        };
        let second = ClusterMessage {
            header: header(),
            body: MessageBody::Fail {
                node: NodeName::random(),
            },
        };
        let mut buf = BytesMut::new();
        first.encode_into(&mut buf);
        second.encode_into(&mut buf);

        let (msg, used) = ClusterMessage::decode(&buf).unwrap().unwrap();
        assert_eq!(msg, first);
        let (msg, rest) = ClusterMessage::decode(&buf[used..]).unwrap().unwrap();
        assert_eq!(msg, second);
        assert_eq!(used + rest, buf.len());
    }

    #[test]
    fn rejects_bad_signature() {
        let mut bytes = ClusterMessage {
            header: header(),
            body: MessageBody::MfStart,
        }
        .encode()
        .to_vec();
        bytes[1] = b'X';
        assert!(matches!(
            ClusterMessage::decode(&bytes),
            Err(ClusterError::Malformed(_))
        ));
        // a wrong prefix is detected before the frame is complete
        assert!(ClusterMessage::decode(b"RX").is_err());
    }

    #[test]
    fn rejects_short_declared_length() {
        let mut bytes = b"RCmb".to_vec();
        bytes.extend_from_slice(&100u32.to_be_bytes());
        assert!(ClusterMessage::decode(&bytes).is_err());

        let mut bytes = b"RCmb".to_vec();
        bytes.extend_from_slice(&(MAX_MESSAGE_LEN as u32 + 1).to_be_bytes());
        assert!(ClusterMessage::decode(&bytes).is_err());
    }

    #[test]
    fn rejects_inconsistent_body_length() {
        let msg = ClusterMessage {
            header: header(),
            body: MessageBody::Ping(vec![entry(7001)]),
        };
        let mut bytes = msg.encode().to_vec();
        // claim two entries while carrying one
        bytes[14..16].copy_from_slice(&2u16.to_be_bytes());
        assert!(ClusterMessage::decode(&bytes).is_err());

        let msg = ClusterMessage {
            header: header(),
            body: MessageBody::AuthAck,
        };
        let mut bytes = msg.encode().to_vec();
        bytes.extend_from_slice(&[0; 4]);
        let totlen = bytes.len() as u32;
        bytes[4..8].copy_from_slice(&totlen.to_be_bytes());
        assert!(ClusterMessage::decode(&bytes).is_err());
    }

    #[test]
    fn rejects_unknown_type_and_version() {
        let bytes = ClusterMessage {
            header: header(),
            body: MessageBody::AuthAck,
        }
        .encode()
        .to_vec();

        let mut bad_type = bytes.clone();
        bad_type[12..14].copy_from_slice(&42u16.to_be_bytes());
        assert!(ClusterMessage::decode(&bad_type).is_err());

        let mut bad_version = bytes;
        bad_version[8..10].copy_from_slice(&2u16.to_be_bytes());
        assert!(ClusterMessage::decode(&bad_version).is_err());
    }

    #[test]
    fn rejects_publish_lengths_past_body() {
        let msg = ClusterMessage {
            header: header(),
            body: MessageBody::Publish {
                channel: Bytes::from_static(b"c"),
                message: Bytes::from_static(b"m"),
            },
        };
        let mut bytes = msg.encode().to_vec();
        bytes[HEADER_LEN..HEADER_LEN + 4].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(ClusterMessage::decode(&bytes).is_err());
    }
}

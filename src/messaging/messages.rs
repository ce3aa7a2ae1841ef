use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::messaging::node_addr::NodeId;
use crate::messaging::protocol::{MIN_PROTOCOL_SUPPORTED, PROTOCOL_WITH_SNAPSHOTS};
use crate::status::Status;

/// Wire discriminator of a message. Unknown values are tolerated by the
///  frame decoder (the frame is skipped based on its length field), so new
///  types can be introduced without breaking old peers.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum MessageType {
    Hello = 1,
    Ack = 2,
    ConfigAdvisory = 3,
    Stored = 4,
    GetSnapshot = 5,
    SnapshotReply = 6,
}

/// First frame of the handshake, sent by the connecting side once TCP is up.
///
/// The trailing fields are optional; their presence is recorded in `flags`
///  so the header can grow without a protocol bump.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HelloHeader {
    pub proto_min: u16,
    pub proto_max: u16,
    pub destination: Option<NodeId>,
    pub cluster_name: Option<String>,
    pub build_info: Option<String>,
}

impl HelloHeader {
    pub const FLAG_DESTINATION: u16 = 1 << 0;
    pub const FLAG_CLUSTER_NAME: u16 = 1 << 1;
    pub const FLAG_BUILD_INFO: u16 = 1 << 2;

    fn flags(&self) -> u16 {
        let mut flags = 0;
        if self.destination.is_some() {
            flags |= Self::FLAG_DESTINATION;
        }
        if self.cluster_name.is_some() {
            flags |= Self::FLAG_CLUSTER_NAME;
        }
        if self.build_info.is_some() {
            flags |= Self::FLAG_BUILD_INFO;
        }
        flags
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.proto_min);
        buf.put_u16_le(self.proto_max);
        buf.put_u16_le(self.flags());
        if let Some(destination) = self.destination {
            destination.ser(buf);
        }
        if let Some(name) = &self.cluster_name {
            put_short_string(buf, name);
        }
        if let Some(info) = &self.build_info {
            put_short_string(buf, info);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<HelloHeader> {
        if buf.remaining() < 3 * size_of::<u16>() {
            bail!("truncated HELLO header");
        }
        let proto_min = buf.get_u16_le();
        let proto_max = buf.get_u16_le();
        let flags = buf.get_u16_le();

        let destination = if flags & Self::FLAG_DESTINATION != 0 {
            Some(NodeId::deser(buf)?)
        } else {
            None
        };
        let cluster_name = if flags & Self::FLAG_CLUSTER_NAME != 0 {
            Some(get_short_string(buf)?)
        } else {
            None
        };
        let build_info = if flags & Self::FLAG_BUILD_INFO != 0 {
            Some(get_short_string(buf)?)
        } else {
            None
        };

        Ok(HelloHeader {
            proto_min,
            proto_max,
            destination,
            cluster_name,
            build_info,
        })
    }

    pub fn wire_size(&self) -> usize {
        let mut len = 3 * size_of::<u16>();
        if self.destination.is_some() {
            len += NodeId::WIRE_SIZE;
        }
        if let Some(name) = &self.cluster_name {
            len += size_of::<u16>() + name.len();
        }
        if let Some(info) = &self.build_info {
            len += size_of::<u16>() + info.len();
        }
        len
    }
}

/// Handshake reply. `status != Ok` closes the connection with that reason;
///  `proto` is the negotiated protocol version, `client_idx` the identity the
///  peer's sender assigned to this socket.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AckHeader {
    pub options: u8,
    pub rqid: u64,
    pub client_idx: u32,
    pub proto: u16,
    pub status: Status,
}

impl AckHeader {
    pub const WIRE_SIZE: usize =
        size_of::<u8>() + size_of::<u64>() + size_of::<u32>() + 2 * size_of::<u16>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.options);
        buf.put_u64_le(self.rqid);
        buf.put_u32_le(self.client_idx);
        buf.put_u16_le(self.proto);
        buf.put_u16_le(self.status.into());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AckHeader> {
        if buf.remaining() < Self::WIRE_SIZE {
            bail!("truncated ACK header");
        }
        let options = buf.get_u8();
        let rqid = buf.get_u64_le();
        let client_idx = buf.get_u32_le();
        let proto = buf.get_u16_le();
        let status = deser_status(buf.get_u16_le())?;
        Ok(AckHeader {
            options,
            rqid,
            client_idx,
            proto,
            status,
        })
    }
}

/// Notifies the peer of the sender's current configuration version so it can
///  fetch a newer snapshot if it is behind.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ConfigAdvisoryHeader {
    pub config_version: u64,
}

impl ConfigAdvisoryHeader {
    pub const WIRE_SIZE: usize = size_of::<u64>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.config_version);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ConfigAdvisoryHeader> {
        if buf.remaining() < Self::WIRE_SIZE {
            bail!("truncated CONFIG_ADVISORY header");
        }
        Ok(ConfigAdvisoryHeader {
            config_version: buf.get_u64_le(),
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RecordId {
    pub esn: u32,
    pub epoch: u32,
    pub log_id: u64,
}

impl RecordId {
    pub const WIRE_SIZE: usize = 2 * size_of::<u32>() + size_of::<u64>();
}

/// Storage node's response to a store wave.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StoredHeader {
    pub record: RecordId,
    pub wave: u32,
    pub status: Status,
    pub redirect_node: u64,
    pub flags: u8,
}

impl StoredHeader {
    pub const SYNCED: u8 = 1 << 0;
    pub const OVERLOADED: u8 = 1 << 1;
    pub const AMENDABLE: u8 = 1 << 2;

    pub const WIRE_SIZE: usize = RecordId::WIRE_SIZE
        + size_of::<u32>()
        + size_of::<u16>()
        + size_of::<u64>()
        + size_of::<u8>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.record.esn);
        buf.put_u32_le(self.record.epoch);
        buf.put_u64_le(self.record.log_id);
        buf.put_u32_le(self.wave);
        buf.put_u16_le(self.status.into());
        buf.put_u64_le(self.redirect_node);
        buf.put_u8(self.flags);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<StoredHeader> {
        if buf.remaining() < Self::WIRE_SIZE {
            bail!("truncated STORED header");
        }
        let record = RecordId {
            esn: buf.get_u32_le(),
            epoch: buf.get_u32_le(),
            log_id: buf.get_u64_le(),
        };
        let wave = buf.get_u32_le();
        let status = deser_status(buf.get_u16_le())?;
        let redirect_node = buf.get_u64_le();
        let flags = buf.get_u8();
        Ok(StoredHeader {
            record,
            wave,
            status,
            redirect_node,
            flags,
        })
    }
}

/// Asks the peer for its latest state snapshot; the reply is correlated by
///  `rqid` through the worker's request registry.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct GetSnapshotHeader {
    pub flags: u8,
    pub rqid: u64,
}

impl GetSnapshotHeader {
    pub const WIRE_SIZE: usize = size_of::<u8>() + size_of::<u64>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.flags);
        buf.put_u64_le(self.rqid);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<GetSnapshotHeader> {
        if buf.remaining() < Self::WIRE_SIZE {
            bail!("truncated GET_SNAPSHOT header");
        }
        let flags = buf.get_u8();
        let rqid = buf.get_u64_le();
        Ok(GetSnapshotHeader { flags, rqid })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SnapshotReplyHeader {
    pub status: Status,
    pub rqid: u64,
}

impl SnapshotReplyHeader {
    pub const WIRE_SIZE: usize = size_of::<u16>() + size_of::<u64>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.status.into());
        buf.put_u64_le(self.rqid);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SnapshotReplyHeader> {
        if buf.remaining() < Self::WIRE_SIZE {
            bail!("truncated SNAPSHOT_REPLY header");
        }
        let status = deser_status(buf.get_u16_le())?;
        let rqid = buf.get_u64_le();
        Ok(SnapshotReplyHeader { status, rqid })
    }
}

/// The closed set of messages this node understands. Each variant knows its
///  wire type, minimum protocol and payload layout; dispatch on receipt is a
///  match in the worker rather than virtual calls.
#[derive(Clone, Eq, PartialEq)]
pub enum Message {
    Hello(HelloHeader),
    Ack(AckHeader),
    ConfigAdvisory(ConfigAdvisoryHeader),
    Stored(StoredHeader),
    GetSnapshot(GetSnapshotHeader),
    SnapshotReply(SnapshotReplyHeader, Bytes),
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Hello(h) => write!(f, "HELLO{:?}", h),
            Message::Ack(h) => write!(f, "ACK{:?}", h),
            Message::ConfigAdvisory(h) => write!(f, "CONFIG_ADVISORY{:?}", h),
            Message::Stored(h) => write!(f, "STORED{:?}", h),
            Message::GetSnapshot(h) => write!(f, "GET_SNAPSHOT{:?}", h),
            Message::SnapshotReply(h, blob) => {
                write!(f, "SNAPSHOT_REPLY{:?} blob_len={}", h, blob.len())
            }
        }
    }
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::Ack(_) => MessageType::Ack,
            Message::ConfigAdvisory(_) => MessageType::ConfigAdvisory,
            Message::Stored(_) => MessageType::Stored,
            Message::GetSnapshot(_) => MessageType::GetSnapshot,
            Message::SnapshotReply(_, _) => MessageType::SnapshotReply,
        }
    }

    /// The oldest protocol version this message can be encoded at. A message
    ///  must not reach the wire stage of a connection whose negotiated
    ///  protocol is older.
    pub fn min_protocol(&self) -> u16 {
        match self {
            Message::Hello(_)
            | Message::Ack(_)
            | Message::ConfigAdvisory(_)
            | Message::Stored(_) => MIN_PROTOCOL_SUPPORTED,
            Message::GetSnapshot(_) | Message::SnapshotReply(_, _) => PROTOCOL_WITH_SNAPSHOTS,
        }
    }

    /// Serialized size of everything after the protocol header fields.
    pub fn payload_size(&self) -> usize {
        match self {
            Message::Hello(h) => h.wire_size(),
            Message::Ack(_) => AckHeader::WIRE_SIZE,
            Message::ConfigAdvisory(_) => ConfigAdvisoryHeader::WIRE_SIZE,
            Message::Stored(_) => StoredHeader::WIRE_SIZE,
            Message::GetSnapshot(_) => GetSnapshotHeader::WIRE_SIZE,
            Message::SnapshotReply(_, blob) => {
                SnapshotReplyHeader::WIRE_SIZE + size_of::<u32>() + blob.len()
            }
        }
    }

    pub fn ser_payload(&self, buf: &mut impl BufMut) {
        match self {
            Message::Hello(h) => h.ser(buf),
            Message::Ack(h) => h.ser(buf),
            Message::ConfigAdvisory(h) => h.ser(buf),
            Message::Stored(h) => h.ser(buf),
            Message::GetSnapshot(h) => h.ser(buf),
            Message::SnapshotReply(h, blob) => {
                h.ser(buf);
                put_blob(buf, blob);
            }
        }
    }

    pub fn deser_payload(message_type: MessageType, buf: &mut Bytes) -> anyhow::Result<Message> {
        let msg = match message_type {
            MessageType::Hello => Message::Hello(HelloHeader::deser(buf)?),
            MessageType::Ack => Message::Ack(AckHeader::deser(buf)?),
            MessageType::ConfigAdvisory => {
                Message::ConfigAdvisory(ConfigAdvisoryHeader::deser(buf)?)
            }
            MessageType::Stored => Message::Stored(StoredHeader::deser(buf)?),
            MessageType::GetSnapshot => Message::GetSnapshot(GetSnapshotHeader::deser(buf)?),
            MessageType::SnapshotReply => {
                let header = SnapshotReplyHeader::deser(buf)?;
                let blob = get_blob(buf)?;
                Message::SnapshotReply(header, blob)
            }
        };
        Ok(msg)
    }
}

fn deser_status(raw: u16) -> anyhow::Result<Status> {
    match Status::try_from(raw) {
        Ok(status) => Ok(status),
        Err(_) => bail!("unknown status code on the wire: {}", raw),
    }
}

fn put_short_string(buf: &mut impl BufMut, s: &str) {
    debug_assert!(s.len() <= u16::MAX as usize);
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_short_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    if buf.remaining() < size_of::<u16>() {
        bail!("truncated string length prefix");
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        bail!("string length prefix {} exceeds remaining frame", len);
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    Ok(String::from_utf8(raw)?)
}

fn put_blob(buf: &mut impl BufMut, blob: &Bytes) {
    debug_assert!(blob.len() <= u32::MAX as usize);
    buf.put_u32_le(blob.len() as u32);
    buf.put_slice(blob);
}

fn get_blob(buf: &mut Bytes) -> anyhow::Result<Bytes> {
    if buf.remaining() < size_of::<u32>() {
        bail!("truncated blob length prefix");
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        bail!("blob length prefix {} exceeds remaining frame", len);
    }
    Ok(buf.split_to(len))
}

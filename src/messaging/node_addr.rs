use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut};

/// A node's identity in the cluster. Routing uses only `index`; `generation`
///  disambiguates a node slot that was re-provisioned at the same index, and
///  is checked at handshake and on every send to detect stale addressing.
///
/// A generation of 0 is a wildcard that matches any configured generation.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId {
    pub index: u64,
    pub generation: u64,
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "N{}:{}", self.index, self.generation)
    }
}

impl NodeId {
    pub const WIRE_SIZE: usize = size_of::<u64>() + size_of::<u64>();

    pub fn new(index: u64, generation: u64) -> NodeId {
        NodeId { index, generation }
    }

    /// true iff this id refers to the same node slot as `other`, treating a
    ///  zero generation on either side as a wildcard
    pub fn matches(&self, other: NodeId) -> bool {
        self.index == other.index
            && (self.generation == 0 || other.generation == 0 || self.generation == other.generation)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.index);
        buf.put_u64_le(self.generation);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<NodeId> {
        if buf.remaining() < Self::WIRE_SIZE {
            bail!("truncated node id");
        }
        let index = buf.get_u64_le();
        let generation = buf.get_u64_le();
        Ok(NodeId { index, generation })
    }
}

/// Identity assigned by a server-side sender to an accepted inbound socket.
///  Values are opaque; 0 is reserved as invalid.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ClientId(pub u32);

impl Debug for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "C{}", self.0)
    }
}

impl ClientId {
    pub const INVALID: ClientId = ClientId(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

/// The peer of a connection, fixed for the connection's lifetime.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub enum PeerAddr {
    Server(NodeId),
    Client(ClientId),
}

impl Debug for PeerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerAddr::Server(n) => write!(f, "[{:?}]", n),
            PeerAddr::Client(c) => write!(f, "[{:?}]", c),
        }
    }
}

impl PeerAddr {
    pub fn is_server(&self) -> bool {
        matches!(self, PeerAddr::Server(_))
    }

    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            PeerAddr::Server(n) => Some(*n),
            PeerAddr::Client(_) => None,
        }
    }

    pub fn as_client(&self) -> Option<ClientId> {
        match self {
            PeerAddr::Server(_) => None,
            PeerAddr::Client(c) => Some(*c),
        }
    }
}

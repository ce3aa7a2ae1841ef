use std::fmt::{Display, Formatter};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Status codes observed at the messaging boundary and in the versioned
///  config store. The numeric values are part of the wire format: ACK,
///  STORED and SNAPSHOT_REPLY carry a status as u16.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Status {
    Ok = 0,
    NotInConfig = 1,
    NoBufs = 2,
    Unreachable = 3,
    ProtoNoSupport = 4,
    InvalidCluster = 5,
    DestinationMismatch = 6,
    TimedOut = 7,
    ConnFailed = 8,
    BadMessage = 9,
    Internal = 10,
    Cancelled = 11,
    Shutdown = 12,
    /// connect() on a connection that is already handshaken
    IsConn = 13,
    /// connect() on a connection that is still connecting or handshaking
    Already = 14,
    /// error-injection outcome: the message is held in flight and never
    ///  transmitted
    Dropped = 15,

    // versioned config store
    NotFound = 100,
    VersionMismatch = 101,
    Access = 102,
    UpToDate = 103,
    Again = 104,
    InvalidParam = 105,
    InvalidConfig = 106,
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

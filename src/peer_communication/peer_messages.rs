use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Error};
use serde::{Deserialize, Serialize};

/// Prefix every peer identifier carries in front of its numeric key
pub const PEER_PREFIX: &str = "n";

/// Uniquely identifies a peer in the ring
///
/// On the wire and as an address token the identifier is written as
/// [`PEER_PREFIX`] followed by the decimal key, e.g. `n10`.
/// The key is also the position of the peer on the ring and the upper bound of
/// the object identifiers it is responsible for.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId {
    key: u64,
}

impl PeerId {
    pub fn new(key: u64) -> Self {
        PeerId { key }
    }

    /// Numeric key of the peer, which determines its ring position
    pub fn key(&self) -> u64 {
        self.key
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PEER_PREFIX, self.key)
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix(PEER_PREFIX)
            .ok_or_else(|| anyhow!("Peer id {:?} does not start with {:?}", s, PEER_PREFIX))?;
        let key = digits
            .parse()
            .map_err(|e| anyhow!("Peer id {:?} has no numeric key: {}", s, e))?;
        Ok(PeerId { key })
    }
}

impl TryFrom<String> for PeerId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerId> for String {
    fn from(peer: PeerId) -> Self {
        peer.to_string()
    }
}

/// Type tag written in front of every frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Join = 0,
    RingInfo = 1,
    Request = 2,
    ObjectStored = 3,
    ObjectRetrieved = 4,
}

impl TryFrom<u8> for MessageKind {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(MessageKind::Join),
            1 => Ok(MessageKind::RingInfo),
            2 => Ok(MessageKind::Request),
            3 => Ok(MessageKind::ObjectStored),
            4 => Ok(MessageKind::ObjectRetrieved),
            unknown => Err(unknown),
        }
    }
}

/// All messages exchanged between coordinator, nodes and client
///
/// Every variant is framed with its own [`MessageKind`] tag and its record is
/// serialized with bincode, see [`codec`](super::codec).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    Join(Join),
    RingInfo(RingInfo),
    Request(Request),
    ObjectStored(ObjectStored),
    ObjectRetrieved(ObjectRetrieved),
}

impl PeerMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            PeerMessage::Join(_) => MessageKind::Join,
            PeerMessage::RingInfo(_) => MessageKind::RingInfo,
            PeerMessage::Request(_) => MessageKind::Request,
            PeerMessage::ObjectStored(_) => MessageKind::ObjectStored,
            PeerMessage::ObjectRetrieved(_) => MessageKind::ObjectRetrieved,
        }
    }
}

/// Sent once by a node to the coordinator at startup
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct Join {
    pub peer_id: PeerId,
}

/// Neighbors of the receiving node, pushed by the coordinator
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct RingInfo {
    pub predecessor: PeerId,
    pub successor: PeerId,
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operation {
    Store,
    Retrieve,
}

/// A client request, relayed by the coordinator and forwarded along the ring unchanged
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct Request {
    pub req_id: u64,
    pub operation: Operation,
    pub object_id: u64,
    pub client_id: u64,
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct ObjectStored {
    pub peer_id: PeerId,
    pub object_id: u64,
    pub client_id: u64,
}

/// Outcome of a retrieval, encoded as `1` (found) or `-1` (not found)
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(try_from = "i32", into = "i32")]
pub enum RetrievalStatus {
    Found,
    NotFound,
}

impl TryFrom<i32> for RetrievalStatus {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RetrievalStatus::Found),
            -1 => Ok(RetrievalStatus::NotFound),
            other => Err(format!("invalid retrieval status {}", other)),
        }
    }
}

impl From<RetrievalStatus> for i32 {
    fn from(status: RetrievalStatus) -> Self {
        match status {
            RetrievalStatus::Found => 1,
            RetrievalStatus::NotFound => -1,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct ObjectRetrieved {
    pub status: RetrievalStatus,
    pub object_id: u64,
}

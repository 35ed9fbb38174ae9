use std::fmt;

use crate::peer_communication::peer_messages::{PeerId, RingInfo};

/// Sorted membership list of the overlay, conceptually circular
///
/// Peers are kept in ascending order of their numeric key at all times.
/// A peer alone in the ring is its own predecessor and successor.
#[derive(Debug, Default, Clone)]
pub struct Ring {
    peers: Vec<PeerId>,
}

/// Outcome of [`Ring::join`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPlan {
    /// Index of the joining peer after insertion
    pub index: usize,
    /// Whether the peer was already a member
    pub rejoined: bool,
    /// Ring updates to push, each peer appears at most once
    pub notifications: Vec<(PeerId, RingInfo)>,
}

impl Ring {
    pub fn new() -> Self {
        Ring::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peers(&self) -> &[PeerId] {
        &self.peers
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.position(peer).is_some()
    }

    /// Peer with the lowest key, the entry point for client requests
    pub fn first(&self) -> Option<PeerId> {
        self.peers.first().copied()
    }

    /// Index of the first entry whose key is not below the key of `peer`
    fn search(&self, peer: PeerId) -> usize {
        self.peers.partition_point(|p| p.key() < peer.key())
    }

    fn position(&self, peer: PeerId) -> Option<usize> {
        let index = self.search(peer);
        (self.peers.get(index) == Some(&peer)).then_some(index)
    }

    /// Inserts `peer` and returns its index, the ring stays sorted by key
    pub fn insert(&mut self, peer: PeerId) -> usize {
        self.peers.push(peer);
        self.peers.sort_by_key(PeerId::key);
        self.search(peer)
    }

    /// Predecessor and successor of the entry at `index`, with wrap-around
    pub fn neighbors(&self, index: usize) -> Option<RingInfo> {
        let n = self.peers.len();
        if index >= n {
            return None;
        }
        Some(RingInfo {
            predecessor: self.peers[(index + n - 1) % n],
            successor: self.peers[(index + 1) % n],
        })
    }

    pub fn neighbors_of(&self, peer: PeerId) -> Option<RingInfo> {
        self.neighbors(self.position(peer)?)
    }

    /// Adds `peer` and computes which peers must learn about their new neighbors
    ///
    /// Notifications go to
    /// - the joining peer itself
    /// - its predecessor, unless that is the joining peer
    /// - its successor, unless that is the joining peer or the predecessor
    ///
    /// The neighbors of predecessor and successor are computed against the updated ring.
    /// A peer that is already a member is not inserted twice, it is only sent its current neighbors.
    pub fn join(&mut self, peer: PeerId) -> JoinPlan {
        if let Some(index) = self.position(peer) {
            let notifications = self
                .neighbors(index)
                .map(|info| vec![(peer, info)])
                .unwrap_or_default();
            return JoinPlan {
                index,
                rejoined: true,
                notifications,
            };
        }

        let index = self.insert(peer);
        let mut notifications = Vec::with_capacity(3);
        if let Some(info) = self.neighbors(index) {
            notifications.push((peer, info));
            if info.predecessor != peer {
                if let Some(predecessor_info) = self.neighbors_of(info.predecessor) {
                    notifications.push((info.predecessor, predecessor_info));
                }
            }
            if info.successor != peer && info.successor != info.predecessor {
                if let Some(successor_info) = self.neighbors_of(info.successor) {
                    notifications.push((info.successor, successor_info));
                }
            }
        }
        JoinPlan {
            index,
            rejoined: false,
            notifications,
        }
    }
}

impl fmt::Display for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, peer) in self.peers.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", peer)?;
        }
        write!(f, "]")
    }
}

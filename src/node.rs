//! A node of the ring
//!
//! A node owns every object whose identifier is not above its own key (and not owned by a node
//! with a lower key). Requests it is not responsible for are forwarded unchanged to its successor,
//! until they reach the first node with a key at least as large as the object identifier.
//!
//! The node with the highest key additionally owns every identifier above all keys.
//! It recognizes itself by a successor whose key is not larger than its own,
//! so requests for such objects end there instead of circling the ring forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::node::object_log::{ObjectLog, ObjectRecord};
use crate::peer_communication::peer_messages::{
    Join, ObjectRetrieved, ObjectStored, Operation, PeerId, PeerMessage, Request,
    RetrievalStatus, RingInfo,
};
use crate::peer_communication::Communicator;

pub mod object_log;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    /// No ring update received yet
    Unjoined,
    /// Knows its neighbors
    Joined,
    /// Has handled at least one request
    Active,
}

/// What a node did with a request
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Routing {
    Stored,
    Found,
    NotFound,
    Forwarded(PeerId),
}

#[derive(Clone)]
pub struct Node {
    state: Arc<NodeState>,
}

struct NodeState {
    peer_id: PeerId,
    /// Address token of the coordinator, which receives joins and results
    coordinator: String,
    /// Unset until the first ring update arrives
    links: RwLock<Option<RingInfo>>,
    active: AtomicBool,
    object_log: ObjectLog,
    communicator: Arc<Communicator>,
}

impl Node {
    pub fn new(
        peer_id: PeerId,
        coordinator: impl Into<String>,
        object_log: ObjectLog,
        communicator: Arc<Communicator>,
    ) -> Self {
        Node {
            state: Arc::new(NodeState {
                peer_id,
                coordinator: coordinator.into(),
                links: RwLock::new(None),
                active: AtomicBool::new(false),
                object_log,
                communicator,
            }),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.state.peer_id
    }

    pub fn object_log(&self) -> &ObjectLog {
        &self.state.object_log
    }

    /// Announces this node to the coordinator, waits until the coordinator is reachable
    pub async fn join(&self) -> Result<()> {
        info!(
            "{}: Joining ring via {}",
            self.state.peer_id, self.state.coordinator
        );
        self.state
            .communicator
            .send(
                &self.state.coordinator,
                &PeerMessage::Join(Join {
                    peer_id: self.state.peer_id,
                }),
            )
            .await
    }

    /// Replaces predecessor and successor, the latest update always wins
    pub fn update_links(&self, ring_info: RingInfo) {
        *self.state.links.write() = Some(ring_info);
        info!(
            "{}: Predecessor: {}, Successor: {}",
            self.state.peer_id, ring_info.predecessor, ring_info.successor
        );
    }

    pub fn links(&self) -> Option<RingInfo> {
        *self.state.links.read()
    }

    pub fn status(&self) -> NodeStatus {
        if self.state.active.load(Ordering::Relaxed) {
            NodeStatus::Active
        } else if self.links().is_some() {
            NodeStatus::Joined
        } else {
            NodeStatus::Unjoined
        }
    }

    /// Whether `object_id` belongs to this node, given its current neighbors
    fn is_responsible_for(&self, object_id: u64, links: Option<RingInfo>) -> bool {
        let key = self.state.peer_id.key();
        object_id <= key || links.map_or(false, |links| links.successor.key() <= key)
    }

    /// Stores the object locally if this node is responsible, forwards the request otherwise
    ///
    /// After storing, an `ObjectStored` message is sent to the coordinator.
    pub async fn store(&self, request: Request) -> Result<Routing> {
        let links = self.links();
        if !self.is_responsible_for(request.object_id, links) {
            return self.forward(request, links);
        }

        let record = ObjectRecord {
            client_id: request.client_id,
            object_id: request.object_id,
        };
        self.state.object_log.append(record).await?;
        info!(
            "{}: Stored object {} of client {}",
            self.state.peer_id, request.object_id, request.client_id
        );
        if log::log_enabled!(log::Level::Debug) {
            match self.state.object_log.records().await {
                Ok(entries) => {
                    for entry in entries {
                        debug!("{}:   {}", self.state.peer_id, entry);
                    }
                }
                Err(e) => warn!("{}: Cannot list stored objects: {:#}", self.state.peer_id, e),
            }
        }

        self.reply(PeerMessage::ObjectStored(ObjectStored {
            peer_id: self.state.peer_id,
            object_id: request.object_id,
            client_id: request.client_id,
        }));
        self.mark_active();
        Ok(Routing::Stored)
    }

    /// Looks the object up locally if this node is responsible, forwards the request otherwise
    ///
    /// The coordinator receives `ObjectRetrieved` with status found or not found.
    pub async fn retrieve(&self, request: Request) -> Result<Routing> {
        let links = self.links();
        if !self.is_responsible_for(request.object_id, links) {
            return self.forward(request, links);
        }

        let record = ObjectRecord {
            client_id: request.client_id,
            object_id: request.object_id,
        };
        let (status, routing) = if self.state.object_log.contains(record).await? {
            (RetrievalStatus::Found, Routing::Found)
        } else {
            (RetrievalStatus::NotFound, Routing::NotFound)
        };
        info!(
            "{}: Retrieval of object {} for client {}: {:?}",
            self.state.peer_id, request.object_id, request.client_id, status
        );
        self.reply(PeerMessage::ObjectRetrieved(ObjectRetrieved {
            status,
            object_id: request.object_id,
        }));
        self.mark_active();
        Ok(routing)
    }

    fn forward(&self, request: Request, links: Option<RingInfo>) -> Result<Routing> {
        let successor = links.map(|links| links.successor).ok_or_else(|| {
            anyhow!(
                "{}: No successor known yet, cannot forward request {} for object {}",
                self.state.peer_id,
                request.req_id,
                request.object_id
            )
        })?;
        debug!(
            "{}: Forwarding request {} for object {} to {}",
            self.state.peer_id, request.req_id, request.object_id, successor
        );
        self.state
            .communicator
            .spawn_send(successor.to_string(), PeerMessage::Request(request));
        self.mark_active();
        Ok(Routing::Forwarded(successor))
    }

    fn mark_active(&self) {
        self.state.active.store(true, Ordering::Relaxed);
    }

    fn reply(&self, message: PeerMessage) {
        self.state
            .communicator
            .spawn_send(self.state.coordinator.clone(), message);
    }

    pub async fn handle(&self, message: PeerMessage) -> Result<()> {
        match message {
            PeerMessage::RingInfo(ring_info) => self.update_links(ring_info),
            PeerMessage::Request(request) => {
                match request.operation {
                    Operation::Store => self.store(request).await?,
                    Operation::Retrieve => self.retrieve(request).await?,
                };
            }
            other @ (PeerMessage::Join(_)
            | PeerMessage::ObjectStored(_)
            | PeerMessage::ObjectRetrieved(_)) => {
                return Err(anyhow!(
                    "{}: Nodes do not handle {:?} messages",
                    self.state.peer_id,
                    other.kind()
                ));
            }
        }
        Ok(())
    }

    /// Handles inbound messages one at a time until the queue closes or `cancellation_token` is cancelled
    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<PeerMessage>,
        cancellation_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                message = inbound.recv() => {
                    match message {
                        Some(message) => {
                            if let Err(e) = self.handle(message).await {
                                error!("{:#}", e);
                            }
                        }
                        None => break,
                    }
                }
                _ = cancellation_token.cancelled() => break,
            }
        }
        debug!("{}: Stopped handling messages", self.state.peer_id);
    }
}

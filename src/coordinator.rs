//! The coordinator keeps track of ring membership and relays client traffic
//!
//! Nodes announce themselves with a [`Join`](crate::peer_communication::peer_messages::Join),
//! the coordinator inserts them into the [`Ring`] and pushes [`RingInfo`] updates to every node
//! whose neighbors changed.
//! Client requests enter the ring at the node with the lowest key, results are relayed back to
//! the single client address the coordinator was configured with.
//!
//! Ring updates for one node are delivered in the order the ring changed:
//! each node has its own outbox, drained by one worker over one connection.
//! Delivery is not acknowledged, a node that misses an update keeps stale neighbors.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::coordinator::ring::{JoinPlan, Ring};
use crate::peer_communication::peer_messages::{
    ObjectRetrieved, ObjectStored, PeerId, PeerMessage, Request, RingInfo,
};
use crate::peer_communication::Communicator;

pub mod ring;

#[derive(Clone)]
pub struct Coordinator {
    state: Arc<CoordinatorState>,
}

struct CoordinatorState {
    ring: Mutex<Ring>,
    communicator: Arc<Communicator>,
    /// Address token all results are relayed to
    client_address: String,
    outboxes: DashMap<PeerId, Outbox>,
}

/// Ordered queue of ring updates for a single node
struct Outbox {
    queue: mpsc::UnboundedSender<RingInfo>,
    worker: JoinHandle<()>,
}

impl Coordinator {
    pub fn new(communicator: Arc<Communicator>, client_address: impl Into<String>) -> Self {
        Coordinator {
            state: Arc::new(CoordinatorState {
                ring: Mutex::new(Ring::new()),
                communicator,
                client_address: client_address.into(),
                outboxes: DashMap::new(),
            }),
        }
    }

    /// Inserts `peer` into the ring and notifies every node whose neighbors changed
    ///
    /// Notifications are queued while the ring is locked, so concurrent registrations
    /// reach each node in the same order they were applied to the ring.
    /// Sending happens in the background.
    pub fn register_peer(&self, peer: PeerId) -> JoinPlan {
        let mut ring = self.state.ring.lock();
        let plan = ring.join(peer);
        if plan.rejoined {
            warn!("{} registered again, resending its neighbors", peer);
        }
        info!("Ring: {}", ring);
        for (target, ring_info) in &plan.notifications {
            self.enqueue_ring_info(*target, *ring_info);
        }
        plan
    }

    /// Peer with the lowest key, `None` while no node has joined
    pub fn first_peer(&self) -> Option<PeerId> {
        self.state.ring.lock().first()
    }

    /// Snapshot of the current membership, sorted by key
    pub fn members(&self) -> Vec<PeerId> {
        self.state.ring.lock().peers().to_vec()
    }

    pub fn neighbors_of(&self, peer: PeerId) -> Option<RingInfo> {
        self.state.ring.lock().neighbors_of(peer)
    }

    fn enqueue_ring_info(&self, target: PeerId, ring_info: RingInfo) {
        let outbox = self
            .state
            .outboxes
            .entry(target)
            .or_insert_with(|| self.spawn_outbox(target));
        if outbox.queue.send(ring_info).is_err() {
            error!("Outbox of {} is closed, dropping ring update", target);
        }
    }

    fn spawn_outbox(&self, target: PeerId) -> Outbox {
        let (queue, mut pending) = mpsc::unbounded_channel::<RingInfo>();
        let communicator = self.state.communicator.clone();
        let worker = tokio::spawn(async move {
            let address = target.to_string();
            while let Some(ring_info) = pending.recv().await {
                match communicator
                    .send(&address, &PeerMessage::RingInfo(ring_info))
                    .await
                {
                    Ok(()) => debug!(
                        "Sent {} its neighbors {} and {}",
                        target, ring_info.predecessor, ring_info.successor
                    ),
                    Err(e) => warn!("Failed to send ring update to {}: {:#}", target, e),
                }
            }
        });
        Outbox { queue, worker }
    }

    /// Forwards a client request unchanged to the node with the lowest key
    pub fn relay_request(&self, request: Request) -> Result<JoinHandle<()>> {
        let first_peer = self.first_peer().ok_or_else(|| {
            anyhow!(
                "No node has joined yet, dropping request {} of client {}",
                request.req_id,
                request.client_id
            )
        })?;
        debug!(
            "Relaying request {} of client {} to {}",
            request.req_id, request.client_id, first_peer
        );
        Ok(self
            .state
            .communicator
            .spawn_send(first_peer.to_string(), PeerMessage::Request(request)))
    }

    /// Relays a result to the client
    pub fn relay_result(&self, message: PeerMessage) -> Result<JoinHandle<()>> {
        let message = match message {
            PeerMessage::ObjectStored(stored) => PeerMessage::ObjectStored(ObjectStored {
                peer_id: stored.peer_id,
                object_id: stored.object_id,
                client_id: stored.client_id,
            }),
            PeerMessage::ObjectRetrieved(retrieved) => {
                PeerMessage::ObjectRetrieved(ObjectRetrieved {
                    status: retrieved.status,
                    object_id: retrieved.object_id,
                })
            }
            other => return Err(anyhow!("{:?} is not a result", other.kind())),
        };
        debug!(
            "Relaying {:?} to {}",
            message.kind(),
            self.state.client_address
        );
        Ok(self
            .state
            .communicator
            .spawn_send(self.state.client_address.clone(), message))
    }

    pub fn handle(&self, message: PeerMessage) -> Result<()> {
        match message {
            PeerMessage::Join(join) => {
                self.register_peer(join.peer_id);
            }
            PeerMessage::Request(request) => {
                self.relay_request(request)?;
            }
            result @ (PeerMessage::ObjectStored(_) | PeerMessage::ObjectRetrieved(_)) => {
                self.relay_result(result)?;
            }
            PeerMessage::RingInfo(ring_info) => {
                return Err(anyhow!(
                    "Coordinator does not accept ring updates, got {:?}",
                    ring_info
                ));
            }
        }
        Ok(())
    }

    /// Handles inbound messages until the queue closes or `cancellation_token` is cancelled
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
                            if let Err(e) = self.handle(message) {
                                error!("Coordinator: {:#}", e);
                            }
                        }
                        None => break,
                    }
                }
                _ = cancellation_token.cancelled() => break,
            }
        }
        self.shutdown();
    }

    /// Stops all outbox workers, queued ring updates are discarded
    pub fn shutdown(&self) {
        for outbox in self.state.outboxes.iter() {
            outbox.worker.abort();
        }
        self.state.outboxes.clear();
    }
}

//! Client side: requests go to the coordinator, results come back relayed by it

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::{error, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::peer_communication::peer_messages::{
    ObjectRetrieved, ObjectStored, Operation, PeerId, PeerMessage, Request, RetrievalStatus,
};
use crate::peer_communication::Communicator;

/// A result relayed to the client
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Reply {
    Stored { peer_id: PeerId, object_id: u64 },
    Retrieved { object_id: u64 },
    NotFound { object_id: u64 },
}

/// Request a scripted client issues for a test case selector
///
/// - 3: store object 65
/// - 4: retrieve object 66
/// - 5: retrieve object 110, which is above every node key
pub fn scripted_request(testcase: u32) -> Option<(Operation, u64)> {
    match testcase {
        3 => Some((Operation::Store, 65)),
        4 => Some((Operation::Retrieve, 66)),
        5 => Some((Operation::Retrieve, 110)),
        _ => None,
    }
}

#[derive(Clone)]
pub struct Client {
    state: Arc<ClientState>,
}

struct ClientState {
    client_id: u64,
    coordinator: String,
    /// Request ids increase monotonically, starting at 1
    next_req_id: AtomicU64,
    communicator: Arc<Communicator>,
}

impl Client {
    pub fn new(
        client_id: u64,
        coordinator: impl Into<String>,
        communicator: Arc<Communicator>,
    ) -> Self {
        Client {
            state: Arc::new(ClientState {
                client_id,
                coordinator: coordinator.into(),
                next_req_id: AtomicU64::new(1),
                communicator,
            }),
        }
    }

    pub fn client_id(&self) -> u64 {
        self.state.client_id
    }

    pub async fn store(&self, object_id: u64) -> Result<Request> {
        self.request(Operation::Store, object_id).await
    }

    pub async fn retrieve(&self, object_id: u64) -> Result<Request> {
        self.request(Operation::Retrieve, object_id).await
    }

    /// Sends a new request to the coordinator and returns it
    pub async fn request(&self, operation: Operation, object_id: u64) -> Result<Request> {
        let request = Request {
            req_id: self.state.next_req_id.fetch_add(1, Ordering::SeqCst),
            operation,
            object_id,
            client_id: self.state.client_id,
        };
        info!(
            "Client {}: Request {} to {:?} object {}",
            self.state.client_id, request.req_id, operation, object_id
        );
        self.state
            .communicator
            .send(&self.state.coordinator, &PeerMessage::Request(request))
            .await?;
        Ok(request)
    }

    pub fn handle(&self, message: PeerMessage) -> Result<Reply> {
        let reply = match message {
            PeerMessage::ObjectStored(ObjectStored {
                peer_id, object_id, ..
            }) => {
                info!("STORED: {} (on {})", object_id, peer_id);
                Reply::Stored { peer_id, object_id }
            }
            PeerMessage::ObjectRetrieved(ObjectRetrieved {
                status: RetrievalStatus::Found,
                object_id,
            }) => {
                info!("RETRIEVED: {}", object_id);
                Reply::Retrieved { object_id }
            }
            PeerMessage::ObjectRetrieved(ObjectRetrieved {
                status: RetrievalStatus::NotFound,
                object_id,
            }) => {
                info!("NOT FOUND: {}", object_id);
                Reply::NotFound { object_id }
            }
            other => {
                return Err(anyhow!(
                    "Client {} does not handle {:?} messages",
                    self.state.client_id,
                    other.kind()
                ))
            }
        };
        Ok(reply)
    }

    /// Handles replies until the queue closes or `cancellation_token` is cancelled
    ///
    /// Every reply is passed on to `replies`, if given.
    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<PeerMessage>,
        replies: Option<mpsc::Sender<Reply>>,
        cancellation_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                message = inbound.recv() => {
                    let Some(message) = message else { break };
                    match self.handle(message) {
                        Ok(reply) => {
                            if let Some(replies) = &replies {
                                let _ = replies.send(reply).await;
                            }
                        }
                        Err(e) => error!("{:#}", e),
                    }
                }
                _ = cancellation_token.cancelled() => break,
            }
        }
    }
}

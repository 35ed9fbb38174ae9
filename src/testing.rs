//! Shared test helpers and tests running a whole ring over local TCP connections

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::peer_communication::peer_messages::PeerMessage;
use crate::peer_communication::{codec, Communicator, Dial, PeerStream};

/// Path in the temp directory unique to this test process, any file left there is removed
pub(crate) fn temp_log_path(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("ring_dht_{}_{}", std::process::id(), name));
    let _ = std::fs::remove_file(&path);
    path
}

/// Dialer whose connections decode every frame written to them and record it with its destination
struct RecordingDialer {
    sender: mpsc::UnboundedSender<(String, PeerMessage)>,
}

#[async_trait]
impl Dial for RecordingDialer {
    async fn dial(&self, address: &str) -> io::Result<PeerStream> {
        let (writer, mut reader) = tokio::io::duplex(64 * 1024);
        let sender = self.sender.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            while let Ok(message) = codec::read_frame(&mut reader).await {
                if sender.send((address.clone(), message)).is_err() {
                    break;
                }
            }
        });
        Ok(Box::new(writer))
    }
}

/// Messages sent through a [`recording_communicator`], in order per destination
pub(crate) struct RecordedMessages {
    receiver: mpsc::UnboundedReceiver<(String, PeerMessage)>,
}

impl RecordedMessages {
    /// Waits for the next `amount` messages, panics if they do not arrive in time
    pub(crate) async fn take(&mut self, amount: usize) -> Vec<(String, PeerMessage)> {
        let mut messages = Vec::with_capacity(amount);
        while messages.len() < amount {
            match timeout(Duration::from_secs(5), self.receiver.recv()).await {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => panic!("Recording stopped after {} messages", messages.len()),
                Err(_) => panic!(
                    "Timed out after {} of {} messages: {:?}",
                    messages.len(),
                    amount,
                    messages
                ),
            }
        }
        messages
    }
}

/// Communicator that never touches the network
pub(crate) fn recording_communicator() -> (Arc<Communicator>, RecordedMessages) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let communicator = Communicator::new(RecordingDialer { sender }, Duration::from_millis(10));
    (Arc::new(communicator), RecordedMessages { receiver })
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use env_logger::Env;
    use log::info;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};
    use tokio_util::sync::CancellationToken;

    use crate::client::{Client, Reply};
    use crate::coordinator::Coordinator;
    use crate::node::object_log::{ObjectLog, ObjectRecord};
    use crate::node::{Node, NodeStatus};
    use crate::peer_communication::peer_messages::{PeerId, PeerMessage};
    use crate::peer_communication::{start_listener, AddressBook, Communicator};

    use super::temp_log_path;

    const COORDINATOR: &str = "bootstrap";
    const CLIENT: &str = "client";
    const CLIENT_ID: u64 = 1;

    /// Coordinator, client and nodes, each with its own listener on a random local port
    struct Cluster {
        address_book: Arc<AddressBook>,
        cancellation_token: CancellationToken,
        coordinator: Coordinator,
        client: Client,
        replies: mpsc::Receiver<Reply>,
        nodes: Vec<Node>,
        name: String,
    }

    fn init_logging() {
        let _ = env_logger::Builder::from_env(Env::default().default_filter_or("debug"))
            .is_test(true)
            .try_init();
    }

    fn communicator(address_book: &Arc<AddressBook>) -> Arc<Communicator> {
        Arc::new(Communicator::over_tcp(
            address_book.clone(),
            Duration::from_millis(20),
        ))
    }

    /// Binds a listener for `token` and makes it reachable through the address book
    async fn listen(
        address_book: &AddressBook,
        token: &str,
        cancellation_token: &CancellationToken,
    ) -> mpsc::Receiver<PeerMessage> {
        let (sender, receiver) = mpsc::channel(64);
        let (address, _) = start_listener(
            "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
            sender,
            cancellation_token.clone(),
        )
        .await
        .unwrap();
        address_book.insert(token, address);
        receiver
    }

    impl Cluster {
        async fn start(name: &str) -> Cluster {
            init_logging();
            let address_book = Arc::new(AddressBook::default());
            let cancellation_token = CancellationToken::new();

            let inbound = listen(&address_book, COORDINATOR, &cancellation_token).await;
            let coordinator = Coordinator::new(communicator(&address_book), CLIENT);
            tokio::spawn(coordinator.clone().run(inbound, cancellation_token.clone()));

            let inbound = listen(&address_book, CLIENT, &cancellation_token).await;
            let client = Client::new(CLIENT_ID, COORDINATOR, communicator(&address_book));
            let (reply_sender, replies) = mpsc::channel(16);
            tokio::spawn(client.clone().run(
                inbound,
                Some(reply_sender),
                cancellation_token.clone(),
            ));

            Cluster {
                address_book,
                cancellation_token,
                coordinator,
                client,
                replies,
                nodes: Vec::new(),
                name: name.to_string(),
            }
        }

        /// Starts a node and announces it, without waiting for its ring update
        async fn spawn_node(&self, key: u64) -> Node {
            let peer_id = PeerId::new(key);
            let inbound = listen(
                &self.address_book,
                &peer_id.to_string(),
                &self.cancellation_token,
            )
            .await;
            let node = Node::new(
                peer_id,
                COORDINATOR,
                ObjectLog::new(temp_log_path(&format!("{}_{}", self.name, peer_id))),
                communicator(&self.address_book),
            );
            tokio::spawn(node.clone().run(inbound, self.cancellation_token.clone()));
            node.join().await.unwrap();
            node
        }

        async fn with_nodes(name: &str, keys: &[u64]) -> Cluster {
            let mut cluster = Cluster::start(name).await;
            for key in keys {
                let node = cluster.spawn_node(*key).await;
                cluster.nodes.push(node);
            }
            cluster.await_stable_ring().await;
            cluster
        }

        /// Waits until every node knows the neighbors the coordinator has for it
        async fn await_stable_ring(&self) {
            let stable = async {
                loop {
                    let settled = self.coordinator.members().len() == self.nodes.len()
                        && self.nodes.iter().all(|node| {
                            node.links() == self.coordinator.neighbors_of(node.peer_id())
                        });
                    if settled {
                        break;
                    }
                    sleep(Duration::from_millis(10)).await;
                }
            };
            timeout(Duration::from_secs(10), stable)
                .await
                .expect("Ring did not stabilize");
            info!("Ring is stable: {:?}", self.coordinator.members());
        }

        fn node(&self, key: u64) -> &Node {
            self.nodes
                .iter()
                .find(|node| node.peer_id().key() == key)
                .unwrap()
        }

        async fn next_reply(&mut self) -> Reply {
            timeout(Duration::from_secs(10), self.replies.recv())
                .await
                .expect("No reply arrived")
                .unwrap()
        }

        fn stop(&self) {
            self.cancellation_token.cancel();
        }
    }

    /// Store of object 25 enters at n10 and is forwarded until n30 keeps it, the client learns where
    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_store_travels_to_responsible_node() {
        let mut cluster = Cluster::with_nodes("store_travels", &[10, 20, 30]).await;

        cluster.client.store(25).await.unwrap();
        assert_eq!(
            cluster.next_reply().await,
            Reply::Stored {
                peer_id: PeerId::new(30),
                object_id: 25
            }
        );

        let record = ObjectRecord {
            client_id: CLIENT_ID,
            object_id: 25,
        };
        assert!(cluster.node(30).object_log().contains(record).await.unwrap());
        assert!(!cluster.node(10).object_log().contains(record).await.unwrap());
        assert!(!cluster.node(20).object_log().contains(record).await.unwrap());
        assert_eq!(cluster.node(10).status(), NodeStatus::Active);
        assert_eq!(cluster.node(30).status(), NodeStatus::Active);
        cluster.stop();
    }

    /// A stored object is found again by the same client
    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_retrieve_stored_object() {
        let mut cluster = Cluster::with_nodes("retrieve_stored", &[10, 20, 30]).await;

        cluster.client.store(15).await.unwrap();
        assert_eq!(
            cluster.next_reply().await,
            Reply::Stored {
                peer_id: PeerId::new(20),
                object_id: 15
            }
        );
        cluster.client.retrieve(15).await.unwrap();
        assert_eq!(
            cluster.next_reply().await,
            Reply::Retrieved { object_id: 15 }
        );
        cluster.stop();
    }

    /// Retrieving an object nobody stored answers not found
    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_retrieve_missing_object() {
        let mut cluster = Cluster::with_nodes("retrieve_missing", &[10, 20, 30]).await;

        cluster.client.retrieve(5).await.unwrap();
        assert_eq!(
            cluster.next_reply().await,
            Reply::NotFound { object_id: 5 }
        );
        cluster.stop();
    }

    /// Objects above every key end at the highest node instead of circling the ring
    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_object_above_every_key() {
        let mut cluster = Cluster::with_nodes("above_every_key", &[10, 20, 30]).await;

        cluster.client.retrieve(110).await.unwrap();
        assert_eq!(
            cluster.next_reply().await,
            Reply::NotFound { object_id: 110 }
        );
        cluster.client.store(110).await.unwrap();
        assert_eq!(
            cluster.next_reply().await,
            Reply::Stored {
                peer_id: PeerId::new(30),
                object_id: 110
            }
        );
        cluster.client.retrieve(110).await.unwrap();
        assert_eq!(
            cluster.next_reply().await,
            Reply::Retrieved { object_id: 110 }
        );
        cluster.stop();
    }

    /// Five nodes joining at once end up sorted, each with the neighbors of the final ring
    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_joins() {
        let mut cluster = Cluster::start("concurrent_joins").await;

        let handles: Vec<_> = [4u64, 2, 5, 1, 3]
            .into_iter()
            .map(|key| {
                let address_book = cluster.address_book.clone();
                let cancellation_token = cluster.cancellation_token.clone();
                let name = cluster.name.clone();
                tokio::spawn(async move {
                    let peer_id = PeerId::new(key);
                    let inbound =
                        listen(&address_book, &peer_id.to_string(), &cancellation_token).await;
                    let node = Node::new(
                        peer_id,
                        COORDINATOR,
                        ObjectLog::new(temp_log_path(&format!("{}_{}", name, peer_id))),
                        communicator(&address_book),
                    );
                    tokio::spawn(node.clone().run(inbound, cancellation_token));
                    node.join().await.unwrap();
                    node
                })
            })
            .collect();
        for handle in handles {
            let node = handle.await.unwrap();
            cluster.nodes.push(node);
        }
        cluster.await_stable_ring().await;

        assert_eq!(
            cluster.coordinator.members(),
            (1..=5).map(PeerId::new).collect::<Vec<_>>()
        );
        assert_eq!(cluster.coordinator.first_peer(), Some(PeerId::new(1)));

        cluster.client.store(4).await.unwrap();
        assert_eq!(
            cluster.next_reply().await,
            Reply::Stored {
                peer_id: PeerId::new(4),
                object_id: 4
            }
        );
        cluster.stop();
    }

    /// A lone node is its own neighbor and owns every object
    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_single_node_ring() {
        let mut cluster = Cluster::with_nodes("single_node", &[7]).await;

        assert_eq!(
            cluster.node(7).links().map(|links| links.successor),
            Some(PeerId::new(7))
        );
        cluster.client.store(3).await.unwrap();
        cluster.client.store(70).await.unwrap();
        let mut stored = vec![cluster.next_reply().await, cluster.next_reply().await];
        stored.sort_by_key(|reply| match reply {
            Reply::Stored { object_id, .. } => *object_id,
            other => panic!("Unexpected reply {:?}", other),
        });
        assert_eq!(
            stored,
            vec![
                Reply::Stored {
                    peer_id: PeerId::new(7),
                    object_id: 3
                },
                Reply::Stored {
                    peer_id: PeerId::new(7),
                    object_id: 70
                },
            ]
        );
        cluster.stop();
    }
}

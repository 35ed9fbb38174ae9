//! Connection management between coordinator, nodes and client
//!
//! Every process keeps at most one outbound connection per peer address, which is dialed lazily on
//! the first [`Communicator::send`] and reused afterwards.
//! Inbound connections are accepted by [`start_listener`], every connection is served by its own
//! task decoding frames onto a shared queue.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::peer_communication::codec::CodecError;
use crate::peer_communication::peer_messages::PeerMessage;

pub mod codec;
pub mod peer_messages;

/// Port every process listens on unless configured otherwise
pub const DEFAULT_PEER_PORT: u16 = 8888;

/// Delay between two connection attempts to an unreachable peer
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Maps address tokens (`bootstrap`, `client`, `n10`, ...) to something we can dial
///
/// Tokens are host names reachable on the well-known peer port,
/// unless an explicit socket address has been registered for them.
pub struct AddressBook {
    peer_port: u16,
    overrides: DashMap<String, SocketAddr>,
}

impl AddressBook {
    pub fn new(peer_port: u16) -> Self {
        AddressBook {
            peer_port,
            overrides: DashMap::new(),
        }
    }

    pub fn insert(&self, token: impl Into<String>, address: SocketAddr) {
        self.overrides.insert(token.into(), address);
    }

    pub fn resolve(&self, token: &str) -> String {
        match self.overrides.get(token) {
            Some(address) => address.value().to_string(),
            None => format!("{}:{}", token, self.peer_port),
        }
    }
}

impl Default for AddressBook {
    fn default() -> Self {
        AddressBook::new(DEFAULT_PEER_PORT)
    }
}

/// Write side of an outbound connection
pub type PeerStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens outbound connections
#[async_trait]
pub trait Dial: Send + Sync {
    /// A single connection attempt, retrying is left to the [`Communicator`]
    async fn dial(&self, address: &str) -> std::io::Result<PeerStream>;
}

pub struct TcpDialer {
    address_book: Arc<AddressBook>,
}

impl TcpDialer {
    pub fn new(address_book: Arc<AddressBook>) -> Self {
        TcpDialer { address_book }
    }
}

#[async_trait]
impl Dial for TcpDialer {
    async fn dial(&self, address: &str) -> std::io::Result<PeerStream> {
        let stream = TcpStream::connect(self.address_book.resolve(address)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// The stream lock keeps concurrent sends to one peer from interleaving their frames
type Connection = Arc<tokio::sync::Mutex<PeerStream>>;

/// Sends frames to peers over cached outbound connections
pub struct Communicator {
    dialer: Box<dyn Dial>,
    retry_delay: Duration,
    /// Lookups and insertions happen under this lock, dialing and writing never do
    connections: Mutex<HashMap<String, Connection>>,
}

impl Communicator {
    pub fn new(dialer: impl Dial + 'static, retry_delay: Duration) -> Self {
        Communicator {
            dialer: Box::new(dialer),
            retry_delay,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn over_tcp(address_book: Arc<AddressBook>, retry_delay: Duration) -> Self {
        Communicator::new(TcpDialer::new(address_book), retry_delay)
    }

    /// Sends a single message to `to`
    ///
    /// If no connection to `to` is cached, this dials until a connection succeeds and caches it.
    /// There is no deadline: a peer that never becomes reachable blocks this call forever.
    /// If the write fails, the connection is dropped so the next send dials again.
    ///
    /// # Arguments
    ///
    /// * `to` - address token of the receiver
    /// * `message` - the message, framed by [`codec::encode`]
    pub async fn send(&self, to: &str, message: &PeerMessage) -> Result<()> {
        let frame = codec::encode(message)?;
        self.send_frame(to, &frame).await
    }

    /// Writes an already encoded frame to `to`, see [`Communicator::send`]
    pub async fn send_frame(&self, to: &str, frame: &[u8]) -> Result<()> {
        let connection = self.connection(to).await;
        let result = {
            let mut stream = connection.lock().await;
            write_frame(&mut stream, frame).await
        };
        if let Err(e) = result {
            warn!("Failed to send message to {}: {}", to, e);
            self.evict(to, &connection);
            return Err(anyhow!(e).context(format!("Failed to send message to {}", to)));
        }
        trace!("Sent frame of {} bytes to {}", frame.len(), to);
        Ok(())
    }

    /// Sends `message` on its own task, failures are logged instead of returned
    pub fn spawn_send(self: &Arc<Self>, to: impl Into<String>, message: PeerMessage) -> JoinHandle<()> {
        let communicator = self.clone();
        let to = to.into();
        tokio::spawn(async move {
            if let Err(e) = communicator.send(&to, &message).await {
                warn!("Dropped {:?} message to {}: {:#}", message.kind(), to, e);
            }
        })
    }

    /// Whether an outbound connection to `to` is currently cached
    pub fn is_connected(&self, to: &str) -> bool {
        self.connections.lock().contains_key(to)
    }

    async fn connection(&self, to: &str) -> Connection {
        if let Some(connection) = self.connections.lock().get(to) {
            return connection.clone();
        }
        let stream = self.dial_until_connected(to).await;
        let connection = Arc::new(tokio::sync::Mutex::new(stream));
        // Another send may have connected in the meantime, in that case its connection wins
        self.connections
            .lock()
            .entry(to.to_string())
            .or_insert(connection)
            .clone()
    }

    async fn dial_until_connected(&self, to: &str) -> PeerStream {
        let mut attempt: u64 = 1;
        loop {
            match self.dialer.dial(to).await {
                Ok(stream) => {
                    debug!("Connected to {} after {} attempt(s)", to, attempt);
                    return stream;
                }
                Err(e) => {
                    debug!("Cannot connect to {} (attempt {}): {}", to, attempt, e);
                    attempt += 1;
                    sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Removes `connection` from the cache, unless it has already been replaced
    fn evict(&self, to: &str, connection: &Connection) {
        let mut connections = self.connections.lock();
        if let Some(cached) = connections.get(to) {
            if Arc::ptr_eq(cached, connection) {
                connections.remove(to);
            }
        }
    }
}

async fn write_frame(stream: &mut PeerStream, frame: &[u8]) -> std::io::Result<()> {
    stream.write_all(frame).await?;
    stream.flush().await
}

/// Binds the server socket and starts accepting peer connections
///
/// Every accepted connection is served on its own task, which decodes frames and publishes them to
/// `inbound` until the connection fails, a frame cannot be decoded or `inbound` is closed.
/// Returns the bound address (useful when binding port 0) and the handle of the accept loop.
///
/// # Arguments
///
/// * `address` - the address on which the server will be found
/// * `inbound` - queue receiving every decoded message
/// * `cancellation_token` - if this token is cancelled, no new connections are accepted and open connections are closed
pub async fn start_listener(
    address: SocketAddr,
    inbound: mpsc::Sender<PeerMessage>,
    cancellation_token: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("Failed to bind server socket on {}", address))?;
    let local_address = listener.local_addr()?;
    info!("Listening for peers on {}", local_address);

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote)) => {
                            trace!("{}: Accepted connection from {}", local_address, remote);
                            let inbound = inbound.clone();
                            let cancellation_token = cancellation_token.clone();
                            tokio::spawn(async move {
                                receive_frames(stream, remote, inbound, cancellation_token).await;
                            });
                        }
                        Err(e) => {
                            warn!("{}: Failed to accept connection: {}", local_address, e);
                        }
                    }
                }
                _ = cancellation_token.cancelled() => {
                    info!("{}: Stopped accepting new peer connections.", local_address);
                    break;
                }
            }
        }
    });
    Ok((local_address, handle))
}

async fn receive_frames(
    mut stream: TcpStream,
    remote: SocketAddr,
    inbound: mpsc::Sender<PeerMessage>,
    cancellation_token: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            result = codec::read_frame(&mut stream) => result,
            _ = cancellation_token.cancelled() => return,
        };
        match result {
            Ok(message) => {
                trace!("Received {:?} from {}", message.kind(), remote);
                if inbound.send(message).await.is_err() {
                    debug!("Inbound queue closed, dropping connection from {}", remote);
                    return;
                }
            }
            Err(CodecError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                debug!("{} closed the connection", remote);
                return;
            }
            Err(e) => {
                warn!("Error in connection from {}: {}", remote, e);
                return;
            }
        }
    }
}

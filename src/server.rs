//! # Negotiation Server
//!
//! Local SOCKS5 endpoint that accepts raw connections and binds each one to
//! a rendezvous hash announced in advance by the stream manager.
//!
//! # Architecture
//!
//! - `NegotiationServer`: public handle (cheap to clone)
//! - `ServerActor`: owns the listener, the pending-hash table and the
//!   claimed connections; processes commands one at a time
//! - one short-lived handshake task per accepted socket, running a
//!   [`Negotiation`] until it either fails or names a hash
//!
//! The registry check, the success reply and the move into the claimed
//! table happen in one actor step. Any command sent after a peer has seen
//! `05 00` therefore finds its socket via [`NegotiationServer::get_connection`].
//!
//! A bad handshake only ever closes its own socket.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::crypto::is_rendezvous_hash;
use crate::socks5::{ConnectionState, Negotiation, Step, AUTH_REJECTED};


// ============================================================================
// Constants
// ============================================================================

/// Time a client gets to finish greeting + request.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Concurrent handshakes in flight. Further sockets are closed on accept.
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;

/// Pending hashes kept before the least recently registered is evicted.
pub const DEFAULT_MAX_PENDING_HASHES: usize = 4096;

/// Events buffered for `poll` before new ones are dropped.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// A single handshake frame never exceeds 257 bytes (greeting with 255
/// methods); anything larger is malformed by construction.
const HANDSHAKE_READ_BUFFER: usize = 512;


// ============================================================================
// Public types
// ============================================================================

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub handshake_timeout: Duration,
    pub max_connections: usize,
    pub max_pending_hashes: usize,
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_pending_hashes: DEFAULT_MAX_PENDING_HASHES,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    NoAcceptableMethod,
    MalformedRequest,
    UnknownHash,
    HandshakeTimeout,
    Capacity,
    Io,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerEvent {
    Accepted { peer: SocketAddr },
    /// A connection completed the handshake and waits to be claimed.
    Bound { hash: String, peer: SocketAddr },
    Rejected { peer: SocketAddr, reason: RejectReason },
}

#[derive(Debug)]
pub enum ServerError {
    Bind(io::Error),
    InvalidHash(String),
    /// The server actor has stopped.
    Closed,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Bind(e) => write!(f, "failed to bind listener: {}", e),
            ServerError::InvalidHash(hash) => write!(f, "not a rendezvous hash: {:?}", hash),
            ServerError::Closed => write!(f, "negotiation server stopped"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind(e) => Some(e),
            _ => None,
        }
    }
}


// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum ServerCommand {
    RegisterHash {
        hash: String,
        reply: oneshot::Sender<Result<(), ServerError>>,
    },
    UnregisterHash {
        hash: String,
        reply: oneshot::Sender<bool>,
    },
    GetConnection {
        hash: String,
        reply: oneshot::Sender<Option<TcpStream>>,
    },
    /// Sent by a handshake task that read a well-formed request.
    Bind {
        hash: String,
        stream: TcpStream,
        negotiation: Negotiation,
        peer: SocketAddr,
    },
    Counts {
        reply: oneshot::Sender<(usize, usize)>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}


// ============================================================================
// NegotiationServer Handle
// ============================================================================

#[derive(Clone)]
pub struct NegotiationServer {
    cmd_tx: mpsc::Sender<ServerCommand>,
    events: Arc<Mutex<mpsc::Receiver<ServerEvent>>>,
    local_addr: SocketAddr,
}

impl fmt::Debug for NegotiationServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiationServer")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl NegotiationServer {
    /// Bind the listener and start accepting.
    pub async fn listen(
        addr: impl ToSocketAddrs,
        config: ServerConfig,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));

        let actor = ServerActor::new(config, cmd_tx.downgrade(), event_tx);
        tokio::spawn(actor.run(listener, cmd_rx));

        info!(addr = %local_addr, "negotiation server listening");

        Ok(Self {
            cmd_tx,
            events: Arc::new(Mutex::new(event_rx)),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Announce that a raw connection bearing `hash` should be accepted.
    pub async fn register_hash(&self, hash: &str) -> Result<(), ServerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ServerCommand::RegisterHash { hash: hash.to_string(), reply: reply_tx })
            .await
            .map_err(|_| ServerError::Closed)?;
        reply_rx.await.map_err(|_| ServerError::Closed)?
    }

    /// Forget `hash`, dropping its connection if one is already bound.
    /// Returns whether anything was removed.
    pub async fn unregister_hash(&self, hash: &str) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ServerCommand::UnregisterHash { hash: hash.to_string(), reply: reply_tx })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Claim the connection bound to `hash`. Succeeds at most once per hash.
    pub async fn get_connection(&self, hash: &str) -> Option<TcpStream> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ServerCommand::GetConnection { hash: hash.to_string(), reply: reply_tx })
            .await
            .ok()?;
        reply_rx.await.ok().flatten()
    }

    /// Wait up to `timeout` for the next server event.
    ///
    /// `Ok(None)` means nothing happened in time; `Err(Closed)` means the
    /// server stopped and no further events will arrive.
    pub async fn poll(&self, timeout: Duration) -> Result<Option<ServerEvent>, ServerError> {
        let mut events = self.events.lock().await;
        match tokio::time::timeout(timeout, events.recv()).await {
            Ok(Some(event)) => Ok(Some(event)),
            Ok(None) => Err(ServerError::Closed),
            Err(_) => Ok(None),
        }
    }

    pub async fn pending_hash_count(&self) -> usize {
        self.counts().await.0
    }

    pub async fn claimed_count(&self) -> usize {
        self.counts().await.1
    }

    async fn counts(&self) -> (usize, usize) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(ServerCommand::Counts { reply: reply_tx }).await.is_err() {
            return (0, 0);
        }
        reply_rx.await.unwrap_or((0, 0))
    }

    /// Close the listener and every connection the server still holds.
    pub async fn stop(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(ServerCommand::Stop { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
    }
}


// ============================================================================
// ServerActor (owns all state)
// ============================================================================

struct ClaimedConnection {
    stream: TcpStream,
    peer: SocketAddr,
    bound_at: Instant,
}

struct ServerActor {
    config: ServerConfig,
    /// Hashes announced by the manager, not yet bound.
    pending: LruCache<String, Instant>,
    /// Connections that completed the handshake, awaiting `get_connection`.
    claimed: HashMap<String, ClaimedConnection>,
    handshakes: JoinSet<()>,
    /// Weak so that dropping every handle stops the actor.
    cmd_tx: mpsc::WeakSender<ServerCommand>,
    event_tx: mpsc::Sender<ServerEvent>,
}

impl ServerActor {
    fn new(
        config: ServerConfig,
        cmd_tx: mpsc::WeakSender<ServerCommand>,
        event_tx: mpsc::Sender<ServerEvent>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.max_pending_hashes).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            pending: LruCache::new(capacity),
            claimed: HashMap::new(),
            handshakes: JoinSet::new(),
            cmd_tx,
            event_tx,
        }
    }

    async fn run(mut self, listener: TcpListener, mut cmd_rx: mpsc::Receiver<ServerCommand>) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd).await.is_break() {
                                break;
                            }
                        }
                        None => {
                            self.shutdown();
                            break;
                        }
                    }
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.on_accept(stream, peer),
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }

                Some(_) = self.handshakes.join_next(), if !self.handshakes.is_empty() => {}
            }
        }
        debug!("negotiation server actor stopped");
    }

    async fn handle_command(&mut self, cmd: ServerCommand) -> ControlFlow<()> {
        match cmd {
            ServerCommand::RegisterHash { hash, reply } => {
                let _ = reply.send(self.register_hash(hash));
            }
            ServerCommand::UnregisterHash { hash, reply } => {
                let removed_pending = self.pending.pop(&hash).is_some();
                let removed_claimed = self.claimed.remove(&hash).is_some();
                if removed_pending || removed_claimed {
                    debug!(hash = %hash, "hash unregistered");
                }
                let _ = reply.send(removed_pending || removed_claimed);
            }
            ServerCommand::GetConnection { hash, reply } => {
                let claimed = self.claimed.remove(&hash);
                match &claimed {
                    Some(conn) => debug!(
                        hash = %hash,
                        peer = %conn.peer,
                        waited_ms = conn.bound_at.elapsed().as_millis() as u64,
                        "connection claimed"
                    ),
                    None => trace!(hash = %hash, "no bound connection for hash"),
                }
                let _ = reply.send(claimed.map(|conn| conn.stream));
            }
            ServerCommand::Bind { hash, stream, negotiation, peer } => {
                self.bind(hash, stream, negotiation, peer).await;
            }
            ServerCommand::Counts { reply } => {
                let _ = reply.send((self.pending.len(), self.claimed.len()));
            }
            ServerCommand::Stop { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn register_hash(&mut self, hash: String) -> Result<(), ServerError> {
        if !is_rendezvous_hash(&hash) {
            return Err(ServerError::InvalidHash(hash));
        }
        if let Some((evicted, _)) = self.pending.push(hash.clone(), Instant::now()) {
            if evicted != hash {
                warn!(hash = %evicted, "pending hash table full, evicted oldest");
            }
        }
        debug!(hash = %hash, "hash registered");
        Ok(())
    }

    fn on_accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.handshakes.len() >= self.config.max_connections {
            warn!(peer = %peer, "too many handshakes in flight, closing connection");
            self.emit(ServerEvent::Rejected { peer, reason: RejectReason::Capacity });
            return;
        }
        trace!(peer = %peer, "connection accepted");
        self.emit(ServerEvent::Accepted { peer });

        self.handshakes.spawn(run_handshake(
            stream,
            peer,
            self.cmd_tx.clone(),
            self.event_tx.clone(),
            self.config.handshake_timeout,
        ));
    }

    async fn bind(
        &mut self,
        hash: String,
        mut stream: TcpStream,
        mut negotiation: Negotiation,
        peer: SocketAddr,
    ) {
        let registered_at = if self.claimed.contains_key(&hash) {
            None
        } else {
            self.pending.pop(&hash)
        };
        let reply = negotiation.resolve(registered_at.is_some());

        if let Err(e) = stream.write_all(&reply).await {
            debug!(peer = %peer, error = %e, "failed to write request reply");
            if let Some(at) = registered_at {
                self.pending.put(hash, at);
            }
            self.emit(ServerEvent::Rejected { peer, reason: RejectReason::Io });
            return;
        }

        if registered_at.is_none() {
            debug!(peer = %peer, hash = %hash, "request for unknown hash");
            self.emit(ServerEvent::Rejected { peer, reason: RejectReason::UnknownHash });
            return;
        }

        debug!(peer = %peer, hash = %hash, "connection bound to hash");
        self.claimed.insert(
            hash.clone(),
            ClaimedConnection {
                stream,
                peer,
                bound_at: Instant::now(),
            },
        );
        self.emit(ServerEvent::Bound { hash, peer });
    }

    fn shutdown(&mut self) {
        self.handshakes.abort_all();
        if !self.claimed.is_empty() {
            debug!(connections = self.claimed.len(), "dropping unclaimed connections");
        }
        self.claimed.clear();
        self.pending.clear();
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.event_tx.try_send(event);
    }
}


// ============================================================================
// Handshake task
// ============================================================================

enum HandshakeEnd {
    Destination(String),
    Rejected(RejectReason),
    Closed,
}

async fn run_handshake(
    mut stream: TcpStream,
    peer: SocketAddr,
    cmd_tx: mpsc::WeakSender<ServerCommand>,
    event_tx: mpsc::Sender<ServerEvent>,
    timeout: Duration,
) {
    let mut negotiation = Negotiation::new();

    let end = match tokio::time::timeout(timeout, drive(&mut stream, &mut negotiation)).await {
        Ok(Ok(end)) => end,
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "handshake I/O error");
            HandshakeEnd::Rejected(RejectReason::Io)
        }
        Err(_) => {
            debug!(peer = %peer, "handshake timed out");
            HandshakeEnd::Rejected(RejectReason::HandshakeTimeout)
        }
    };

    match end {
        HandshakeEnd::Destination(hash) => {
            let Some(cmd_tx) = cmd_tx.upgrade() else {
                return;
            };
            let _ = cmd_tx
                .send(ServerCommand::Bind { hash, stream, negotiation, peer })
                .await;
        }
        HandshakeEnd::Rejected(reason) => {
            negotiation.disconnect();
            let _ = event_tx.try_send(ServerEvent::Rejected { peer, reason });
        }
        HandshakeEnd::Closed => {
            trace!(peer = %peer, "peer closed during handshake");
        }
    }
}

/// Feed each chunk read from the socket to the state machine.
async fn drive(stream: &mut TcpStream, negotiation: &mut Negotiation) -> io::Result<HandshakeEnd> {
    let mut buf = [0u8; HANDSHAKE_READ_BUFFER];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(HandshakeEnd::Closed);
        }
        match negotiation.advance(&buf[..n]) {
            Step::Reply(reply) => {
                stream.write_all(&reply).await?;
                if negotiation.state() == ConnectionState::Disconnected {
                    let reason = if reply == AUTH_REJECTED {
                        RejectReason::NoAcceptableMethod
                    } else {
                        RejectReason::MalformedRequest
                    };
                    return Ok(HandshakeEnd::Rejected(reason));
                }
            }
            Step::Destination(hash) => return Ok(HandshakeEnd::Destination(hash)),
            Step::Ignore => return Ok(HandshakeEnd::Closed),
        }
    }
}

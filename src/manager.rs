//! # Stream Manager
//!
//! Drives the signaling side of SOCKS5 bytestreams and ties every
//! asynchronous exchange back to its session.
//!
//! # Architecture
//!
//! - `StreamManager`: public handle (cheap to clone)
//! - `StreamManagerActor`: owns every bookkeeping map and processes one
//!   command at a time, so cross-map invariants are never seen half-updated
//!
//! | Map | Key | Lifetime |
//! |-----|-----|----------|
//! | `pending` | sid | offer sent/received -> terminal success or failure |
//! | `correlations` | stanza id | request sent -> matching result/error |
//! | `sessions` | sid | relay connected -> dispose/take |
//! | `hashes` | sid | hash registered with the local server -> claimed/disposed |
//!
//! A sid is in `pending` or in `sessions`, never both.
//!
//! # Flows
//!
//! ```text
//! Initiator                                   Target
//! offer_stream ── Set/Query(sid, hosts) ────▶ incoming_offer (handler)
//!                                             accept_offer: relay connects to hosts
//!              ◀── Result/StreamHostUsed ──── (echoes the offer's id)
//! self chosen:  claim from local server, active
//! proxy chosen: relay connects, then
//!              ── Set/Activate ──▶ proxy
//!              ◀── Result ──────── proxy      active
//! ```
//!
//! The self-proxy branch exists because the raw connection carries only the
//! rendezvous hash; the initiator finds it by recomputing
//! `sha1(sid || own || peer)` and claiming it from its [`NegotiationServer`].

use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::crypto::{generate_sid, rendezvous_hash, CryptoError};
use crate::identity::Jid;
use crate::messages::{Iq, IqPayload, IqType, StanzaError, StreamError, StreamHost, StreamMode};
use crate::protocols::{
    Direction, IncomingOffer, RelayConnector, RelaySession, SignalingTransport, StreamHandler,
};
use crate::relay::{RelayError, Socks5Connector};
use crate::server::NegotiationServer;


// ============================================================================
// Constants and configuration
// ============================================================================

/// How long a negotiation may wait on the peer before it is failed.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval of the sweep that enforces `negotiation_timeout`.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub negotiation_timeout: Duration,
    pub cleanup_interval: Duration,
    /// The only transport mode accepted in offers.
    pub mode: StreamMode,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            mode: StreamMode::Tcp,
        }
    }
}


// ============================================================================
// Errors
// ============================================================================

/// Synchronous refusal of `offer_stream`. Nothing was sent.
#[derive(Debug)]
pub enum Refused {
    NoStreamHosts,
    NoTransport,
    NoHandler,
    SessionExists(String),
    Crypto(CryptoError),
    SendFailed(String),
    Closed,
}

impl fmt::Display for Refused {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Refused::NoStreamHosts => write!(f, "no stream hosts offered"),
            Refused::NoTransport => write!(f, "no signaling transport attached"),
            Refused::NoHandler => write!(f, "no stream handler registered"),
            Refused::SessionExists(sid) => write!(f, "session {} already exists", sid),
            Refused::Crypto(e) => write!(f, "cannot generate session id: {}", e),
            Refused::SendFailed(e) => write!(f, "failed to send offer: {}", e),
            Refused::Closed => write!(f, "stream manager stopped"),
        }
    }
}

impl std::error::Error for Refused {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    UnknownSession(String),
    NoTransport,
    InvalidState(&'static str),
    SendFailed(String),
    Closed,
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerError::UnknownSession(sid) => write!(f, "unknown session {}", sid),
            ManagerError::NoTransport => write!(f, "no signaling transport attached"),
            ManagerError::InvalidState(why) => write!(f, "invalid session state: {}", why),
            ManagerError::SendFailed(e) => write!(f, "failed to send stanza: {}", e),
            ManagerError::Closed => write!(f, "stream manager stopped"),
        }
    }
}

impl std::error::Error for ManagerError {}


// ============================================================================
// Channel-backed handler
// ============================================================================

/// Handler callbacks as values, for consumers that prefer a receiver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    IncomingOffer(IncomingOffer),
    Established { sid: String, peer: Jid, direction: Direction },
    Failed { sid: String, peer: Jid, direction: Direction, error: StreamError },
    SignalingError { sid: String, peer: Jid, error: StreamError },
}

/// Forwards every callback as a [`StreamEvent`]. Events are dropped if the
/// receiver lags by more than the channel capacity.
#[derive(Clone, Debug)]
pub struct ChannelHandler {
    tx: mpsc::Sender<StreamEvent>,
}

impl ChannelHandler {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    fn forward(&self, event: StreamEvent) {
        if self.tx.try_send(event).is_err() {
            warn!("stream event dropped: receiver full or closed");
        }
    }
}

impl StreamHandler for ChannelHandler {
    fn incoming_offer(&self, offer: IncomingOffer) {
        self.forward(StreamEvent::IncomingOffer(offer));
    }

    fn stream_established(&self, sid: &str, peer: &Jid, direction: Direction) {
        self.forward(StreamEvent::Established {
            sid: sid.to_string(),
            peer: peer.clone(),
            direction,
        });
    }

    fn stream_failed(&self, sid: &str, peer: &Jid, direction: Direction, error: StreamError) {
        self.forward(StreamEvent::Failed {
            sid: sid.to_string(),
            peer: peer.clone(),
            direction,
            error,
        });
    }

    fn signaling_error(&self, sid: &str, peer: &Jid, error: StreamError) {
        self.forward(StreamEvent::SignalingError {
            sid: sid.to_string(),
            peer: peer.clone(),
            error,
        });
    }
}


// ============================================================================
// Bookkeeping types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    /// Waiting on the peer (outgoing) or on the application (incoming).
    Offered,
    /// A relay session is connecting; `attempt` tags its completion.
    Connecting { attempt: u64 },
}

#[derive(Debug)]
struct PendingNegotiation {
    peer: Jid,
    candidates: Vec<StreamHost>,
    /// Id of the open request: ours when outgoing, the peer's when incoming.
    correlation_id: String,
    direction: Direction,
    stage: Stage,
    created_at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    OpenStream,
    ActivateStream,
}

#[derive(Debug)]
struct Correlation {
    sid: String,
    phase: Phase,
    /// Entity the request was sent to; only it may answer.
    to: Jid,
    created_at: Instant,
}

struct SessionEntry {
    session: Box<dyn RelaySession>,
    peer: Jid,
    direction: Direction,
    /// An activation request is in flight.
    activating: bool,
}

impl SessionEntry {
    fn new(session: Box<dyn RelaySession>, peer: Jid, direction: Direction) -> Self {
        Self { session, peer, direction, activating: false }
    }
}


// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum ManagerCommand {
    Offer {
        peer: Jid,
        hosts: Vec<StreamHost>,
        sid: Option<String>,
        reply: oneshot::Sender<Result<String, Refused>>,
    },
    Inbound {
        from: Jid,
        iq: Iq,
    },
    Accept {
        sid: String,
        reply: oneshot::Sender<Result<(), ManagerError>>,
    },
    Reject {
        sid: String,
        reason: StreamError,
        reply: oneshot::Sender<Result<(), ManagerError>>,
    },
    Activate {
        sid: String,
        reply: oneshot::Sender<Result<(), ManagerError>>,
    },
    Dispose {
        sid: String,
        reply: oneshot::Sender<()>,
    },
    TakeSession {
        sid: String,
        reply: oneshot::Sender<Option<Box<dyn RelaySession>>>,
    },
    Snapshot {
        sid: Option<String>,
        reply: oneshot::Sender<Snapshot>,
    },
    /// Completion of a relay connect spawned by the actor.
    RelayConnected {
        sid: String,
        attempt: u64,
        session: Box<dyn RelaySession>,
        result: Result<StreamHost, RelayError>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone, Copy, Debug, Default)]
struct Snapshot {
    pending: usize,
    sessions: usize,
    correlations: usize,
    has_session: bool,
}


// ============================================================================
// StreamManager Handle
// ============================================================================

/// Handle to the stream manager actor. Cheap to clone.
#[derive(Clone)]
pub struct StreamManager {
    cmd_tx: mpsc::Sender<ManagerCommand>,
}

impl fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamManager")
            .field("closed", &self.cmd_tx.is_closed())
            .finish()
    }
}

pub struct StreamManagerBuilder {
    config: ManagerConfig,
    transport: Option<Arc<dyn SignalingTransport>>,
    server: Option<NegotiationServer>,
    connector: Arc<dyn RelayConnector>,
    handler: Option<Arc<dyn StreamHandler>>,
}

impl StreamManagerBuilder {
    pub fn transport(mut self, transport: Arc<dyn SignalingTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Local SOCKS5 endpoint used for self-proxy rendezvous.
    pub fn server(mut self, server: NegotiationServer) -> Self {
        self.server = Some(server);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn RelayConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn StreamHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Start the actor. Must be called inside a tokio runtime.
    pub fn spawn(self) -> StreamManager {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let actor = StreamManagerActor {
            config: self.config,
            transport: self.transport,
            server: self.server,
            connector: self.connector,
            handler: self.handler,
            pending: HashMap::new(),
            correlations: HashMap::new(),
            sessions: HashMap::new(),
            hashes: HashMap::new(),
            next_attempt: 0,
            cmd_tx: cmd_tx.downgrade(),
        };
        tokio::spawn(actor.run(cmd_rx));
        StreamManager { cmd_tx }
    }
}

impl StreamManager {
    pub fn builder(config: ManagerConfig) -> StreamManagerBuilder {
        StreamManagerBuilder {
            config,
            transport: None,
            server: None,
            connector: Arc::new(Socks5Connector::default()),
            handler: None,
        }
    }

    /// Offer `hosts` to `peer`. Returns the session id used.
    pub async fn offer_stream(
        &self,
        peer: &Jid,
        hosts: Vec<StreamHost>,
        sid: Option<&str>,
    ) -> Result<String, Refused> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerCommand::Offer {
                peer: peer.clone(),
                hosts,
                sid: sid.map(str::to_string),
                reply: reply_tx,
            })
            .await
            .map_err(|_| Refused::Closed)?;
        reply_rx.await.map_err(|_| Refused::Closed)?
    }

    /// Feed an IQ addressed to this entity's bytestream service.
    pub async fn handle_iq(&self, from: Jid, iq: Iq) -> Result<(), ManagerError> {
        self.cmd_tx
            .send(ManagerCommand::Inbound { from, iq })
            .await
            .map_err(|_| ManagerError::Closed)
    }

    pub async fn accept_offer(&self, sid: &str) -> Result<(), ManagerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(ManagerCommand::Accept { sid: sid.to_string(), reply: reply_tx }, reply_rx)
            .await?
    }

    pub async fn reject_offer(&self, sid: &str, reason: StreamError) -> Result<(), ManagerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(
            ManagerCommand::Reject { sid: sid.to_string(), reason, reply: reply_tx },
            reply_rx,
        )
        .await?
    }

    /// Ask the proxy of an outgoing session to start relaying.
    pub async fn activate(&self, sid: &str) -> Result<(), ManagerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(ManagerCommand::Activate { sid: sid.to_string(), reply: reply_tx }, reply_rx)
            .await?
    }

    /// Release everything held for `sid`. Idempotent.
    pub async fn dispose(&self, sid: &str) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .request(ManagerCommand::Dispose { sid: sid.to_string(), reply: reply_tx }, reply_rx)
            .await;
    }

    /// Take ownership of an established relay session.
    pub async fn take_session(&self, sid: &str) -> Option<Box<dyn RelaySession>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = ManagerCommand::TakeSession { sid: sid.to_string(), reply: reply_tx };
        self.request(cmd, reply_rx)
            .await
            .ok()
            .flatten()
    }

    pub async fn pending_count(&self) -> usize {
        self.snapshot(None).await.pending
    }

    pub async fn session_count(&self) -> usize {
        self.snapshot(None).await.sessions
    }

    pub async fn correlation_count(&self) -> usize {
        self.snapshot(None).await.correlations
    }

    pub async fn has_session(&self, sid: &str) -> bool {
        self.snapshot(Some(sid.to_string())).await.has_session
    }

    /// Unregister all hashes, fail outstanding negotiations locally, stop.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.request(ManagerCommand::Shutdown { reply: reply_tx }, reply_rx).await;
    }

    async fn snapshot(&self, sid: Option<String>) -> Snapshot {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(ManagerCommand::Snapshot { sid, reply: reply_tx }, reply_rx)
            .await
            .unwrap_or_default()
    }

    async fn request<T>(
        &self,
        cmd: ManagerCommand,
        reply_rx: oneshot::Receiver<T>,
    ) -> Result<T, ManagerError> {
        self.cmd_tx.send(cmd).await.map_err(|_| ManagerError::Closed)?;
        reply_rx.await.map_err(|_| ManagerError::Closed)
    }
}


// ============================================================================
// StreamManagerActor (owns all state)
// ============================================================================

struct StreamManagerActor {
    config: ManagerConfig,
    transport: Option<Arc<dyn SignalingTransport>>,
    server: Option<NegotiationServer>,
    connector: Arc<dyn RelayConnector>,
    handler: Option<Arc<dyn StreamHandler>>,
    pending: HashMap<String, PendingNegotiation>,
    correlations: HashMap<String, Correlation>,
    sessions: HashMap<String, SessionEntry>,
    /// Hashes this manager registered with the local server, by sid.
    hashes: HashMap<String, String>,
    next_attempt: u64,
    cmd_tx: mpsc::WeakSender<ManagerCommand>,
}

impl StreamManagerActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ManagerCommand>) {
        let mut cleanup_interval = tokio::time::interval(self.config.cleanup_interval);
        cleanup_interval.tick().await; // Skip initial tick

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
                            self.shutdown().await;
                            break;
                        }
                    }
                }

                _ = cleanup_interval.tick() => {
                    self.expire().await;
                }
            }
        }
        debug!("stream manager actor stopped");
    }

    async fn handle_command(&mut self, cmd: ManagerCommand) -> ControlFlow<()> {
        match cmd {
            ManagerCommand::Offer { peer, hosts, sid, reply } => {
                let result = self.offer_stream(peer, hosts, sid).await;
                let _ = reply.send(result);
            }
            ManagerCommand::Inbound { from, iq } => {
                self.on_inbound(from, iq).await;
            }
            ManagerCommand::Accept { sid, reply } => {
                let _ = reply.send(self.accept_offer(&sid));
            }
            ManagerCommand::Reject { sid, reason, reply } => {
                let result = self.reject_offer(&sid, reason).await;
                let _ = reply.send(result);
            }
            ManagerCommand::Activate { sid, reply } => {
                let result = self.activate(&sid).await;
                let _ = reply.send(result);
            }
            ManagerCommand::Dispose { sid, reply } => {
                self.dispose(&sid).await;
                let _ = reply.send(());
            }
            ManagerCommand::TakeSession { sid, reply } => {
                let taken = self.sessions.remove(&sid).map(|entry| entry.session);
                if taken.is_some() {
                    self.correlations.retain(|_, c| c.sid != sid);
                    self.hashes.remove(&sid);
                    debug!(sid = %sid, "session handed to application");
                }
                let _ = reply.send(taken);
            }
            ManagerCommand::Snapshot { sid, reply } => {
                let _ = reply.send(Snapshot {
                    pending: self.pending.len(),
                    sessions: self.sessions.len(),
                    correlations: self.correlations.len(),
                    has_session: sid.map_or(false, |sid| self.sessions.contains_key(&sid)),
                });
            }
            ManagerCommand::RelayConnected { sid, attempt, session, result } => {
                self.on_relay_connected(sid, attempt, session, result).await;
            }
            ManagerCommand::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    // ------------------------------------------------------------------------
    // Outgoing: offer
    // ------------------------------------------------------------------------

    async fn offer_stream(
        &mut self,
        peer: Jid,
        hosts: Vec<StreamHost>,
        sid: Option<String>,
    ) -> Result<String, Refused> {
        if hosts.is_empty() {
            return Err(Refused::NoStreamHosts);
        }
        let transport = self.transport.clone().ok_or(Refused::NoTransport)?;
        if self.handler.is_none() {
            return Err(Refused::NoHandler);
        }
        let sid = match sid {
            Some(sid) if !sid.is_empty() => sid,
            _ => generate_sid().map_err(Refused::Crypto)?,
        };
        if self.pending.contains_key(&sid) || self.sessions.contains_key(&sid) {
            return Err(Refused::SessionExists(sid));
        }

        let own = transport.own_jid();
        if hosts.iter().any(|host| host.identity == own) {
            self.register_hash(&sid, rendezvous_hash(&sid, &own, &peer)).await;
        }

        let id = transport.next_id();
        let iq = Iq::offer(id.clone(), &sid, self.config.mode, hosts.clone());
        if let Err(e) = transport.send(&peer, iq).await {
            warn!(sid = %sid, peer = %peer, error = %e, "failed to send offer");
            self.unregister_hash(&sid).await;
            return Err(Refused::SendFailed(e.to_string()));
        }

        info!(sid = %sid, peer = %peer, hosts = hosts.len(), "bytestream offered");
        let now = Instant::now();
        self.correlations.insert(
            id.clone(),
            Correlation {
                sid: sid.clone(),
                phase: Phase::OpenStream,
                to: peer.clone(),
                created_at: now,
            },
        );
        self.pending.insert(
            sid.clone(),
            PendingNegotiation {
                peer,
                candidates: hosts,
                correlation_id: id,
                direction: Direction::Outgoing,
                stage: Stage::Offered,
                created_at: now,
            },
        );
        Ok(sid)
    }

    // ------------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------------

    async fn on_inbound(&mut self, from: Jid, iq: Iq) {
        let Iq { id, kind, payload } = iq;
        match (kind, payload) {
            (IqType::Set, IqPayload::Query { sid, mode, hosts }) => {
                self.on_signaling_request(from, sid, mode, hosts, id).await;
            }
            (IqType::Result, payload) => {
                self.on_signaling_result(from, id, payload).await;
            }
            (IqType::Error, IqPayload::Error(error)) => {
                self.on_signaling_error(from, id, error).await;
            }
            (IqType::Error, _) => {
                let error = StreamError::Undefined.to_stanza_error();
                self.on_signaling_error(from, id, error).await;
            }
            (IqType::Get, _) | (IqType::Set, _) => {
                debug!(from = %from, id = %id, "unsupported bytestream request");
                self.send_error(&from, id, StreamError::NotImplemented).await;
            }
        }
    }

    async fn on_signaling_request(
        &mut self,
        peer: Jid,
        sid: String,
        mode: StreamMode,
        hosts: Vec<StreamHost>,
        id: String,
    ) {
        let verdict = if self.sessions.values().any(|entry| entry.peer == peer) {
            Err(StreamError::AlreadyStreaming)
        } else if sid.is_empty() || mode != self.config.mode || hosts.is_empty() {
            Err(StreamError::Unacceptable)
        } else if self.pending.contains_key(&sid) || self.sessions.contains_key(&sid) {
            Err(StreamError::Unacceptable)
        } else if self.handler.is_none() {
            Err(StreamError::NotAllowed)
        } else {
            Ok(())
        };

        if let Err(error) = verdict {
            debug!(sid = %sid, peer = %peer, error = %error, "rejecting offer");
            self.send_error(&peer, id, error).await;
            return;
        }

        info!(sid = %sid, peer = %peer, hosts = hosts.len(), "bytestream offer received");
        self.pending.insert(
            sid.clone(),
            PendingNegotiation {
                peer: peer.clone(),
                candidates: hosts.clone(),
                correlation_id: id,
                direction: Direction::Incoming,
                stage: Stage::Offered,
                created_at: Instant::now(),
            },
        );
        if let Some(handler) = &self.handler {
            handler.incoming_offer(IncomingOffer { sid, peer, hosts });
        }
    }

    /// Remove the correlation for `id` if `from` is the entity it was sent to.
    fn take_correlation(&mut self, from: &Jid, id: &str) -> Option<Correlation> {
        match self.correlations.get(id) {
            Some(correlation) if correlation.to == *from => self.correlations.remove(id),
            Some(correlation) => {
                warn!(
                    id = %id,
                    from = %from,
                    expected = %correlation.to,
                    "response from unexpected entity"
                );
                None
            }
            None => {
                trace!(id = %id, from = %from, "no correlation for response, ignoring");
                None
            }
        }
    }

    async fn on_signaling_result(&mut self, from: Jid, id: String, payload: IqPayload) {
        let Some(correlation) = self.take_correlation(&from, &id) else {
            return;
        };
        match (correlation.phase, payload) {
            (Phase::OpenStream, IqPayload::StreamHostUsed { jid }) => {
                self.on_stream_host_chosen(from, correlation.sid, jid).await;
            }
            (Phase::OpenStream, _) => {
                warn!(sid = %correlation.sid, "open result without streamhost-used");
                self.fail_negotiation(&correlation.sid, StreamError::Unacceptable, false).await;
            }
            (Phase::ActivateStream, _) => {
                self.on_activated(&correlation.sid);
            }
        }
    }

    async fn on_signaling_error(&mut self, from: Jid, id: String, error: StanzaError) {
        let Some(correlation) = self.take_correlation(&from, &id) else {
            return;
        };
        let kind = StreamError::from_stanza_error(&error);
        let sid = correlation.sid;
        debug!(
            sid = %sid,
            from = %from,
            error = %kind,
            phase = ?correlation.phase,
            "signaling error"
        );

        let peer = match correlation.phase {
            Phase::OpenStream => self.pending.remove(&sid).map(|p| p.peer),
            Phase::ActivateStream => self.sessions.remove(&sid).map(|entry| entry.peer),
        };
        self.correlations.retain(|_, c| c.sid != sid);
        self.unregister_hash(&sid).await;

        if let (Some(peer), Some(handler)) = (peer, &self.handler) {
            handler.signaling_error(&sid, &peer, kind);
        }
    }

    // ------------------------------------------------------------------------
    // Outgoing: host chosen, relay, activation
    // ------------------------------------------------------------------------

    async fn on_stream_host_chosen(&mut self, peer: Jid, sid: String, chosen: Jid) {
        let host = match self.pending.get(&sid) {
            Some(p) if p.direction == Direction::Outgoing && p.stage == Stage::Offered => {
                p.candidates.iter().find(|h| h.identity == chosen).cloned()
            }
            _ => {
                debug!(sid = %sid, "streamhost-used for unknown negotiation");
                return;
            }
        };
        let Some(host) = host else {
            warn!(sid = %sid, chosen = %chosen, "peer chose a host that was not offered");
            self.fail_negotiation(&sid, StreamError::Unacceptable, false).await;
            return;
        };
        let Some(own) = self.transport.as_ref().map(|t| t.own_jid()) else {
            return;
        };
        let hash = rendezvous_hash(&sid, &own, &peer);

        if chosen == own {
            if let Some(server) = &self.server {
                let Some(stream) = server.get_connection(&hash).await else {
                    debug!(sid = %sid, hash = %hash, "self-proxy chosen but no bound connection");
                    return;
                };
                let mut session = self.connector.create(&sid, &peer, hash);
                session.attach(stream, host);
                session.activate();
                self.pending.remove(&sid);
                self.hashes.remove(&sid);
                self.sessions.insert(
                    sid.clone(),
                    SessionEntry::new(session, peer.clone(), Direction::Outgoing),
                );
                info!(sid = %sid, peer = %peer, "bytestream established through local endpoint");
                if let Some(handler) = &self.handler {
                    handler.stream_established(&sid, &peer, Direction::Outgoing);
                }
                return;
            }
        }

        // Only the chosen host; the local endpoint will not be used.
        self.unregister_hash(&sid).await;
        let mut session = self.connector.create(&sid, &peer, hash);
        session.set_stream_hosts(vec![host]);
        self.spawn_connect(&sid, session);
    }

    fn spawn_connect(&mut self, sid: &str, mut session: Box<dyn RelaySession>) {
        let Some(cmd_tx) = self.cmd_tx.upgrade() else {
            return;
        };
        let Some(pending) = self.pending.get_mut(sid) else {
            return;
        };
        let attempt = self.next_attempt;
        self.next_attempt += 1;
        pending.stage = Stage::Connecting { attempt };

        let sid = sid.to_string();
        tokio::spawn(async move {
            let result = session.connect().await;
            let _ = cmd_tx
                .send(ManagerCommand::RelayConnected { sid, attempt, session, result })
                .await;
        });
    }

    async fn on_relay_connected(
        &mut self,
        sid: String,
        attempt: u64,
        mut session: Box<dyn RelaySession>,
        result: Result<StreamHost, RelayError>,
    ) {
        let current = matches!(
            self.pending.get(&sid).map(|p| p.stage),
            Some(Stage::Connecting { attempt: current }) if current == attempt
        );
        if !current {
            debug!(sid = %sid, "discarding stale relay connection");
            return;
        }
        let Some(pending) = self.pending.remove(&sid) else {
            return;
        };

        match (pending.direction, result) {
            (Direction::Outgoing, Ok(host)) => {
                debug!(sid = %sid, proxy = %host.identity, "connected to proxy");
                self.sessions.insert(
                    sid.clone(),
                    SessionEntry::new(session, pending.peer, Direction::Outgoing),
                );
                if let Err(e) = self.activate(&sid).await {
                    warn!(sid = %sid, error = %e, "activation request failed");
                    if let Some(entry) = self.sessions.remove(&sid) {
                        let error = StreamError::Cancelled;
                        self.notify_failed(&sid, &entry.peer, Direction::Outgoing, error);
                    }
                }
            }
            (Direction::Incoming, Ok(host)) => {
                let reply = Iq::stream_host_used(pending.correlation_id, host.identity.clone());
                if !self.send(&pending.peer, reply).await {
                    let error = StreamError::Cancelled;
                    self.notify_failed(&sid, &pending.peer, Direction::Incoming, error);
                    return;
                }
                session.activate();
                info!(
                    sid = %sid,
                    peer = %pending.peer,
                    host = %host.identity,
                    "bytestream established"
                );
                self.sessions.insert(
                    sid.clone(),
                    SessionEntry::new(session, pending.peer.clone(), Direction::Incoming),
                );
                if let Some(handler) = &self.handler {
                    handler.stream_established(&sid, &pending.peer, Direction::Incoming);
                }
            }
            (direction, Err(e)) => {
                info!(sid = %sid, peer = %pending.peer, error = %e, "no stream host reachable");
                self.correlations.retain(|_, c| c.sid != sid);
                if direction == Direction::Incoming {
                    let id = pending.correlation_id.clone();
                    self.send_error(&pending.peer, id, StreamError::ItemNotFound).await;
                }
                self.notify_failed(&sid, &pending.peer, direction, StreamError::ItemNotFound);
            }
        }
    }

    async fn activate(&mut self, sid: &str) -> Result<(), ManagerError> {
        let entry = self
            .sessions
            .get_mut(sid)
            .ok_or_else(|| ManagerError::UnknownSession(sid.to_string()))?;
        if entry.direction != Direction::Outgoing {
            return Err(ManagerError::InvalidState("only the initiator activates"));
        }
        if entry.session.is_active() || entry.activating {
            return Ok(());
        }
        let proxy = entry
            .session
            .stream_host()
            .map(|host| host.identity.clone())
            .ok_or(ManagerError::InvalidState("session is not connected"))?;
        let peer = entry.peer.clone();
        let transport = self.transport.clone().ok_or(ManagerError::NoTransport)?;

        if proxy == transport.own_jid() {
            entry.session.activate();
            if let Some(handler) = &self.handler {
                handler.stream_established(sid, &peer, Direction::Outgoing);
            }
            return Ok(());
        }

        let id = transport.next_id();
        transport
            .send(&proxy, Iq::activate(id.clone(), sid, peer))
            .await
            .map_err(|e| {
                warn!(sid = %sid, proxy = %proxy, error = %e, "failed to send activation");
                ManagerError::SendFailed(e.to_string())
            })?;
        debug!(sid = %sid, proxy = %proxy, "activation requested");
        if let Some(entry) = self.sessions.get_mut(sid) {
            entry.activating = true;
        }
        self.correlations.insert(
            id,
            Correlation {
                sid: sid.to_string(),
                phase: Phase::ActivateStream,
                to: proxy,
                created_at: Instant::now(),
            },
        );
        Ok(())
    }

    fn on_activated(&mut self, sid: &str) {
        let Some(entry) = self.sessions.get_mut(sid) else {
            trace!(sid = %sid, "activation result for unknown session");
            return;
        };
        entry.activating = false;
        if entry.session.is_active() {
            trace!(sid = %sid, "session already active");
            return;
        }
        entry.session.activate();
        info!(sid = %sid, peer = %entry.peer, "bytestream established through proxy");
        if let Some(handler) = &self.handler {
            handler.stream_established(sid, &entry.peer, Direction::Outgoing);
        }
    }

    // ------------------------------------------------------------------------
    // Incoming: application decision
    // ------------------------------------------------------------------------

    fn accept_offer(&mut self, sid: &str) -> Result<(), ManagerError> {
        let own = self
            .transport
            .as_ref()
            .map(|t| t.own_jid())
            .ok_or(ManagerError::NoTransport)?;
        let pending = match self.pending.get(sid) {
            Some(p) if p.direction == Direction::Incoming && p.stage == Stage::Offered => p,
            _ => return Err(ManagerError::UnknownSession(sid.to_string())),
        };
        let hash = rendezvous_hash(sid, &pending.peer, &own);
        let mut session = self.connector.create(sid, &pending.peer, hash);
        session.set_stream_hosts(pending.candidates.clone());
        debug!(sid = %sid, peer = %pending.peer, "offer accepted, connecting");
        self.spawn_connect(sid, session);
        Ok(())
    }

    async fn reject_offer(&mut self, sid: &str, reason: StreamError) -> Result<(), ManagerError> {
        match self.pending.get(sid) {
            Some(p) if p.direction == Direction::Incoming && p.stage == Stage::Offered => {}
            _ => return Err(ManagerError::UnknownSession(sid.to_string())),
        }
        let Some(pending) = self.pending.remove(sid) else {
            return Err(ManagerError::UnknownSession(sid.to_string()));
        };
        info!(sid = %sid, peer = %pending.peer, reason = %reason, "offer rejected");
        self.send_error(&pending.peer, pending.correlation_id, reason).await;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    async fn dispose(&mut self, sid: &str) {
        let had_pending = self.pending.remove(sid).is_some();
        let had_session = self.sessions.remove(sid).is_some();
        self.correlations.retain(|_, c| c.sid != sid);
        self.unregister_hash(sid).await;
        if had_pending || had_session {
            debug!(sid = %sid, "session disposed");
        }
    }

    /// Terminal failure of a pending negotiation.
    async fn fail_negotiation(&mut self, sid: &str, error: StreamError, notify_peer: bool) {
        let Some(pending) = self.pending.remove(sid) else {
            return;
        };
        self.correlations.retain(|_, c| c.sid != sid);
        self.unregister_hash(sid).await;
        // The peer's open request is unanswered until the relay connects,
        // whatever the stage.
        if notify_peer && pending.direction == Direction::Incoming {
            self.send_error(&pending.peer, pending.correlation_id, error).await;
        }
        self.notify_failed(sid, &pending.peer, pending.direction, error);
    }

    async fn expire(&mut self) {
        let timeout = self.config.negotiation_timeout;

        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.created_at.elapsed() > timeout)
            .map(|(sid, _)| sid.clone())
            .collect();
        for sid in expired {
            info!(sid = %sid, "negotiation timed out");
            self.fail_negotiation(&sid, StreamError::TimedOut, true).await;
        }

        let stale: Vec<String> = self
            .correlations
            .iter()
            .filter(|(_, c)| c.created_at.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            let Some(correlation) = self.correlations.remove(&id) else {
                continue;
            };
            if correlation.phase == Phase::ActivateStream {
                if let Some(entry) = self.sessions.remove(&correlation.sid) {
                    info!(sid = %correlation.sid, "activation timed out");
                    let (sid, error) = (&correlation.sid, StreamError::TimedOut);
                    self.notify_failed(sid, &entry.peer, Direction::Outgoing, error);
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        let sids: Vec<String> = self.pending.keys().cloned().collect();
        for sid in sids {
            self.fail_negotiation(&sid, StreamError::Cancelled, false).await;
        }

        let correlations: Vec<Correlation> = self.correlations.drain().map(|(_, c)| c).collect();
        for correlation in correlations {
            if let Some(entry) = self.sessions.remove(&correlation.sid) {
                let error = StreamError::Cancelled;
                self.notify_failed(&correlation.sid, &entry.peer, entry.direction, error);
            }
        }

        let hashes: Vec<String> = self.hashes.drain().map(|(_, hash)| hash).collect();
        if let Some(server) = &self.server {
            for hash in &hashes {
                server.unregister_hash(hash).await;
            }
        }
        self.sessions.clear();
        info!("stream manager shut down");
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    async fn register_hash(&mut self, sid: &str, hash: String) {
        let Some(server) = &self.server else {
            return;
        };
        match server.register_hash(&hash).await {
            Ok(()) => {
                self.hashes.insert(sid.to_string(), hash);
            }
            Err(e) => warn!(sid = %sid, error = %e, "failed to register rendezvous hash"),
        }
    }

    async fn unregister_hash(&mut self, sid: &str) {
        if let (Some(hash), Some(server)) = (self.hashes.remove(sid), &self.server) {
            server.unregister_hash(&hash).await;
        }
    }

    async fn send(&self, to: &Jid, iq: Iq) -> bool {
        let Some(transport) = &self.transport else {
            warn!(to = %to, "no signaling transport, dropping stanza");
            return false;
        };
        match transport.send(to, iq).await {
            Ok(()) => true,
            Err(e) => {
                warn!(to = %to, error = %e, "failed to send stanza");
                false
            }
        }
    }

    async fn send_error(&self, to: &Jid, id: String, error: StreamError) {
        self.send(to, Iq::error(id, error)).await;
    }

    fn notify_failed(&self, sid: &str, peer: &Jid, direction: Direction, error: StreamError) {
        if let Some(handler) = &self.handler {
            handler.stream_failed(sid, peer, direction, error);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use tokio::net::{TcpListener, TcpStream};

    use crate::messages::{Condition, ErrorType};
    use crate::server::ServerConfig;
    use crate::socks5;

    const STEP: Duration = Duration::from_secs(5);

    fn jid(s: &str) -> Jid {
        s.parse().unwrap()
    }

    struct RecordingTransport {
        own: Jid,
        counter: AtomicU64,
        sent: Mutex<Vec<(Jid, Iq)>>,
        fail: AtomicBool,
    }

    impl RecordingTransport {
        fn new(own: &str) -> Arc<Self> {
            Arc::new(Self {
                own: jid(own),
                counter: AtomicU64::new(0),
                sent: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            })
        }

        fn sent(&self) -> Vec<(Jid, Iq)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SignalingTransport for RecordingTransport {
        fn own_jid(&self) -> Jid {
            self.own.clone()
        }

        fn next_id(&self) -> String {
            format!("s5b{}", self.counter.fetch_add(1, Ordering::SeqCst))
        }

        async fn send(&self, to: &Jid, iq: Iq) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(anyhow!("link down"));
            }
            self.sent.lock().unwrap().push((to.clone(), iq));
            Ok(())
        }
    }

    /// Counts `create` calls and connect attempts.
    #[derive(Default)]
    struct CountingConnector {
        created: AtomicUsize,
        connects: Arc<AtomicUsize>,
    }

    struct CountingSession {
        inner: Box<dyn RelaySession>,
        connects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RelaySession for CountingSession {
        fn sid(&self) -> &str {
            self.inner.sid()
        }
        fn set_stream_hosts(&mut self, hosts: Vec<StreamHost>) {
            self.inner.set_stream_hosts(hosts);
        }
        async fn connect(&mut self) -> Result<StreamHost, RelayError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.inner.connect().await
        }
        fn attach(&mut self, stream: TcpStream, host: StreamHost) {
            self.inner.attach(stream, host);
        }
        fn stream_host(&self) -> Option<&StreamHost> {
            self.inner.stream_host()
        }
        fn activate(&mut self) {
            self.inner.activate();
        }
        fn is_active(&self) -> bool {
            self.inner.is_active()
        }
        fn take_stream(&mut self) -> Option<TcpStream> {
            self.inner.take_stream()
        }
    }

    impl RelayConnector for CountingConnector {
        fn create(&self, sid: &str, peer: &Jid, hash: String) -> Box<dyn RelaySession> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let connector = Socks5Connector { connect_timeout: Duration::from_secs(2) };
            let inner = connector.create(sid, peer, hash);
            Box::new(CountingSession { inner, connects: self.connects.clone() })
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<StreamEvent>) -> StreamEvent {
        tokio::time::timeout(STEP, rx.recv())
            .await
            .expect("no stream event")
            .expect("event channel closed")
    }

    fn manager(
        transport: Arc<RecordingTransport>,
    ) -> (StreamManager, mpsc::Receiver<StreamEvent>) {
        let (handler, rx) = ChannelHandler::new(16);
        let manager = StreamManager::builder(ManagerConfig::default())
            .transport(transport)
            .handler(Arc::new(handler))
            .spawn();
        (manager, rx)
    }

    async fn local_server() -> NegotiationServer {
        NegotiationServer::listen("127.0.0.1:0", ServerConfig::default()).await.unwrap()
    }

    /// An outgoing session connected through a loopback proxy, with its
    /// activation request sent and unanswered.
    struct Proxied {
        manager: StreamManager,
        rx: mpsc::Receiver<StreamEvent>,
        transport: Arc<RecordingTransport>,
        _proxy: NegotiationServer,
        proxy_jid: Jid,
        peer: Jid,
        sid: String,
        activation_id: String,
    }

    async fn proxied(config: ManagerConfig) -> Proxied {
        let proxy = local_server().await;
        let proxy_jid = jid("proxy.d.com");
        let own = jid("a@b.com/x");
        let peer = jid("c@d.com/y");
        let transport = RecordingTransport::new(own.as_str());
        let (handler, rx) = ChannelHandler::new(16);
        let manager = StreamManager::builder(config)
            .transport(transport.clone())
            .handler(Arc::new(handler))
            .spawn();

        let sid = "sid-p".to_string();
        proxy.register_hash(&rendezvous_hash(&sid, &own, &peer)).await.unwrap();
        let host = StreamHost::new(proxy_jid.clone(), "127.0.0.1", proxy.local_addr().port());
        manager.offer_stream(&peer, vec![host], Some(&sid)).await.unwrap();
        let open_id = transport.sent()[0].1.id.clone();
        manager
            .handle_iq(peer.clone(), Iq::stream_host_used(open_id, proxy_jid.clone()))
            .await
            .unwrap();

        let deadline = Instant::now() + STEP;
        while transport.sent().len() < 2 {
            assert!(Instant::now() < deadline, "no activation request");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let (to, request) = transport.sent()[1].clone();
        assert_eq!(to, proxy_jid);
        assert_eq!(
            request.payload,
            IqPayload::Activate { sid: sid.clone(), target: peer.clone() }
        );
        assert_eq!(manager.session_count().await, 1);
        assert_eq!(manager.pending_count().await, 0);

        Proxied {
            manager,
            rx,
            transport,
            _proxy: proxy,
            proxy_jid,
            peer,
            sid,
            activation_id: request.id,
        }
    }

    #[tokio::test]
    async fn offer_without_hosts_is_refused_silently() {
        let transport = RecordingTransport::new("a@b.com/x");
        let (manager, _rx) = manager(transport.clone());
        let result = manager.offer_stream(&jid("c@d.com/y"), Vec::new(), None).await;
        assert!(matches!(result, Err(Refused::NoStreamHosts)));
        assert!(transport.sent().is_empty());
        assert_eq!(manager.pending_count().await, 0);
    }

    #[tokio::test]
    async fn offer_without_transport_is_refused() {
        let (handler, _rx) = ChannelHandler::new(4);
        let manager = StreamManager::builder(ManagerConfig::default())
            .handler(Arc::new(handler))
            .spawn();
        let host = StreamHost::new(jid("a@b.com/x"), "127.0.0.1", 1);
        let result = manager.offer_stream(&jid("c@d.com/y"), vec![host], None).await;
        assert!(matches!(result, Err(Refused::NoTransport)));
    }

    #[tokio::test]
    async fn offer_sends_query_and_tracks_correlation() {
        let transport = RecordingTransport::new("a@b.com/x");
        let (manager, _rx) = manager(transport.clone());
        let peer = jid("c@d.com/y");
        let hosts = vec![StreamHost::new(jid("proxy.d.com"), "10.0.0.1", 7777)];

        let sid = manager.offer_stream(&peer, hosts.clone(), Some("sid-1")).await.unwrap();
        assert_eq!(sid, "sid-1");

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, peer);
        assert_eq!(sent[0].1, Iq::offer("s5b0", "sid-1", StreamMode::Tcp, hosts.clone()));
        assert_eq!(manager.pending_count().await, 1);
        assert_eq!(manager.correlation_count().await, 1);

        // Same sid again is refused.
        let again = manager.offer_stream(&peer, hosts, Some("sid-1")).await;
        assert!(matches!(again, Err(Refused::SessionExists(_))));
    }

    #[tokio::test]
    async fn generated_sid_is_used_when_none_given() {
        let transport = RecordingTransport::new("a@b.com/x");
        let (manager, _rx) = manager(transport.clone());
        let host = StreamHost::new(jid("proxy.d.com"), "10.0.0.1", 7777);
        let sid = manager.offer_stream(&jid("c@d.com/y"), vec![host], None).await.unwrap();
        assert_eq!(sid.len(), 32);
    }

    #[tokio::test]
    async fn incoming_offer_reaches_handler() {
        let transport = RecordingTransport::new("c@d.com/y");
        let (manager, mut rx) = manager(transport.clone());
        let peer = jid("a@b.com/x");
        let hosts = vec![StreamHost::new(peer.clone(), "127.0.0.1", 1)];

        manager
            .handle_iq(peer.clone(), Iq::offer("req1", "sid-9", StreamMode::Tcp, hosts.clone()))
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut rx).await,
            StreamEvent::IncomingOffer(IncomingOffer { sid: "sid-9".into(), peer, hosts })
        );
        assert_eq!(manager.pending_count().await, 1);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn malformed_offers_are_rejected_immediately() {
        let transport = RecordingTransport::new("c@d.com/y");
        let (manager, _rx) = manager(transport.clone());
        let peer = jid("a@b.com/x");
        let host = StreamHost::new(peer.clone(), "127.0.0.1", 1);

        manager
            .handle_iq(peer.clone(), Iq::offer("r1", "", StreamMode::Tcp, vec![host.clone()]))
            .await
            .unwrap();
        manager
            .handle_iq(peer.clone(), Iq::offer("r2", "s", StreamMode::Udp, vec![host]))
            .await
            .unwrap();
        manager
            .handle_iq(peer.clone(), Iq::activate("r3", "s", jid("e@f.com")))
            .await
            .unwrap();

        assert_eq!(manager.pending_count().await, 0);
        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].1, Iq::error("r1", StreamError::Unacceptable));
        assert_eq!(sent[1].1, Iq::error("r2", StreamError::Unacceptable));
        assert_eq!(sent[2].1, Iq::error("r3", StreamError::NotImplemented));
    }

    #[tokio::test]
    async fn offer_without_handler_is_not_allowed() {
        let transport = RecordingTransport::new("c@d.com/y");
        let manager = StreamManager::builder(ManagerConfig::default())
            .transport(transport.clone())
            .spawn();
        let peer = jid("a@b.com/x");
        let host = StreamHost::new(peer.clone(), "127.0.0.1", 1);
        manager
            .handle_iq(peer, Iq::offer("r1", "s", StreamMode::Tcp, vec![host]))
            .await
            .unwrap();
        assert_eq!(manager.pending_count().await, 0);
        assert_eq!(transport.sent()[0].1, Iq::error("r1", StreamError::NotAllowed));
    }

    #[tokio::test]
    async fn reject_sends_forbidden_with_request_id() {
        let transport = RecordingTransport::new("c@d.com/y");
        let (manager, mut rx) = manager(transport.clone());
        let peer = jid("a@b.com/x");
        let host = StreamHost::new(peer.clone(), "127.0.0.1", 1);

        manager
            .handle_iq(peer.clone(), Iq::offer("req7", "sid-7", StreamMode::Tcp, vec![host]))
            .await
            .unwrap();
        next_event(&mut rx).await;

        manager.reject_offer("sid-7", StreamError::Forbidden).await.unwrap();
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, peer);
        assert_eq!(sent[0].1.id, "req7");
        match &sent[0].1.payload {
            IqPayload::Error(e) => {
                assert_eq!(e.kind, ErrorType::Auth);
                assert_eq!(e.condition, Condition::Forbidden);
            }
            other => panic!("expected error payload, got {:?}", other),
        }
        assert_eq!(manager.pending_count().await, 0);

        manager.dispose("sid-7").await;
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(
            manager.reject_offer("sid-7", StreamError::Forbidden).await,
            Err(ManagerError::UnknownSession("sid-7".into()))
        );
    }

    #[tokio::test]
    async fn peer_error_on_open_is_surfaced_and_cleared() {
        let transport = RecordingTransport::new("a@b.com/x");
        let (manager, mut rx) = manager(transport.clone());
        let peer = jid("c@d.com/y");
        let host = StreamHost::new(jid("proxy.d.com"), "10.0.0.1", 7777);
        let sid = manager.offer_stream(&peer, vec![host], Some("s1")).await.unwrap();
        let id = transport.sent()[0].1.id.clone();

        // From the wrong entity: ignored.
        manager
            .handle_iq(jid("mallory@evil.com"), Iq::error(id.clone(), StreamError::Forbidden))
            .await
            .unwrap();
        assert_eq!(manager.correlation_count().await, 1);

        let refusal = Iq::error(id.clone(), StreamError::Forbidden);
        manager.handle_iq(peer.clone(), refusal).await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            StreamEvent::SignalingError {
                sid: sid.clone(),
                peer: peer.clone(),
                error: StreamError::Forbidden,
            }
        );
        assert_eq!(manager.pending_count().await, 0);
        assert_eq!(manager.correlation_count().await, 0);

        // A retransmission of the same error is ignored.
        manager.handle_iq(peer, Iq::error(id, StreamError::Forbidden)).await.unwrap();
        assert_eq!(manager.correlation_count().await, 0);
    }

    #[tokio::test]
    async fn self_proxy_claims_bound_connection() {
        let server = local_server().await;
        let own = jid("a@b.com");
        let peer = jid("c@d.com");
        let transport = RecordingTransport::new(own.as_str());
        let connector = Arc::new(CountingConnector::default());
        let (handler, mut rx) = ChannelHandler::new(16);
        let manager = StreamManager::builder(ManagerConfig::default())
            .transport(transport.clone())
            .server(server.clone())
            .connector(connector.clone())
            .handler(Arc::new(handler))
            .spawn();

        let own_host = StreamHost::new(own.clone(), "127.0.0.1", server.local_addr().port());
        let sid = manager.offer_stream(&peer, vec![own_host], Some("abc123")).await.unwrap();
        let hash = rendezvous_hash("abc123", &own, &peer);
        assert_eq!(server.pending_hash_count().await, 1);

        // The target connects to us with the shared hash.
        let mut target = socks5::connect("127.0.0.1", server.local_addr().port(), &hash, STEP)
            .await
            .unwrap();

        let open_id = transport.sent()[0].1.id.clone();
        manager.handle_iq(peer.clone(), Iq::stream_host_used(open_id, own.clone())).await.unwrap();

        assert_eq!(
            next_event(&mut rx).await,
            StreamEvent::Established { sid: sid.clone(), peer, direction: Direction::Outgoing }
        );
        assert_eq!(connector.created.load(Ordering::SeqCst), 1);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
        assert_eq!(transport.sent().len(), 1, "no activation stanza for self-proxy");
        assert_eq!(manager.pending_count().await, 0);

        let mut session = manager.take_session(&sid).await.unwrap();
        assert!(session.is_active());
        let mut ours = session.take_stream().unwrap();

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        target.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        ours.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn chosen_host_not_offered_fails_negotiation() {
        let transport = RecordingTransport::new("a@b.com/x");
        let (manager, mut rx) = manager(transport.clone());
        let peer = jid("c@d.com/y");
        let host = StreamHost::new(jid("proxy.d.com"), "10.0.0.1", 7777);
        let sid = manager.offer_stream(&peer, vec![host], None).await.unwrap();
        let id = transport.sent()[0].1.id.clone();

        manager
            .handle_iq(peer.clone(), Iq::stream_host_used(id, jid("other.d.com")))
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            StreamEvent::Failed {
                sid,
                peer,
                direction: Direction::Outgoing,
                error: StreamError::Unacceptable,
            }
        );
    }

    #[tokio::test]
    async fn negotiation_times_out() {
        let transport = RecordingTransport::new("a@b.com/x");
        let (handler, mut rx) = ChannelHandler::new(16);
        let config = ManagerConfig {
            negotiation_timeout: Duration::from_millis(50),
            cleanup_interval: Duration::from_millis(20),
            ..ManagerConfig::default()
        };
        let manager = StreamManager::builder(config)
            .transport(transport.clone())
            .handler(Arc::new(handler))
            .spawn();
        let peer = jid("c@d.com/y");
        let host = StreamHost::new(jid("proxy.d.com"), "10.0.0.1", 7777);
        let sid = manager.offer_stream(&peer, vec![host], None).await.unwrap();

        assert_eq!(
            next_event(&mut rx).await,
            StreamEvent::Failed {
                sid,
                peer,
                direction: Direction::Outgoing,
                error: StreamError::TimedOut,
            }
        );
        assert_eq!(manager.pending_count().await, 0);
        assert_eq!(manager.correlation_count().await, 0);
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_locally_and_unregisters() {
        let server = local_server().await;
        let own = jid("a@b.com/x");
        let transport = RecordingTransport::new(own.as_str());
        let (handler, mut rx) = ChannelHandler::new(16);
        let manager = StreamManager::builder(ManagerConfig::default())
            .transport(transport.clone())
            .server(server.clone())
            .handler(Arc::new(handler))
            .spawn();
        let peer = jid("c@d.com/y");
        let host = StreamHost::new(own, "127.0.0.1", server.local_addr().port());
        let sid = manager.offer_stream(&peer, vec![host], None).await.unwrap();
        assert_eq!(server.pending_hash_count().await, 1);

        manager.shutdown().await;
        assert_eq!(
            next_event(&mut rx).await,
            StreamEvent::Failed {
                sid,
                peer,
                direction: Direction::Outgoing,
                error: StreamError::Cancelled,
            }
        );
        assert_eq!(server.pending_hash_count().await, 0);
        assert_eq!(transport.sent().len(), 1, "shutdown sends nothing");
        assert!(matches!(
            manager.offer_stream(&jid("e@f.com"), Vec::new(), None).await,
            Err(Refused::Closed)
        ));
    }

    #[tokio::test]
    async fn failed_send_refuses_offer() {
        let transport = RecordingTransport::new("a@b.com/x");
        transport.fail.store(true, Ordering::SeqCst);
        let (manager, _rx) = manager(transport);
        let host = StreamHost::new(jid("proxy.d.com"), "10.0.0.1", 7777);
        let result = manager.offer_stream(&jid("c@d.com/y"), vec![host], None).await;
        assert!(matches!(result, Err(Refused::SendFailed(_))));
        assert_eq!(manager.pending_count().await, 0);
        assert_eq!(manager.correlation_count().await, 0);
    }

    #[test]
    fn actor_state_is_shareable_across_awaits() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<Box<dyn RelaySession>>();
        assert_send_sync::<StreamManagerActor>();
    }

    #[tokio::test]
    async fn activation_is_requested_once() {
        let mut p = proxied(ManagerConfig::default()).await;

        // Already in flight: no second request.
        p.manager.activate(&p.sid).await.unwrap();
        assert_eq!(p.transport.sent().len(), 2);
        assert_eq!(p.manager.correlation_count().await, 1);

        p.manager
            .handle_iq(p.proxy_jid.clone(), Iq::ack(p.activation_id.clone()))
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut p.rx).await,
            StreamEvent::Established {
                sid: p.sid.clone(),
                peer: p.peer.clone(),
                direction: Direction::Outgoing,
            }
        );

        // Duplicate result and a late activate are both no-ops.
        p.manager
            .handle_iq(p.proxy_jid.clone(), Iq::ack(p.activation_id.clone()))
            .await
            .unwrap();
        p.manager.activate(&p.sid).await.unwrap();
        assert_eq!(p.manager.correlation_count().await, 0);
        assert_eq!(p.transport.sent().len(), 2);
        assert!(p.rx.try_recv().is_err());
        assert!(p.manager.has_session(&p.sid).await);
    }

    #[tokio::test]
    async fn activation_error_drops_session() {
        let mut p = proxied(ManagerConfig::default()).await;

        let refusal = Iq::error(p.activation_id.clone(), StreamError::NotAllowed);
        p.manager.handle_iq(p.proxy_jid.clone(), refusal).await.unwrap();
        assert_eq!(
            next_event(&mut p.rx).await,
            StreamEvent::SignalingError {
                sid: p.sid.clone(),
                peer: p.peer.clone(),
                error: StreamError::NotAllowed,
            }
        );
        assert_eq!(p.manager.session_count().await, 0);
        assert_eq!(p.manager.correlation_count().await, 0);
    }

    #[tokio::test]
    async fn activation_times_out() {
        let config = ManagerConfig {
            negotiation_timeout: Duration::from_millis(300),
            cleanup_interval: Duration::from_millis(20),
            ..ManagerConfig::default()
        };
        let mut p = proxied(config).await;

        assert_eq!(
            next_event(&mut p.rx).await,
            StreamEvent::Failed {
                sid: p.sid.clone(),
                peer: p.peer.clone(),
                direction: Direction::Outgoing,
                error: StreamError::TimedOut,
            }
        );
        assert_eq!(p.manager.session_count().await, 0);
        assert_eq!(p.manager.correlation_count().await, 0);
        assert_eq!(p.transport.sent().len(), 2, "activation timeout sends nothing");
    }

    #[tokio::test]
    async fn dispose_releases_established_session() {
        let mut p = proxied(ManagerConfig::default()).await;
        p.manager
            .handle_iq(p.proxy_jid.clone(), Iq::ack(p.activation_id.clone()))
            .await
            .unwrap();
        next_event(&mut p.rx).await;
        assert_eq!(p.manager.session_count().await, 1);

        p.manager.dispose(&p.sid).await;
        assert_eq!(p.manager.session_count().await, 0);
        assert!(!p.manager.has_session(&p.sid).await);
        p.manager.dispose(&p.sid).await;
        assert_eq!(p.manager.session_count().await, 0);
        assert!(p.manager.take_session(&p.sid).await.is_none());
        assert_eq!(p.transport.sent().len(), 2, "dispose sends nothing");
        assert!(p.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dispose_during_activation_ignores_late_result() {
        let mut p = proxied(ManagerConfig::default()).await;

        p.manager.dispose(&p.sid).await;
        assert_eq!(p.manager.session_count().await, 0);
        assert_eq!(p.manager.correlation_count().await, 0);

        p.manager
            .handle_iq(p.proxy_jid.clone(), Iq::ack(p.activation_id.clone()))
            .await
            .unwrap();
        assert_eq!(p.manager.session_count().await, 0);
        assert!(p.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dispose_releases_pending_offer_and_hash() {
        let server = local_server().await;
        let own = jid("a@b.com/x");
        let transport = RecordingTransport::new(own.as_str());
        let (handler, mut rx) = ChannelHandler::new(16);
        let manager = StreamManager::builder(ManagerConfig::default())
            .transport(transport.clone())
            .server(server.clone())
            .handler(Arc::new(handler))
            .spawn();
        let peer = jid("c@d.com/y");
        let host = StreamHost::new(own.clone(), "127.0.0.1", server.local_addr().port());
        let sid = manager.offer_stream(&peer, vec![host], None).await.unwrap();
        assert_eq!(server.pending_hash_count().await, 1);
        assert_eq!(manager.correlation_count().await, 1);

        manager.dispose(&sid).await;
        assert_eq!(server.pending_hash_count().await, 0);
        assert_eq!(manager.pending_count().await, 0);
        assert_eq!(manager.correlation_count().await, 0);
        manager.dispose(&sid).await;
        assert_eq!(server.pending_hash_count().await, 0);

        // The peer's answer arrives after the fact.
        let open_id = transport.sent()[0].1.id.clone();
        manager.handle_iq(peer, Iq::stream_host_used(open_id, own)).await.unwrap();
        assert_eq!(manager.session_count().await, 0);
        assert_eq!(transport.sent().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn incoming_offer_timing_out_while_connecting_is_answered() {
        // Accepts at the TCP level but never speaks SOCKS5.
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let transport = RecordingTransport::new("c@d.com/y");
        let (handler, mut rx) = ChannelHandler::new(16);
        let config = ManagerConfig {
            negotiation_timeout: Duration::from_millis(300),
            cleanup_interval: Duration::from_millis(20),
            ..ManagerConfig::default()
        };
        let manager = StreamManager::builder(config)
            .transport(transport.clone())
            .handler(Arc::new(handler))
            .spawn();
        let peer = jid("a@b.com/x");
        let host = StreamHost::new(jid("proxy.b.com"), "127.0.0.1", port);

        manager
            .handle_iq(peer.clone(), Iq::offer("req1", "sid-t", StreamMode::Tcp, vec![host]))
            .await
            .unwrap();
        assert!(matches!(next_event(&mut rx).await, StreamEvent::IncomingOffer(_)));
        manager.accept_offer("sid-t").await.unwrap();

        assert_eq!(
            next_event(&mut rx).await,
            StreamEvent::Failed {
                sid: "sid-t".into(),
                peer: peer.clone(),
                direction: Direction::Incoming,
                error: StreamError::TimedOut,
            }
        );
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], (peer, Iq::error("req1", StreamError::TimedOut)));
        assert_eq!(manager.pending_count().await, 0);
        drop(silent);
    }

    #[tokio::test]
    async fn failed_activation_send_cancels_session() {
        let proxy = local_server().await;
        let proxy_jid = jid("proxy.d.com");
        let own = jid("a@b.com/x");
        let peer = jid("c@d.com/y");
        let transport = RecordingTransport::new(own.as_str());
        let (manager, mut rx) = manager(transport.clone());
        proxy.register_hash(&rendezvous_hash("sid-f", &own, &peer)).await.unwrap();
        let host = StreamHost::new(proxy_jid.clone(), "127.0.0.1", proxy.local_addr().port());
        manager.offer_stream(&peer, vec![host], Some("sid-f")).await.unwrap();

        transport.fail.store(true, Ordering::SeqCst);
        let open_id = transport.sent()[0].1.id.clone();
        manager.handle_iq(peer.clone(), Iq::stream_host_used(open_id, proxy_jid)).await.unwrap();

        assert_eq!(
            next_event(&mut rx).await,
            StreamEvent::Failed {
                sid: "sid-f".into(),
                peer,
                direction: Direction::Outgoing,
                error: StreamError::Cancelled,
            }
        );
        assert_eq!(manager.session_count().await, 0);
        assert_eq!(manager.correlation_count().await, 0);
    }
}

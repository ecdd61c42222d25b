//! Collaborator trait definitions.
//!
//! The stream manager talks to the world through these seams:
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Signaling | [`SignalingTransport`] | Send IQ stanzas, mint ids, know our own JID |
//! | Relay | [`RelaySession`] / [`RelayConnector`] | Own the raw connection once negotiated |
//! | Application | [`StreamHandler`] | Decide on offers, learn outcomes |
//!
//! Traits live here, apart from their implementations, so the manager only
//! depends on behaviour and tests can substitute any of them.

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::identity::Jid;
use crate::messages::{Iq, StreamError, StreamHost};
use crate::relay::RelayError;

/// Outbound half of the XMPP stream.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Our own full JID as the peer sees it.
    fn own_jid(&self) -> Jid;

    /// A correlation id unique for the lifetime of the stream.
    fn next_id(&self) -> String;

    /// Queue `iq` for delivery to `to`. Must not wait for the peer's reply.
    async fn send(&self, to: &Jid, iq: Iq) -> Result<()>;
}

/// Owner of one raw bytestream connection. Held inside the manager actor,
/// which is shared across `.await` points, hence `Sync`.
#[async_trait]
pub trait RelaySession: Send + Sync + 'static {
    fn sid(&self) -> &str;

    fn set_stream_hosts(&mut self, hosts: Vec<StreamHost>);

    /// Try the stream hosts and keep the first connection that completes
    /// the SOCKS5 handshake. Returns the host used.
    async fn connect(&mut self) -> Result<StreamHost, RelayError>;

    /// Adopt a connection established elsewhere (self-proxy).
    fn attach(&mut self, stream: TcpStream, host: StreamHost);

    /// The host this session is connected through, once connected.
    fn stream_host(&self) -> Option<&StreamHost>;

    fn activate(&mut self);

    fn is_active(&self) -> bool;

    /// Hand the raw connection to the caller.
    fn take_stream(&mut self) -> Option<TcpStream>;
}

/// Builds relay sessions for the manager.
pub trait RelayConnector: Send + Sync + 'static {
    /// `hash` is the rendezvous hash the session must present to proxies.
    fn create(&self, sid: &str, peer: &Jid, hash: String) -> Box<dyn RelaySession>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// An offer received from a peer, awaiting an accept/reject decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingOffer {
    pub sid: String,
    pub peer: Jid,
    pub hosts: Vec<StreamHost>,
}

/// Application callbacks. Called from the manager actor, so they must not
/// block; hand work off to a task or channel.
pub trait StreamHandler: Send + Sync + 'static {
    fn incoming_offer(&self, offer: IncomingOffer);

    fn stream_established(&self, sid: &str, peer: &Jid, direction: Direction);

    fn stream_failed(&self, sid: &str, peer: &Jid, direction: Direction, error: StreamError);

    /// The peer answered one of our requests with an error stanza.
    fn signaling_error(&self, sid: &str, peer: &Jid, error: StreamError);
}

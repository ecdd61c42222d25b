//! # s5b - SOCKS5 Bytestream Negotiation
//!
//! Establishes raw TCP bytestreams between two XMPP entities (XEP-0065):
//!
//! - **Signaling**: offers, stream-host selection and activation exchanged as IQ stanzas
//! - **Rendezvous**: both sides derive `hex(sha1(sid || initiator || target))` and
//!   present it as the SOCKS5 destination, which pairs the raw connection with
//!   its session
//! - **Server**: a minimal SOCKS5 endpoint that accepts connections only for
//!   registered rendezvous hashes
//! - **Relay**: a SOCKS5 client that walks the candidate hosts in order
//!
//! ## Architecture
//!
//! Stateful components use the **Actor Pattern**:
//! - `NegotiationServer` and `StreamManager` are cheap-to-clone handles
//! - Their actors own all mutable state and process commands sequentially
//! - Dropping every handle stops the actor
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | JID newtype and validation |
//! | `crypto` | Rendezvous hash and session id generation |
//! | `messages` | IQ stanza types, error condition table, bounded codec |
//! | `socks5` | SOCKS5 subset: server state machine, frames, client handshake |
//! | `server` | Hash-registering SOCKS5 listener |
//! | `protocols` | Collaborator traits (transport, relay, application handler) |
//! | `relay` | Default SOCKS5 relay session |
//! | `manager` | Signaling orchestration and correlation tracking |

mod crypto;
mod identity;
mod manager;
mod messages;
mod protocols;
mod relay;
mod server;
pub mod socks5;

pub use crypto::{
    generate_sid, is_rendezvous_hash, rendezvous_hash, CryptoError, RENDEZVOUS_HASH_LEN,
};
pub use identity::{Jid, JidError};
pub use manager::{
    ChannelHandler, ManagerConfig, ManagerError, Refused, StreamEvent, StreamManager,
    StreamManagerBuilder,
};
pub use messages::{
    decode_iq, encode_iq, Condition, ErrorType, Iq, IqPayload, IqType, StanzaError, StreamError,
    StreamHost, StreamMode,
};
pub use protocols::{
    Direction, IncomingOffer, RelayConnector, RelaySession, SignalingTransport, StreamHandler,
};
pub use relay::{RelayError, Socks5Connector, Socks5Relay};
pub use server::{NegotiationServer, RejectReason, ServerConfig, ServerError, ServerEvent};

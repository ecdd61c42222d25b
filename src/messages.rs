//! # Signaling Messages
//!
//! Typed form of the IQ stanzas that carry a SOCKS5 bytestream negotiation
//! (XEP-0065). Rendering to and from XML belongs to the stanza layer that
//! owns the XMPP stream; this module only fixes the shapes and the error
//! taxonomy so that every decision is made on closed enums.
//!
//! | Exchange | Request (`Set`) | Success reply (`Result`) |
//! |----------|-----------------|--------------------------|
//! | Open | [`IqPayload::Query`] to the peer | [`IqPayload::StreamHostUsed`] |
//! | Activate | [`IqPayload::Activate`] to the proxy | [`IqPayload::Empty`] |
//!
//! Failures travel as `Error` + [`IqPayload::Error`]; the mapping between a
//! [`StreamError`] and its `(ErrorType, Condition)` pair lives in one table
//! ([`ERROR_TABLE`]) used in both directions.
//!
//! ## Codec
//!
//! Transports that move stanzas over byte channels use [`encode_iq`] and
//! [`decode_iq`]. Decoding is bounded by [`MAX_DESERIALIZE_SIZE`] and
//! rejects offers with more than [`MAX_STREAM_HOSTS`] candidates.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::identity::Jid;

/// Largest accepted encoded stanza.
pub const MAX_DESERIALIZE_SIZE: u64 = 64 * 1024;

/// Largest candidate list accepted in one offer.
pub const MAX_STREAM_HOSTS: usize = 32;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

pub fn encode_iq(iq: &Iq) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(iq)
}

pub fn decode_iq(bytes: &[u8]) -> Result<Iq, bincode::Error> {
    let iq: Iq = bincode_options().deserialize(bytes)?;
    if let IqPayload::Query { hosts, .. } = &iq.payload {
        if hosts.len() > MAX_STREAM_HOSTS {
            return Err(Box::new(bincode::ErrorKind::Custom(format!(
                "offer carries {} stream hosts (max {})",
                hosts.len(),
                MAX_STREAM_HOSTS
            ))));
        }
    }
    Ok(iq)
}


// ============================================================================
// Stream hosts and offers
// ============================================================================

/// A candidate endpoint for the raw connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamHost {
    pub identity: Jid,
    pub host: String,
    pub port: u16,
}

impl StreamHost {
    pub fn new(identity: Jid, host: impl Into<String>, port: u16) -> Self {
        Self { identity, host: host.into(), port }
    }

    /// `host:port` form, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Transport mode requested by an offer. Only TCP is served.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamMode {
    Tcp,
    Udp,
}


// ============================================================================
// IQ stanzas
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IqPayload {
    /// Offer: candidate hosts for session `sid`.
    Query {
        sid: String,
        mode: StreamMode,
        hosts: Vec<StreamHost>,
    },
    /// Target's answer naming the candidate it connected to.
    StreamHostUsed { jid: Jid },
    /// Ask a proxy to start relaying `sid` towards `target`.
    Activate { sid: String, target: Jid },
    Error(StanzaError),
    Empty,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iq {
    pub id: String,
    pub kind: IqType,
    pub payload: IqPayload,
}

impl Iq {
    pub fn offer(
        id: impl Into<String>,
        sid: &str,
        mode: StreamMode,
        hosts: Vec<StreamHost>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: IqType::Set,
            payload: IqPayload::Query { sid: sid.to_string(), mode, hosts },
        }
    }

    pub fn stream_host_used(id: impl Into<String>, jid: Jid) -> Self {
        Self {
            id: id.into(),
            kind: IqType::Result,
            payload: IqPayload::StreamHostUsed { jid },
        }
    }

    pub fn activate(id: impl Into<String>, sid: &str, target: Jid) -> Self {
        Self {
            id: id.into(),
            kind: IqType::Set,
            payload: IqPayload::Activate { sid: sid.to_string(), target },
        }
    }

    pub fn ack(id: impl Into<String>) -> Self {
        Self { id: id.into(), kind: IqType::Result, payload: IqPayload::Empty }
    }

    pub fn error(id: impl Into<String>, error: StreamError) -> Self {
        Self {
            id: id.into(),
            kind: IqType::Error,
            payload: IqPayload::Error(error.to_stanza_error()),
        }
    }
}


// ============================================================================
// Error taxonomy
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
    Auth,
    Cancel,
    Modify,
    Wait,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    ItemNotFound,
    NotAcceptable,
    NotAllowed,
    RemoteServerTimeout,
    ServiceUnavailable,
    UndefinedCondition,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StanzaError {
    pub kind: ErrorType,
    pub condition: Condition,
    pub text: Option<String>,
}

/// Why a negotiation did not succeed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamError {
    /// A relay session to this peer already exists.
    AlreadyStreaming,
    /// Malformed or unsupported offer.
    Unacceptable,
    /// Declined by the application, or the peer is not authorised.
    Forbidden,
    /// Disabled by local policy.
    NotAllowed,
    /// Mode or feature not supported.
    NotImplemented,
    /// None of the candidate hosts could be reached.
    ItemNotFound,
    /// Local only: no answer before the negotiation deadline.
    TimedOut,
    /// Local only: the manager was shut down or the session disposed.
    Cancelled,
    /// An inbound condition outside the table.
    Undefined,
}

/// Wire mapping for every [`StreamError`] that may be sent to a peer.
/// Parsing walks the same table by condition, first match wins.
pub const ERROR_TABLE: &[(StreamError, ErrorType, Condition)] = &[
    (StreamError::AlreadyStreaming, ErrorType::Cancel, Condition::Conflict),
    (StreamError::Unacceptable, ErrorType::Modify, Condition::NotAcceptable),
    (StreamError::Forbidden, ErrorType::Auth, Condition::Forbidden),
    (StreamError::NotAllowed, ErrorType::Cancel, Condition::NotAllowed),
    (StreamError::NotImplemented, ErrorType::Cancel, Condition::FeatureNotImplemented),
    (StreamError::ItemNotFound, ErrorType::Cancel, Condition::ItemNotFound),
    (StreamError::TimedOut, ErrorType::Wait, Condition::RemoteServerTimeout),
];

impl StreamError {
    pub fn to_stanza_error(self) -> StanzaError {
        let (kind, condition) = ERROR_TABLE
            .iter()
            .find(|(error, _, _)| *error == self)
            .map(|(_, kind, condition)| (*kind, *condition))
            .unwrap_or((ErrorType::Cancel, Condition::UndefinedCondition));
        StanzaError { kind, condition, text: None }
    }

    pub fn from_stanza_error(error: &StanzaError) -> Self {
        ERROR_TABLE
            .iter()
            .find(|(_, _, condition)| *condition == error.condition)
            .map(|(kind, _, _)| *kind)
            .unwrap_or(StreamError::Undefined)
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::AlreadyStreaming => {
                write!(f, "a bytestream with this peer already exists")
            }
            StreamError::Unacceptable => write!(f, "offer not acceptable"),
            StreamError::Forbidden => write!(f, "forbidden"),
            StreamError::NotAllowed => write!(f, "not allowed"),
            StreamError::NotImplemented => write!(f, "feature not implemented"),
            StreamError::ItemNotFound => write!(f, "no stream host reachable"),
            StreamError::TimedOut => write!(f, "negotiation timed out"),
            StreamError::Cancelled => write!(f, "negotiation cancelled"),
            StreamError::Undefined => write!(f, "undefined error condition"),
        }
    }
}

impl std::error::Error for StreamError {}

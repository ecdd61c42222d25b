//! # Peer Identity
//!
//! Entities taking part in a bytestream negotiation are addressed by their
//! full JID (`node@domain/resource`). The full form matters: the rendezvous
//! hash is computed over the exact strings both sides see, so a bare JID on
//! one side and a full JID on the other produce different hashes and the
//! raw connection never binds.
//!
//! ## Invariants
//!
//! - I1: `Jid::from_str(s)?.as_str() == s` (no normalisation is applied)
//! - I2: a `Jid` is never empty, never contains whitespace, and always has a domain

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum accepted JID length (RFC 7622 caps each part at 1023 bytes).
pub const MAX_JID_LEN: usize = 3071;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JidError {
    Empty,
    TooLong,
    Whitespace,
    MissingDomain,
    EmptyResource,
}

impl fmt::Display for JidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JidError::Empty => write!(f, "JID is empty"),
            JidError::TooLong => write!(f, "JID exceeds {} bytes", MAX_JID_LEN),
            JidError::Whitespace => write!(f, "JID contains whitespace"),
            JidError::MissingDomain => write!(f, "JID has no domain part"),
            JidError::EmptyResource => write!(f, "JID has an empty resource part"),
        }
    }
}

impl std::error::Error for JidError {}

/// An XMPP address identifying one peer (or one proxy service).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid(String);

impl Jid {
    pub fn new(value: impl Into<String>) -> Result<Self, JidError> {
        let value = value.into();
        Self::validate(&value)?;
        Ok(Self(value))
    }

    fn validate(value: &str) -> Result<(), JidError> {
        if value.is_empty() {
            return Err(JidError::Empty);
        }
        if value.len() > MAX_JID_LEN {
            return Err(JidError::TooLong);
        }
        if value.chars().any(char::is_whitespace) {
            return Err(JidError::Whitespace);
        }

        let (bare, resource) = match value.split_once('/') {
            Some((bare, resource)) => (bare, Some(resource)),
            None => (value, None),
        };
        if resource == Some("") {
            return Err(JidError::EmptyResource);
        }
        let domain = match bare.rsplit_once('@') {
            Some((_, domain)) => domain,
            None => bare,
        };
        if domain.is_empty() {
            return Err(JidError::MissingDomain);
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The JID without its resource.
    pub fn bare(&self) -> &str {
        match self.0.split_once('/') {
            Some((bare, _)) => bare,
            None => &self.0,
        }
    }

    pub fn resource(&self) -> Option<&str> {
        self.0.split_once('/').map(|(_, resource)| resource)
    }

    pub fn is_full(&self) -> bool {
        self.resource().is_some()
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Jid {
    type Error = JidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.0
    }
}

impl AsRef<str> for Jid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

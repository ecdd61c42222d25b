//! # Rendezvous Hashing and Session Ids
//!
//! A SOCKS5 CONNECT carries no session id, only a destination "domain
//! name". Both ends of a bytestream therefore compute the same value
//! independently and use it as that domain name:
//!
//! ```text
//! hash = hex(SHA1(sid || initiator_full_jid || target_full_jid))
//! ```
//!
//! The result is always 40 lowercase ASCII hex characters, which is exactly
//! what the raw-side parser expects in the CONNECT frame.

use sha1::{Digest, Sha1};

use crate::identity::Jid;

/// Length of a hex-encoded SHA-1 digest.
pub const RENDEZVOUS_HASH_LEN: usize = 40;

/// Number of random bytes in a generated session id (hex-encoded to 32 chars).
pub const SID_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoError {
    pub code: Option<u32>,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "CSPRNG unavailable (error code {})", code),
            None => write!(f, "CSPRNG unavailable"),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<getrandom::Error> for CryptoError {
    fn from(err: getrandom::Error) -> Self {
        Self { code: Some(err.code().get()) }
    }
}

/// Compute the value binding an anonymous raw connection to its negotiation.
pub fn rendezvous_hash(sid: &str, initiator: &Jid, target: &Jid) -> String {
    let mut hasher = Sha1::new();
    hasher.update(sid.as_bytes());
    hasher.update(initiator.as_str().as_bytes());
    hasher.update(target.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// True if `candidate` has the shape of a rendezvous hash.
///
/// Upper-case hex is accepted; peers are not required to lower-case their
/// digest and the CONNECT frame is matched byte-for-byte anyway.
pub fn is_rendezvous_hash(candidate: &str) -> bool {
    candidate.len() == RENDEZVOUS_HASH_LEN
        && candidate.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Generate a fresh random session id.
pub fn generate_sid() -> Result<String, CryptoError> {
    let mut id = [0u8; SID_BYTES];
    getrandom::getrandom(&mut id)?;
    Ok(hex::encode(id))
}

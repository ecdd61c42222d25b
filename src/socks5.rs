//! # Constrained SOCKS5
//!
//! The raw side of a bytestream speaks a narrow slice of RFC 1928: no-auth
//! only, CONNECT only, DOMAINNAME only, where the "domain" is the 40-char
//! rendezvous hash and the port is always zero. Replies to the request are
//! the two-byte form used by XEP-0065 rather than the full RFC reply.
//!
//! ```text
//! greeting   05 N m1..mN            -> 05 00 | 05 FF
//! request    05 01 00 03 28 <40 hex> 00 00  (47 bytes)
//!                                    -> 05 00 | 05 01
//! ```
//!
//! [`Negotiation`] is the server-side state machine. It is pure: it consumes
//! one chunk of input per call and never indexes past what it was given.
//! The registry lookup that decides the outcome of a well-formed request is
//! left to the caller through [`Negotiation::resolve`].
//!
//! [`connect`] is the client side used by relay sessions.

use std::fmt;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::crypto::RENDEZVOUS_HASH_LEN;

pub const SOCKS5_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NOT_ACCEPTABLE: u8 = 0xFF;
pub const CMD_CONNECT: u8 = 0x01;
pub const RESERVED: u8 = 0x00;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;

/// Smallest greeting we evaluate: version, count, one method.
pub const MIN_GREETING_LEN: usize = 3;

/// Fixed size of the CONNECT request: 5 header bytes, hash, 2 port bytes.
pub const CONNECT_FRAME_LEN: usize = 5 + RENDEZVOUS_HASH_LEN + 2;

const HASH_OFFSET: usize = 5;

pub const AUTH_ACCEPTED: [u8; 2] = [SOCKS5_VERSION, METHOD_NO_AUTH];
pub const AUTH_REJECTED: [u8; 2] = [SOCKS5_VERSION, METHOD_NOT_ACCEPTABLE];
pub const REQUEST_GRANTED: [u8; 2] = [SOCKS5_VERSION, REPLY_SUCCEEDED];
pub const REQUEST_FAILED: [u8; 2] = [SOCKS5_VERSION, REPLY_GENERAL_FAILURE];


// ============================================================================
// Server-side state machine
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Unnegotiated,
    AuthAccepted,
    DestinationAccepted,
    Disconnected,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::DestinationAccepted | ConnectionState::Disconnected)
    }
}

/// What the caller must do after feeding a chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Write these bytes back. If the machine is now `Disconnected` the
    /// connection must be closed afterwards.
    Reply([u8; 2]),
    /// A well-formed request named this hash; call [`Negotiation::resolve`]
    /// with the registry verdict and write the reply it returns.
    Destination(String),
    /// The machine no longer interprets input on this connection.
    Ignore,
}

#[derive(Debug)]
pub struct Negotiation {
    state: ConnectionState,
}

impl Default for Negotiation {
    fn default() -> Self {
        Self::new()
    }
}

impl Negotiation {
    pub fn new() -> Self {
        Self { state: ConnectionState::Unnegotiated }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn advance(&mut self, input: &[u8]) -> Step {
        match self.state {
            ConnectionState::Unnegotiated => {
                if greeting_offers_no_auth(input) {
                    self.state = ConnectionState::AuthAccepted;
                    Step::Reply(AUTH_ACCEPTED)
                } else {
                    self.state = ConnectionState::Disconnected;
                    Step::Reply(AUTH_REJECTED)
                }
            }
            ConnectionState::AuthAccepted => match parse_connect(input) {
                Some(hash) => Step::Destination(hash),
                None => {
                    self.state = ConnectionState::Disconnected;
                    Step::Reply(REQUEST_FAILED)
                }
            },
            ConnectionState::DestinationAccepted | ConnectionState::Disconnected => Step::Ignore,
        }
    }

    /// Settle a pending [`Step::Destination`]. Has no effect outside
    /// `AuthAccepted`.
    pub fn resolve(&mut self, registered: bool) -> [u8; 2] {
        if self.state != ConnectionState::AuthAccepted {
            return REQUEST_FAILED;
        }
        if registered {
            self.state = ConnectionState::DestinationAccepted;
            REQUEST_GRANTED
        } else {
            self.state = ConnectionState::Disconnected;
            REQUEST_FAILED
        }
    }

    /// Force the machine into its failed terminal state.
    pub fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
    }
}

/// The declared method count is clamped to the bytes actually present.
fn greeting_offers_no_auth(input: &[u8]) -> bool {
    if input.len() < MIN_GREETING_LEN || input[0] != SOCKS5_VERSION {
        return false;
    }
    let declared = input[1] as usize;
    let available = input.len() - 2;
    input[2..2 + declared.min(available)].contains(&METHOD_NO_AUTH)
}

/// Returns the hash of an exact 47-byte CONNECT frame.
pub fn parse_connect(input: &[u8]) -> Option<String> {
    if input.len() != CONNECT_FRAME_LEN {
        return None;
    }
    let header = [SOCKS5_VERSION, CMD_CONNECT, RESERVED, ATYP_DOMAIN, RENDEZVOUS_HASH_LEN as u8];
    if input[..HASH_OFFSET] != header {
        return None;
    }
    let hash = &input[HASH_OFFSET..HASH_OFFSET + RENDEZVOUS_HASH_LEN];
    if input[HASH_OFFSET + RENDEZVOUS_HASH_LEN..] != [0u8, 0u8] {
        return None;
    }
    if !hash.iter().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    // All bytes are ASCII hex, so this cannot fail.
    String::from_utf8(hash.to_vec()).ok()
}


// ============================================================================
// Frame builders
// ============================================================================

pub fn greeting_frame() -> [u8; 3] {
    [SOCKS5_VERSION, 1, METHOD_NO_AUTH]
}

pub fn connect_frame(hash: &str) -> Result<Vec<u8>, Socks5Error> {
    if !crate::crypto::is_rendezvous_hash(hash) {
        return Err(Socks5Error::InvalidHash);
    }
    let mut frame = Vec::with_capacity(CONNECT_FRAME_LEN);
    frame.extend_from_slice(&[
        SOCKS5_VERSION,
        CMD_CONNECT,
        RESERVED,
        ATYP_DOMAIN,
        RENDEZVOUS_HASH_LEN as u8,
    ]);
    frame.extend_from_slice(hash.as_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    Ok(frame)
}


// ============================================================================
// Client handshake
// ============================================================================

#[derive(Debug)]
pub enum Socks5Error {
    Io(io::Error),
    Timeout,
    InvalidHash,
    /// The server refused every offered auth method.
    AuthRejected,
    /// The server refused the CONNECT with this reply code.
    RequestRejected(u8),
    /// The reply did not start with the SOCKS5 version byte.
    Protocol,
}

impl fmt::Display for Socks5Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Socks5Error::Io(e) => write!(f, "socks5 I/O error: {}", e),
            Socks5Error::Timeout => write!(f, "socks5 handshake timed out"),
            Socks5Error::InvalidHash => write!(f, "destination is not a 40-char hex hash"),
            Socks5Error::AuthRejected => write!(f, "socks5 server rejected no-auth"),
            Socks5Error::RequestRejected(code) => {
                write!(f, "socks5 server rejected request (reply 0x{:02x})", code)
            }
            Socks5Error::Protocol => write!(f, "malformed socks5 reply"),
        }
    }
}

impl std::error::Error for Socks5Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Socks5Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Socks5Error {
    fn from(err: io::Error) -> Self {
        Socks5Error::Io(err)
    }
}

/// Connect to `host:port` and bind the connection to `hash`.
///
/// On success the returned stream carries payload only.
pub async fn connect(
    host: &str,
    port: u16,
    hash: &str,
    timeout: Duration,
) -> Result<TcpStream, Socks5Error> {
    let request = connect_frame(hash)?;
    tokio::time::timeout(timeout, async {
        let mut stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        handshake(&mut stream, &request).await?;
        Ok::<_, Socks5Error>(stream)
    })
    .await
    .map_err(|_| Socks5Error::Timeout)?
}

async fn handshake(stream: &mut TcpStream, request: &[u8]) -> Result<(), Socks5Error> {
    let mut reply = [0u8; 2];

    stream.write_all(&greeting_frame()).await?;
    stream.read_exact(&mut reply).await?;
    trace!(reply = ?reply, "socks5 method reply");
    match reply {
        AUTH_ACCEPTED => {}
        [SOCKS5_VERSION, _] => return Err(Socks5Error::AuthRejected),
        _ => return Err(Socks5Error::Protocol),
    }

    stream.write_all(request).await?;
    stream.read_exact(&mut reply).await?;
    trace!(reply = ?reply, "socks5 request reply");
    match reply {
        REQUEST_GRANTED => Ok(()),
        [SOCKS5_VERSION, code] => Err(Socks5Error::RequestRejected(code)),
        _ => Err(Socks5Error::Protocol),
    }
}

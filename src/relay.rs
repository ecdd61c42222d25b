//! # SOCKS5 Relay Sessions
//!
//! Default [`RelaySession`] implementation. A session is created by the
//! manager once a negotiation needs a raw connection, and owns that
//! connection until the application takes it or the session is disposed.
//!
//! Candidate selection lives here, not in the manager: [`Socks5Relay::connect`]
//! walks its stream hosts in order and keeps the first one whose SOCKS5
//! handshake succeeds. Each attempt is bounded by the connector's
//! `connect_timeout`.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::identity::Jid;
use crate::messages::StreamHost;
use crate::protocols::{RelayConnector, RelaySession};
use crate::socks5;

/// Per-candidate budget for TCP connect plus handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum RelayError {
    NoStreamHosts,
    /// Every candidate failed; the last error is kept.
    Unreachable { attempts: usize, last: socks5::Socks5Error },
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::NoStreamHosts => write!(f, "no stream hosts to connect to"),
            RelayError::Unreachable { attempts, last } => {
                write!(f, "all {} stream hosts failed, last error: {}", attempts, last)
            }
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::Unreachable { last, .. } => Some(last),
            RelayError::NoStreamHosts => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Socks5Connector {
    pub connect_timeout: Duration,
}

impl Default for Socks5Connector {
    fn default() -> Self {
        Self { connect_timeout: DEFAULT_CONNECT_TIMEOUT }
    }
}

impl RelayConnector for Socks5Connector {
    fn create(&self, sid: &str, peer: &Jid, hash: String) -> Box<dyn RelaySession> {
        Box::new(Socks5Relay::new(sid, peer.clone(), hash, self.connect_timeout))
    }
}

pub struct Socks5Relay {
    sid: String,
    peer: Jid,
    hash: String,
    connect_timeout: Duration,
    hosts: Vec<StreamHost>,
    stream: Option<TcpStream>,
    used: Option<StreamHost>,
    active: bool,
}

impl fmt::Debug for Socks5Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socks5Relay")
            .field("sid", &self.sid)
            .field("peer", &self.peer)
            .field("used", &self.used)
            .field("active", &self.active)
            .finish()
    }
}

impl Socks5Relay {
    pub fn new(sid: &str, peer: Jid, hash: String, connect_timeout: Duration) -> Self {
        Self {
            sid: sid.to_string(),
            peer,
            hash,
            connect_timeout,
            hosts: Vec::new(),
            stream: None,
            used: None,
            active: false,
        }
    }
}

#[async_trait]
impl RelaySession for Socks5Relay {
    fn sid(&self) -> &str {
        &self.sid
    }

    fn set_stream_hosts(&mut self, hosts: Vec<StreamHost>) {
        self.hosts = hosts;
    }

    async fn connect(&mut self) -> Result<StreamHost, RelayError> {
        let mut last = None;
        for (attempt, host) in self.hosts.iter().enumerate() {
            debug!(
                sid = %self.sid,
                host = %host.address(),
                identity = %host.identity,
                attempt = attempt + 1,
                "connecting to stream host"
            );
            match socks5::connect(&host.host, host.port, &self.hash, self.connect_timeout).await {
                Ok(stream) => {
                    info!(sid = %self.sid, host = %host.address(), "stream host connected");
                    self.stream = Some(stream);
                    self.used = Some(host.clone());
                    return Ok(host.clone());
                }
                Err(e) => {
                    debug!(
                        sid = %self.sid,
                        host = %host.address(),
                        error = %e,
                        "stream host failed"
                    );
                    last = Some(e);
                }
            }
        }
        match last {
            Some(last) => Err(RelayError::Unreachable { attempts: self.hosts.len(), last }),
            None => Err(RelayError::NoStreamHosts),
        }
    }

    fn attach(&mut self, stream: TcpStream, host: StreamHost) {
        self.stream = Some(stream);
        self.used = Some(host);
    }

    fn stream_host(&self) -> Option<&StreamHost> {
        self.used.as_ref()
    }

    fn activate(&mut self) {
        if !self.active {
            debug!(sid = %self.sid, peer = %self.peer, "bytestream active");
        }
        self.active = true;
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn take_stream(&mut self) -> Option<TcpStream> {
        self.stream.take()
    }
}

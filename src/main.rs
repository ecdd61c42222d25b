use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io;
use tokio::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use s5b::{rendezvous_hash, Jid, NegotiationServer, ServerConfig, ServerEvent};

/// A session the endpoint should accept, as `SID/INITIATOR/TARGET`.
#[derive(Clone, Debug)]
struct Expected {
    sid: String,
    initiator: Jid,
    target: Jid,
}

impl FromStr for Expected {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (sid, rest) = s
            .split_once('/')
            .context("expected session must have the form SID/INITIATOR/TARGET")?;
        if sid.is_empty() {
            anyhow::bail!("session id must not be empty");
        }
        let (initiator, target) = split_jids(rest)
            .context("expected session must name both INITIATOR and TARGET")?;

        Ok(Expected {
            sid: sid.to_string(),
            initiator: initiator.parse().context("invalid initiator JID")?,
            target: target.parse().context("invalid target JID")?,
        })
    }
}

/// Split `INITIATOR/TARGET` where either side may itself contain one `/`.
/// The target starts at the first segment after the initiator that holds an '@'
/// or, failing that, at the last '/'.
fn split_jids(s: &str) -> Option<(&str, &str)> {
    let slashes: Vec<usize> = s.match_indices('/').map(|(i, _)| i).collect();
    let split = slashes
        .iter()
        .copied()
        .find(|&i| s[i + 1..].split('/').next().map_or(false, |seg| seg.contains('@')))
        .or_else(|| slashes.last().copied())?;
    let (initiator, target) = (&s[..split], &s[split + 1..]);
    if initiator.is_empty() || target.is_empty() {
        return None;
    }
    Some((initiator, target))
}

#[derive(Parser, Debug)]
#[command(name = "s5b")]
/// SOCKS5 bytestream endpoint that echoes bound connections.
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:1080")]
    bind: SocketAddr,

    /// Session to accept, as SID/INITIATOR/TARGET. Repeatable.
    #[arg(short = 'e', long = "expect", value_name = "SESSION")]
    expect: Vec<Expected>,

    /// Seconds a client gets to finish the SOCKS5 handshake.
    #[arg(long, default_value = "10")]
    handshake_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = ServerConfig {
        handshake_timeout: Duration::from_secs(args.handshake_timeout),
        ..ServerConfig::default()
    };
    let server = NegotiationServer::listen(args.bind, config)
        .await
        .context("failed to start negotiation server")?;
    info!(addr = %server.local_addr(), "listening");

    for expected in &args.expect {
        let hash = rendezvous_hash(&expected.sid, &expected.initiator, &expected.target);
        server.register_hash(&hash).await?;
        info!(
            sid = %expected.sid,
            initiator = %expected.initiator,
            target = %expected.target,
            hash = %hash,
            "expecting session"
        );
    }

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            event = server.poll(Duration::from_secs(1)) => {
                match event? {
                    Some(ServerEvent::Bound { hash, peer }) => {
                        let Some(mut stream) = server.get_connection(&hash).await else {
                            warn!(hash = %hash, "bound connection vanished before claim");
                            continue;
                        };
                        info!(hash = %hash, peer = %peer, "session bound, echoing");
                        tokio::spawn(async move {
                            let (mut reader, mut writer) = stream.split();
                            match io::copy(&mut reader, &mut writer).await {
                                Ok(bytes) => debug!(peer = %peer, bytes, "echo finished"),
                                Err(e) => debug!(peer = %peer, error = %e, "echo failed"),
                            }
                        });
                    }
                    Some(ServerEvent::Rejected { peer, reason }) => {
                        info!(peer = %peer, reason = ?reason, "connection rejected");
                    }
                    Some(ServerEvent::Accepted { peer }) => {
                        debug!(peer = %peer, "connection accepted");
                    }
                    None => {}
                }
            }
        }
    }

    server.stop().await;
    Ok(())
}

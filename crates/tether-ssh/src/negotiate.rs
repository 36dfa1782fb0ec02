//! Transport negotiation: direct socket first, SSH tunnel second

use crate::connection::ByteStream;
use crate::transport::RemoteShell;
use crate::TransportError;
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Opens direct sockets to the relay
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `host:port`
    async fn dial(&self, host: &str, port: u16) -> io::Result<Box<dyn ByteStream>>;
}

/// Plain TCP dialer
#[derive(Debug, Clone, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<Box<dyn ByteStream>> {
        let stream = tokio::net::TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Negotiation settings
#[derive(Debug, Clone)]
pub struct NegotiateConfig {
    /// Bound on the direct connection attempt
    pub direct_timeout: Duration,
}

impl Default for NegotiateConfig {
    fn default() -> Self {
        Self {
            direct_timeout: Duration::from_secs(5),
        }
    }
}

/// How the relay was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Direct socket to the relay port
    Direct,
    /// Forwarded through the SSH connection
    Tunneled,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Direct => f.write_str("direct"),
            ChannelKind::Tunneled => f.write_str("tunneled"),
        }
    }
}

/// A negotiated byte stream to the relay
pub struct Channel {
    /// Which path won
    pub kind: ChannelKind,
    /// The stream itself
    pub stream: Box<dyn ByteStream>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("kind", &self.kind).finish_non_exhaustive()
    }
}

/// Reach the relay at `host:port`, falling back to a tunnel through `shell`
pub async fn negotiate(
    dialer: &dyn Dialer,
    shell: &dyn RemoteShell,
    host: &str,
    port: u16,
    config: &NegotiateConfig,
) -> Result<Channel, TransportError> {
    debug!("Dialing relay directly at {}:{}", host, port);
    let direct = match tokio::time::timeout(config.direct_timeout, dialer.dial(host, port)).await {
        Ok(Ok(stream)) => {
            info!("Connected to relay directly at {}:{}", host, port);
            return Ok(Channel {
                kind: ChannelKind::Direct,
                stream,
            });
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("timed out after {:?}", config.direct_timeout),
    };

    warn!("Direct connection to {}:{} failed ({}), trying SSH tunnel", host, port, direct);
    match shell.open_tunnel(port).await {
        Ok(stream) => {
            info!("Connected to relay through SSH tunnel");
            Ok(Channel {
                kind: ChannelKind::Tunneled,
                stream,
            })
        }
        Err(e) => Err(TransportError::Negotiation {
            direct,
            tunnel: e.to_string(),
        }),
    }
}

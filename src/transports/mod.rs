//! Upstream transport clients
//!
//! Every client turns one query into one response. Stream transports use
//! the 2-byte big-endian length prefix of RFC 1035 section 4.2.2; UDP sends
//! the bare message. Clients never retry.

pub mod https;
pub mod tcp;
pub mod tfo;
pub mod tls;
pub mod udp;

use crate::dialer::Dialer;
use crate::upstream::{Scheme, Upstream};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {0:?} waiting for {1}")]
    Timeout(Duration, String),

    #[error("Could not resolve upstream address {0}")]
    Unresolvable(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Invalid TLS server name: {0}")]
    ServerName(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Invalid HTTP request: {0}")]
    Request(#[from] http::Error),

    #[error("Failed to read HTTP body: {0}")]
    Body(String),

    #[error("Upstream answered with HTTP status {0}")]
    HttpStatus(u16),

    #[error("Message of {0} bytes does not fit a length prefix")]
    Oversized(usize),

    #[error("Connection closed before the full response arrived")]
    Truncated,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Time limits shared by every client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Bound on TCP connect plus TLS handshake
    pub connect: Duration,
    /// Bound on waiting for the response once the query is sent
    pub read: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            read: Duration::from_secs(5),
        }
    }
}

/// One query/response round trip with an upstream
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>>;
}

/// Build the client matching the scheme of `upstream`
pub fn client_for(
    upstream: &Upstream,
    timeouts: Timeouts,
    dialer: Arc<dyn Dialer>,
) -> Result<Box<dyn Exchange>> {
    let client: Box<dyn Exchange> = match upstream.scheme {
        Scheme::Udp => Box::new(udp::UdpClient::new(upstream.address(), timeouts)),
        Scheme::Tcp => Box::new(tcp::TcpClient::new(upstream.address(), timeouts)),
        Scheme::Tls => Box::new(tls::TlsClient::new(upstream, timeouts)?),
        Scheme::Https => Box::new(https::HttpsClient::new(upstream, timeouts)?),
        Scheme::Tfo => Box::new(tfo::TfoClient::new(upstream.address(), timeouts, dialer)),
    };
    Ok(client)
}

/// Prefix `msg` with its length
pub fn frame(msg: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(msg.len()).map_err(|_| TransportError::Oversized(msg.len()))?;
    let mut framed = Vec::with_capacity(msg.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(msg);
    Ok(framed)
}

/// Write one length-prefixed message
pub async fn write_framed<W: AsyncWrite + Unpin>(writer: &mut W, msg: &[u8]) -> Result<()> {
    writer.write_all(&frame(msg)?).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed message
pub async fn read_framed<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len = [0u8; 2];
    reader.read_exact(&mut len).await.map_err(eof_as_truncated)?;

    let mut msg = vec![0u8; usize::from(u16::from_be_bytes(len))];
    reader.read_exact(&mut msg).await.map_err(eof_as_truncated)?;
    Ok(msg)
}

fn eof_as_truncated(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::Truncated
    } else {
        TransportError::Io(e)
    }
}

async fn round_trip<S>(stream: &mut S, query: &[u8]) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_framed(stream, query).await?;
    read_framed(stream).await
}

/// Send `query` over an established stream and wait for the framed reply
pub(crate) async fn exchange_framed<S>(
    stream: &mut S,
    query: &[u8],
    limit: Duration,
    peer: &str,
) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(limit, round_trip(stream, query))
        .await
        .map_err(|_| TransportError::Timeout(limit, peer.to_string()))?
}

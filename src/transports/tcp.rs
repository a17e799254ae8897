//! DNS over TCP

use super::{exchange_framed, Exchange, Result, Timeouts, TransportError};
use async_trait::async_trait;
use tokio::net::TcpStream;

pub struct TcpClient {
    server: String,
    timeouts: Timeouts,
}

impl TcpClient {
    pub fn new(server: String, timeouts: Timeouts) -> Self {
        Self { server, timeouts }
    }
}

/// Open a TCP connection bounded by the connect timeout
pub(crate) async fn connect(server: &str, timeouts: &Timeouts) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeouts.connect, TcpStream::connect(server))
        .await
        .map_err(|_| TransportError::Timeout(timeouts.connect, server.to_string()))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[async_trait]
impl Exchange for TcpClient {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        let mut stream = connect(&self.server, &self.timeouts).await?;
        exchange_framed(&mut stream, query, self.timeouts.read, &self.server).await
    }
}

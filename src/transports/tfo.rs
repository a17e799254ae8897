//! DNS over TCP with Fast Open
//!
//! The framed query is handed to the dialer as the first payload, so it can
//! travel in the SYN.

use super::{frame, read_framed, Exchange, Result, Timeouts, TransportError};
use crate::dialer::{DialHints, Dialer};
use crate::hints::HintFlags;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::lookup_host;

pub struct TfoClient {
    server: String,
    timeouts: Timeouts,
    dialer: Arc<dyn Dialer>,
}

impl TfoClient {
    pub fn new(server: String, timeouts: Timeouts, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            server,
            timeouts,
            dialer,
        }
    }
}

#[async_trait]
impl Exchange for TfoClient {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        let addr = lookup_host(&self.server)
            .await?
            .next()
            .ok_or_else(|| TransportError::Unresolvable(self.server.clone()))?;
        let framed = frame(query)?;
        let hints = DialHints {
            hint: HintFlags::TFO,
            ttl: 1,
        };

        let connect = self.timeouts.connect;
        let mut stream = tokio::time::timeout(connect, self.dialer.dial(addr, hints, &framed))
            .await
            .map_err(|_| TransportError::Timeout(connect, self.server.clone()))??;

        let read = self.timeouts.read;
        tokio::time::timeout(read, read_framed(&mut stream))
            .await
            .map_err(|_| TransportError::Timeout(read, self.server.clone()))?
    }
}

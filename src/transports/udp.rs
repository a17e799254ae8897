//! DNS over UDP

use super::{Exchange, Result, Timeouts, TransportError};
use crate::dns::{message_id, MAX_DNS_PACKET_SIZE};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::{lookup_host, UdpSocket};

pub struct UdpClient {
    server: String,
    timeouts: Timeouts,
}

impl UdpClient {
    pub fn new(server: String, timeouts: Timeouts) -> Self {
        Self { server, timeouts }
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        lookup_host(&self.server)
            .await?
            .next()
            .ok_or_else(|| TransportError::Unresolvable(self.server.clone()))
    }
}

#[async_trait]
impl Exchange for UdpClient {
    /// Send one datagram and wait for the reply
    ///
    /// When the query carries a non-zero ID, replies with a different ID are
    /// discarded and the wait continues. Spoofed answers injected by on-path
    /// middleboxes often carry ID 0, and they arrive before the real one.
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        let server = self.resolve().await?;
        let bind: SocketAddr = if server.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };

        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;
        socket.send(query).await?;

        let query_id = message_id(query).unwrap_or(0);
        let limit = self.timeouts.read;
        tokio::time::timeout(limit, receive_reply(&socket, query_id))
            .await
            .map_err(|_| TransportError::Timeout(limit, server.to_string()))?
    }
}

async fn receive_reply(socket: &UdpSocket, query_id: u16) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
    loop {
        let n = socket.recv(&mut buf).await?;
        let reply_id = message_id(&buf[..n]);
        if query_id == 0 || reply_id == Some(query_id) {
            buf.truncate(n);
            return Ok(buf);
        }
        log::debug!(
            "Discarding reply with ID {:?}, expected {}",
            reply_id,
            query_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn spawn_upstream(replies: Vec<Vec<u8>>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (_, peer) = socket.recv_from(&mut buf).await.unwrap();
            for reply in replies {
                socket.send_to(&reply, peer).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_zero_id_replies_are_skipped() {
        let addr = spawn_upstream(vec![vec![0, 0, 0xDE, 0xAD], vec![0x12, 0x34, 0xBE, 0xEF]]).await;
        let client = UdpClient::new(addr.to_string(), Timeouts::default());

        let response = client.exchange(&[0x12, 0x34, 1, 0]).await.unwrap();
        assert_eq!(response, vec![0x12, 0x34, 0xBE, 0xEF]);
    }

    #[tokio::test]
    async fn test_zero_id_query_takes_first_reply() {
        let addr = spawn_upstream(vec![vec![0, 0, 0xDE, 0xAD]]).await;
        let client = UdpClient::new(addr.to_string(), Timeouts::default());

        let response = client.exchange(&[0, 0, 1, 0]).await.unwrap();
        assert_eq!(response, vec![0, 0, 0xDE, 0xAD]);
    }

    #[tokio::test]
    async fn test_silent_upstream_times_out() {
        let addr = spawn_upstream(vec![]).await;
        let timeouts = Timeouts {
            read: Duration::from_millis(50),
            ..Timeouts::default()
        };
        let client = UdpClient::new(addr.to_string(), timeouts);

        assert!(matches!(
            client.exchange(&[0x12, 0x34]).await,
            Err(TransportError::Timeout(..))
        ));
    }
}

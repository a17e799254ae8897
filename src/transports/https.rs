//! DNS over HTTPS (RFC 8484, POST form)
//!
//! One HTTP/1.1 request per TLS connection, driven by hyper's connection
//! level client so the insecure verifier and SNI override stay in charge of
//! the handshake.

use super::{tls, Exchange, Result, Timeouts, TransportError};
use crate::upstream::Upstream;
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;

const DNS_MESSAGE: &str = "application/dns-message";
const MAX_BODY_LEN: usize = 65_535;

pub struct HttpsClient {
    server: String,
    host_header: String,
    path: String,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    timeouts: Timeouts,
}

impl HttpsClient {
    pub fn new(upstream: &Upstream, timeouts: Timeouts) -> Result<Self> {
        let host_header = if upstream.port == 443 {
            upstream.address().trim_end_matches(":443").to_string()
        } else {
            upstream.address()
        };

        Ok(Self {
            server: upstream.address(),
            host_header,
            path: upstream.path.clone(),
            server_name: tls::server_name(upstream)?,
            connector: tls::insecure_connector(tls::Alpn::Http1)?,
            timeouts,
        })
    }

    fn request(&self, query: &[u8]) -> Result<Request<Full<Bytes>>> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.path.as_str())
            .header(header::HOST, self.host_header.as_str())
            .header(header::ACCEPT, DNS_MESSAGE)
            .header(header::CONTENT_TYPE, DNS_MESSAGE)
            .header(header::CONTENT_LENGTH, query.len())
            .body(Full::new(Bytes::copy_from_slice(query)))?;
        Ok(request)
    }
}

#[async_trait]
impl Exchange for HttpsClient {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        let request = self.request(query)?;
        let stream = tls::connect(
            &self.server,
            self.server_name.clone(),
            &self.connector,
            &self.timeouts,
        )
        .await?;

        let limit = self.timeouts.read;
        tokio::time::timeout(limit, post(stream, request, &self.server))
            .await
            .map_err(|_| TransportError::Timeout(limit, self.server.clone()))?
    }
}

/// Send `request` over `stream` and return the body of a 200 response
async fn post<S>(stream: S, request: Request<Full<Bytes>>, server: &str) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
    let peer = server.to_string();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            log::debug!("DoH connection to {} ended: {}", peer, e);
        }
    });

    let response = sender.send_request(request).await?;
    log::trace!(
        "DoH response from {}: {} {:?}",
        server,
        response.status(),
        response.headers()
    );

    let status = response.status();
    if status != StatusCode::OK {
        return Err(TransportError::HttpStatus(status.as_u16()));
    }

    let body = Limited::new(response.into_body(), MAX_BODY_LEN)
        .collect()
        .await
        .map_err(|e| TransportError::Body(e.to_string()))?
        .to_bytes();
    Ok(body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Answer one request with `reply`, returning the request head as text
    async fn serve_once(mut server: DuplexStream, reply: Vec<u8>) -> String {
        let mut seen = Vec::new();
        let mut buf = [0u8; 1024];
        while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = server.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            seen.extend_from_slice(&buf[..n]);
        }
        // the client hangs up early on rejected bodies
        let _ = server.write_all(&reply).await;
        String::from_utf8_lossy(&seen).to_ascii_lowercase()
    }

    fn client(url: &str) -> HttpsClient {
        let upstream = Upstream::parse(url).unwrap().unwrap();
        HttpsClient::new(&upstream, Timeouts::default()).unwrap()
    }

    async fn exchange_with(reply: &[u8]) -> (Result<Vec<u8>>, String) {
        let (local, remote) = duplex(8192);
        let server = tokio::spawn(serve_once(remote, reply.to_vec()));
        let request = client("https://dns.example:8443/q").request(&[0xAB]).unwrap();
        let result = post(local, request, "dns.example:8443").await;
        (result, server.await.unwrap())
    }

    #[test]
    fn test_request_layout() {
        let request = client("https://dns.example:8443/q").request(&[0xAB]).unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri().path(), "/q");
        assert_eq!(request.headers()[header::HOST], "dns.example:8443");
        assert_eq!(request.headers()[header::CONTENT_TYPE], DNS_MESSAGE);
        assert_eq!(request.headers()[header::CONTENT_LENGTH], "1");

        let default_port = client("https://dns.example");
        assert_eq!(default_port.host_header, "dns.example");
    }

    #[tokio::test]
    async fn test_post_with_content_length() {
        let (result, head) = exchange_with(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/dns-message\r\nContent-Length: 4\r\n\r\n\x12\x34\x56\x78",
        )
        .await;
        assert_eq!(result.unwrap(), vec![0x12, 0x34, 0x56, 0x78]);
        assert!(head.starts_with("post /q http/1.1\r\n"));
        assert!(head.contains("host: dns.example:8443\r\n"));
        assert!(head.contains("accept: application/dns-message\r\n"));
    }

    #[tokio::test]
    async fn test_post_chunked() {
        let (result, _) = exchange_with(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\n\x01\x02\r\n1\r\n\x03\r\n0\r\n\r\n",
        )
        .await;
        assert_eq!(result.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_post_rejects_non_200() {
        let (result, _) = exchange_with(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n").await;
        assert!(matches!(result, Err(TransportError::HttpStatus(403))));
    }

    #[tokio::test]
    async fn test_post_rejects_overflowing_chunk_size() {
        let (result, _) = exchange_with(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n1\r\na\r\nffffffffffffffff\r\n",
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_post_rejects_oversized_body() {
        let mut reply = b"HTTP/1.1 200 OK\r\nContent-Length: 70000\r\n\r\n".to_vec();
        reply.resize(reply.len() + 70_000, 0);
        let (result, _) = exchange_with(&reply).await;
        assert!(matches!(result, Err(TransportError::Body(_))));
    }
}

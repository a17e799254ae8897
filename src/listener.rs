//! DNS listeners for clients
//!
//! Each server owns its bound socket and answers every query through
//! [`Resolver::ns_request`] with the cache enabled. Connections and
//! datagrams are handled in their own tasks.

use crate::dns::MAX_DNS_PACKET_SIZE;
use crate::resolver::{ResolveError, Resolver};
use crate::transports::{read_framed, write_framed, TransportError};
use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// Idle time after which a client connection is closed
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

const DNS_MESSAGE: &str = "application/dns-message";

/// DNS over TCP, 2-byte length framing
pub struct TcpDnsServer {
    listener: TcpListener,
    resolver: Arc<Resolver>,
}

impl TcpDnsServer {
    pub async fn bind(addr: SocketAddr, resolver: Arc<Resolver>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, resolver })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails
    pub async fn listen(self) -> io::Result<()> {
        log::info!("DNS over TCP listening on {}", self.local_addr()?);

        loop {
            let (socket, peer_addr) = self.listener.accept().await?;
            log::debug!("Accepted DNS connection from {}", peer_addr);

            let resolver = Arc::clone(&self.resolver);
            tokio::spawn(async move {
                if let Err(e) = handle_tcp_connection(socket, resolver).await {
                    log::debug!("DNS connection from {} closed: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Answer framed queries until the client closes or goes idle
async fn handle_tcp_connection(
    mut socket: TcpStream,
    resolver: Arc<Resolver>,
) -> Result<(), TransportError> {
    loop {
        let request = match tokio::time::timeout(IDLE_TIMEOUT, read_framed(&mut socket)).await {
            Ok(Ok(request)) => request,
            Ok(Err(TransportError::Truncated)) | Err(_) => return Ok(()),
            Ok(Err(e)) => return Err(e),
        };

        match resolver.ns_request(&request, true).await {
            Ok(answer) => write_framed(&mut socket, &answer.response).await?,
            // nothing to say; the client sees the connection close
            Err(_) => return Ok(()),
        }
    }
}

/// DNS over UDP, one datagram per query
pub struct UdpDnsServer {
    socket: Arc<UdpSocket>,
    resolver: Arc<Resolver>,
}

impl UdpDnsServer {
    pub async fn bind(addr: SocketAddr, resolver: Arc<Resolver>) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        Ok(Self { socket, resolver })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn listen(self) -> io::Result<()> {
        log::info!("DNS over UDP listening on {}", self.local_addr()?);

        let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
        loop {
            let (n, peer_addr) = self.socket.recv_from(&mut buf).await?;
            let request = buf[..n].to_vec();
            let socket = Arc::clone(&self.socket);
            let resolver = Arc::clone(&self.resolver);

            tokio::spawn(async move {
                let Ok(answer) = resolver.ns_request(&request, true).await else {
                    return;
                };
                if let Err(e) = socket.send_to(&answer.response, peer_addr).await {
                    log::debug!("Failed to answer {}: {}", peer_addr, e);
                }
            });
        }
    }
}

/// DNS over HTTP/1.1 (`POST`, `application/dns-message`)
///
/// Plain HTTP: TLS is expected to be terminated in front of this server.
pub struct DohServer {
    listener: TcpListener,
    resolver: Arc<Resolver>,
}

impl DohServer {
    pub async fn bind(addr: SocketAddr, resolver: Arc<Resolver>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, resolver })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn listen(self) -> io::Result<()> {
        log::info!("DNS over HTTP listening on {}", self.local_addr()?);

        loop {
            let (socket, peer_addr) = self.listener.accept().await?;
            let resolver = Arc::clone(&self.resolver);
            tokio::spawn(async move {
                let service = service_fn(move |request| {
                    let resolver = Arc::clone(&resolver);
                    async move { Ok::<_, Infallible>(answer_doh(request, &resolver).await) }
                });
                let connection =
                    http1::Builder::new().serve_connection(TokioIo::new(socket), service);
                match tokio::time::timeout(IDLE_TIMEOUT, connection).await {
                    Ok(Err(e)) => log::debug!("DoH connection from {} failed: {}", peer_addr, e),
                    Err(_) => log::debug!("DoH connection from {} timed out", peer_addr),
                    Ok(Ok(())) => {}
                }
            });
        }
    }
}

fn doh_response(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(DNS_MESSAGE));
    response
}

/// Resolve the query carried in a DoH request body
async fn answer_doh<B>(request: Request<B>, resolver: &Resolver) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if request.method() != Method::POST {
        return doh_response(StatusCode::METHOD_NOT_ALLOWED, Vec::new());
    }

    let query = match Limited::new(request.into_body(), MAX_DNS_PACKET_SIZE).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return doh_response(StatusCode::PAYLOAD_TOO_LARGE, Vec::new());
        }
        Err(e) => {
            log::debug!("Failed to read DoH request body: {}", e);
            return doh_response(StatusCode::BAD_REQUEST, Vec::new());
        }
    };

    match resolver.ns_request(&query, true).await {
        Ok(answer) => doh_response(StatusCode::OK, answer.response),
        Err(ResolveError::MalformedQuery) => doh_response(StatusCode::BAD_REQUEST, Vec::new()),
        Err(_) => doh_response(StatusCode::BAD_GATEWAY, Vec::new()),
    }
}

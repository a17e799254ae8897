//! DNS over TLS
//!
//! Certificates are not verified: upstreams are frequently reached through
//! fronting hosts whose certificate does not match the dialed name.

use super::{exchange_framed, tcp, Exchange, Result, Timeouts, TransportError};
use crate::upstream::Upstream;
use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::{Arc, OnceLock};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// ALPN protocols offered to an upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Alpn {
    None,
    Http1,
}

static DOT_CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
static DOH_CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

fn insecure_config(alpn_protocols: Vec<Vec<u8>>) -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
        .with_no_client_auth();
    config.alpn_protocols = alpn_protocols;
    Ok(Arc::new(config))
}

/// Client config that accepts any server certificate, built once per ALPN set
pub(crate) fn shared_config(alpn: Alpn) -> Result<Arc<ClientConfig>> {
    let (cell, protocols) = match alpn {
        Alpn::None => (&DOT_CONFIG, Vec::new()),
        Alpn::Http1 => (&DOH_CONFIG, vec![b"http/1.1".to_vec()]),
    };
    if let Some(config) = cell.get() {
        return Ok(Arc::clone(config));
    }
    let config = insecure_config(protocols)?;
    Ok(Arc::clone(cell.get_or_init(|| config)))
}

pub(crate) fn insecure_connector(alpn: Alpn) -> Result<TlsConnector> {
    Ok(TlsConnector::from(shared_config(alpn)?))
}

/// SNI for an upstream: the `domain` option, else the URL host
pub(crate) fn server_name(upstream: &Upstream) -> Result<ServerName<'static>> {
    let name = upstream.server_name();
    ServerName::try_from(name)
        .map(|name| name.to_owned())
        .map_err(|_| TransportError::ServerName(name.to_string()))
}

/// TCP connect followed by the TLS handshake, both bounded by the connect timeout
pub(crate) async fn connect(
    server: &str,
    server_name: ServerName<'static>,
    connector: &TlsConnector,
    timeouts: &Timeouts,
) -> Result<TlsStream<TcpStream>> {
    let stream = tcp::connect(server, timeouts).await?;
    let stream = tokio::time::timeout(timeouts.connect, connector.connect(server_name, stream))
        .await
        .map_err(|_| TransportError::Timeout(timeouts.connect, format!("TLS handshake with {}", server)))??;
    Ok(stream)
}

pub struct TlsClient {
    server: String,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    timeouts: Timeouts,
}

impl TlsClient {
    pub fn new(upstream: &Upstream, timeouts: Timeouts) -> Result<Self> {
        Ok(Self {
            server: upstream.address(),
            server_name: server_name(upstream)?,
            connector: insecure_connector(Alpn::None)?,
            timeouts,
        })
    }
}

#[async_trait]
impl Exchange for TlsClient {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        let mut stream = connect(
            &self.server,
            self.server_name.clone(),
            &self.connector,
            &self.timeouts,
        )
        .await?;
        exchange_framed(&mut stream, query, self.timeouts.read, &self.server).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_prefers_domain_option() {
        let upstream = Upstream::parse("tls://1.1.1.1?domain=one.one.one.one")
            .unwrap()
            .unwrap();
        assert_eq!(
            server_name(&upstream).unwrap(),
            ServerName::try_from("one.one.one.one").unwrap()
        );
    }

    #[test]
    fn test_server_name_accepts_ip_literals() {
        let upstream = Upstream::parse("tls://[2606:4700:4700::1111]").unwrap().unwrap();
        assert!(matches!(
            server_name(&upstream).unwrap(),
            ServerName::IpAddress(_)
        ));
    }

    #[test]
    fn test_client_config_is_shared() {
        let first = shared_config(Alpn::None).unwrap();
        let second = shared_config(Alpn::None).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.alpn_protocols.is_empty());

        let doh = shared_config(Alpn::Http1).unwrap();
        assert!(!Arc::ptr_eq(&first, &doh));
        assert_eq!(doh.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_client_builds_with_insecure_verifier() {
        let upstream = Upstream::parse("tls://9.9.9.9").unwrap().unwrap();
        let client = TlsClient::new(&upstream, Timeouts::default()).unwrap();
        assert_eq!(client.server, "9.9.9.9:853");
    }
}

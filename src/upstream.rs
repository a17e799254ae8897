//! Upstream resolver descriptors
//!
//! An upstream is written as a URL: the scheme picks the transport, the
//! authority is the server and the query string carries per-server options.
//!
//! ```text
//! udp://8.8.8.8:53
//! tls://1.1.1.1?domain=cloudflare-dns.com
//! https://dns.google/dns-query?ecs=203.0.113.0&badsubnet=10.10.34.0/24
//! tcp://[2001:4860:4860::8888]:53?type=AAAA&fallback=2001:db8::1
//! ```

use crate::dns::{AnswerFilter, TYPE_A, TYPE_AAAA};
use ipnetwork::IpNetwork;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("Upstream URL has no scheme: {0}")]
    MissingScheme(String),

    #[error("Invalid port in upstream URL: {0}")]
    InvalidPort(String),
}

/// Transport used to reach an upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Udp,
    Tcp,
    Tls,
    Https,
    Tfo,
}

impl Scheme {
    pub fn parse(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "udp" => Some(Scheme::Udp),
            "tcp" => Some(Scheme::Tcp),
            "tls" => Some(Scheme::Tls),
            "https" => Some(Scheme::Https),
            "tfo" => Some(Scheme::Tfo),
            _ => None,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Udp | Scheme::Tcp | Scheme::Tfo => 53,
            Scheme::Tls => 853,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Udp => "udp",
            Scheme::Tcp => "tcp",
            Scheme::Tls => "tls",
            Scheme::Https => "https",
            Scheme::Tfo => "tfo",
        }
    }
}

/// Record family an upstream is restricted to (`type=` option)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    A,
    Aaaa,
}

impl AddressFamily {
    pub fn qtype(self) -> u16 {
        match self {
            AddressFamily::A => TYPE_A,
            AddressFamily::Aaaa => TYPE_AAAA,
        }
    }
}

/// Per-upstream options from the URL query string
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerOptions {
    /// Client subnet declared through EDNS0
    pub ecs: Option<IpAddr>,
    /// Only ask this upstream for one family
    pub family: Option<AddressFamily>,
    /// NAT64 prefix, as written in the URL
    pub pd: Option<String>,
    /// TLS server name override
    pub domain: Option<String>,
    /// Answers inside this network are discarded
    pub bad_subnet: Option<IpNetwork>,
    /// Address used when the upstream returns nothing usable
    pub fallback: Option<IpAddr>,
}

impl ServerOptions {
    /// Parse `key=value` pairs joined by `&`; unknown keys are ignored
    pub fn parse(query: &str) -> Self {
        let mut options = ServerOptions::default();

        for pair in query.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key {
                "ecs" => options.ecs = parse_or_warn(key, value),
                "type" => {
                    options.family = match value.to_ascii_uppercase().as_str() {
                        "A" => Some(AddressFamily::A),
                        "AAAA" => Some(AddressFamily::Aaaa),
                        _ => {
                            log::warn!("Ignoring upstream option type={}", value);
                            None
                        }
                    }
                }
                "pd" => {
                    options.pd = Some(value.to_string());
                    if options.nat64_prefix().is_none() {
                        log::warn!("Ignoring unusable NAT64 prefix pd={}", value);
                    }
                }
                "domain" => options.domain = Some(value.to_string()).filter(|d| !d.is_empty()),
                "badsubnet" => options.bad_subnet = parse_or_warn(key, value),
                "fallback" => options.fallback = parse_or_warn(key, value),
                _ => {}
            }
        }

        options
    }

    /// The `pd` option as an IPv6 prefix
    ///
    /// Accepts both a complete address (`64:ff9b::`) and a textual prefix
    /// meant to have the dotted IPv4 address appended (`2001:db8:1:2:3:4:`).
    pub fn nat64_prefix(&self) -> Option<Ipv6Addr> {
        let pd = self.pd.as_deref()?;
        pd.parse::<Ipv6Addr>()
            .ok()
            .or_else(|| format!("{}0.0.0.0", pd).parse().ok())
    }

    /// Fallback address if it belongs to the family of `qtype`
    pub fn fallback_for(&self, qtype: u16) -> Option<IpAddr> {
        match (self.fallback?, qtype) {
            (address @ IpAddr::V4(_), TYPE_A) => Some(address),
            (address @ IpAddr::V6(_), TYPE_AAAA) => Some(address),
            _ => None,
        }
    }

    /// Answer filter for replies from this upstream
    pub fn answer_filter(&self, min_ttl: u32) -> AnswerFilter {
        AnswerFilter {
            bad_subnet: self.bad_subnet,
            nat64_prefix: self.nat64_prefix(),
            min_ttl,
        }
    }
}

fn parse_or_warn<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            log::warn!("Ignoring upstream option {}={}", key, value);
            None
        }
    }
}

/// A parsed upstream URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Request path, only used by DNS-over-HTTPS
    pub path: String,
    pub options: ServerOptions,
}

impl Upstream {
    /// Parse an upstream URL
    ///
    /// `Ok(None)` means "no upstream configured": an empty URL, an unknown
    /// scheme or an empty host.
    pub fn parse(url: &str) -> Result<Option<Self>, UpstreamError> {
        let url = url.trim();
        if url.is_empty() {
            return Ok(None);
        }

        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| UpstreamError::MissingScheme(url.to_string()))?;
        let (rest, query) = rest.split_once('?').unwrap_or((rest, ""));
        let (authority, path) = match rest.find('/') {
            Some(slash) => rest.split_at(slash),
            None => (rest, ""),
        };

        let Some(scheme) = Scheme::parse(scheme) else {
            return Ok(None);
        };
        if authority.is_empty() {
            return Ok(None);
        }

        let (host, port) = split_host_port(authority, scheme.default_port())?;
        let path = if path.is_empty() && scheme == Scheme::Https {
            "/dns-query".to_string()
        } else {
            path.to_string()
        };

        Ok(Some(Upstream {
            scheme,
            host,
            port,
            path,
            options: ServerOptions::parse(query),
        }))
    }

    /// `host:port` suitable for `connect`, IPv6 literals bracketed
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Name presented in the TLS handshake
    pub fn server_name(&self) -> &str {
        self.options.domain.as_deref().unwrap_or(&self.host)
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme.as_str(), self.address(), self.path)
    }
}

fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16), UpstreamError> {
    let parse_port = |port: &str| {
        port.parse::<u16>()
            .map_err(|_| UpstreamError::InvalidPort(authority.to_string()))
    };

    if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, rest) = bracketed
            .split_once(']')
            .ok_or_else(|| UpstreamError::InvalidPort(authority.to_string()))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None if rest.is_empty() => default_port,
            None => return Err(UpstreamError::InvalidPort(authority.to_string())),
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        // a bare IPv6 literal has more than one colon and no port
        Some((host, _)) if host.contains(':') => Ok((authority.to_string(), default_port)),
        Some((host, port)) => Ok((host.to_string(), parse_port(port)?)),
        None => Ok((authority.to_string(), default_port)),
    }
}

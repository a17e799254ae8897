//! veildns: DNS Resolution and Interception Engine
//!
//! veildns answers DNS queries on behalf of a censorship-circumvention proxy.
//! Names are resolved through per-domain upstreams over UDP, TCP, TLS,
//! HTTPS or TCP Fast Open, and names that must be intercepted are answered
//! with virtual addresses that the proxy later maps back to the domain.
//!
//! ## Features
//!
//! - **Five upstream transports**: UDP, TCP, DNS over TLS, DNS over HTTPS, TCP Fast Open
//! - **Per-upstream options**: client subnet, single family, NAT64 prefix, SNI override,
//!   poisoned-subnet filtering and fallback addresses
//! - **Virtual addresses**: stable per-name indices encoded into placeholder IPv4 answers
//! - **HTTPS records**: synthesized ALPN and address hints from cached state
//! - **DNS64**: AAAA synthesis from A answers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use veildns::{
//!     DirectDialer, DnsCache, Policy, Resolver, ResolverSettings, StaticPolicy,
//!     VirtualAddressTable,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut policy = StaticPolicy::new();
//!     policy.insert(
//!         "example.com",
//!         Policy {
//!             upstream: "tls://1.1.1.1?domain=cloudflare-dns.com".to_string(),
//!             ..Policy::default()
//!         },
//!     );
//!
//!     let resolver = Resolver::new(
//!         Arc::new(DnsCache::new(2)),
//!         Arc::new(VirtualAddressTable::new()),
//!         Arc::new(policy),
//!         Arc::new(DirectDialer),
//!         ResolverSettings::default(),
//!     );
//!
//!     let addr = resolver
//!         .resolve_socket_addr("example.com", 443, Default::default(), "udp://8.8.8.8")
//!         .await?;
//!     println!("example.com -> {}", addr);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐     ┌────────────┐     ┌──────────────┐     ┌──────────┐
//! │ Listener │────▶│  Resolver  │────▶│  Transports  │────▶│ Upstream │
//! │ TCP/UDP/ │     │ ns_request │     │ udp tcp tls  │     │ resolver │
//! │   DoH    │     │ ns_lookup  │     │ https tfo    │     └──────────┘
//! └──────────┘     └────────────┘     └──────────────┘
//!                    │        │
//!                    ▼        ▼
//!             ┌──────────┐ ┌──────────────────┐
//!             │ DnsCache │ │ VirtualAddress-  │
//!             │          │ │ Table (Nose)     │
//!             └──────────┘ └──────────────────┘
//! ```

pub mod cache;
pub mod config;
pub mod dialer;
pub mod dns;
pub mod hints;
pub mod listener;
pub mod nose;
pub mod policy;
pub mod record;
pub mod resolver;
pub mod transports;
pub mod upstream;

pub use cache::DnsCache;
pub use config::{Config, ListenConfig, PolicyConfig, ResolverConfig};
pub use dialer::{DialHints, Dialer, DirectDialer};
pub use dns::DnsError;
pub use hints::HintFlags;
pub use listener::{DohServer, TcpDnsServer, UdpDnsServer};
pub use nose::VirtualAddressTable;
pub use policy::{Policy, PolicyLookup, StaticPolicy};
pub use record::{AddressSet, DomainRecord, RecordSnapshot};
pub use resolver::{Answer, ResolveError, Resolver, ResolverSettings};
pub use transports::{Exchange, Timeouts, TransportError};
pub use upstream::{ServerOptions, Upstream, UpstreamError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! veildns configuration

use crate::hints::HintFlags;
use crate::policy::{Policy, StaticPolicy};
use crate::resolver::ResolverSettings;
use crate::transports::Timeouts;
use crate::upstream::Upstream;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Main veildns configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Resolver tuning
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Listening sockets
    #[serde(default)]
    pub listen: ListenConfig,

    /// Per-domain policies
    #[serde(default, rename = "policy")]
    pub policies: Vec<PolicyConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Lower bound for upstream TTLs, in seconds
    #[serde(default)]
    pub min_ttl: u32,

    /// First octet of virtual IPv4 addresses
    #[serde(default = "default_virtual_prefix")]
    pub virtual_prefix: u8,

    /// How many parent domains a cache miss may inherit from
    #[serde(default = "default_subdomain_depth")]
    pub subdomain_depth: usize,

    /// Wait for a UDP reply or a stream response
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub udp_timeout: Duration,

    /// Wait for a TCP connection and TLS handshake
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

fn default_virtual_prefix() -> u8 {
    255
}

fn default_subdomain_depth() -> usize {
    2
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            min_ttl: 0,
            virtual_prefix: default_virtual_prefix(),
            subdomain_depth: default_subdomain_depth(),
            udp_timeout: default_timeout(),
            connect_timeout: default_timeout(),
        }
    }
}

impl ResolverConfig {
    pub fn settings(&self) -> ResolverSettings {
        ResolverSettings {
            min_ttl: self.min_ttl,
            virtual_prefix: self.virtual_prefix,
            timeouts: Timeouts {
                connect: self.connect_timeout,
                read: self.udp_timeout,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenConfig {
    /// DNS over TCP
    pub tcp: Option<SocketAddr>,
    /// DNS over UDP
    pub udp: Option<SocketAddr>,
    /// DNS over HTTP (plain, behind a TLS terminator)
    pub doh: Option<SocketAddr>,
}

impl ListenConfig {
    pub fn is_empty(&self) -> bool {
        self.tcp.is_none() && self.udp.is_none() && self.doh.is_none()
    }
}

/// One `[[policy]]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Domain the policy applies to, including its subdomains
    pub domain: String,

    /// Upstream URL; empty makes the domain virtual-only
    #[serde(default)]
    pub dns: String,

    #[serde(default)]
    pub hints: HintFlags,

    /// Interception protocol, 0 for none
    #[serde(default)]
    pub protocol: u8,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.resolver.virtual_prefix == 0 {
            return Err("virtual_prefix must not be 0".to_string());
        }

        for policy in &self.policies {
            if policy.domain.trim_end_matches('.').is_empty() {
                return Err("Policy domain must not be empty".to_string());
            }
            if let Err(e) = Upstream::parse(&policy.dns) {
                return Err(format!("Policy for {}: {}", policy.domain, e));
            }
        }

        Ok(())
    }

    /// Policy table built from the `[[policy]]` entries
    pub fn policy_table(&self) -> StaticPolicy {
        self.policies
            .iter()
            .map(|entry| {
                (
                    entry.domain.clone(),
                    Policy {
                        upstream: entry.dns.clone(),
                        hint: entry.hints,
                        protocol: entry.protocol,
                    },
                )
            })
            .collect()
    }
}

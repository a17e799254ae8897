//! Resolution orchestrator
//!
//! [`Resolver::ns_request`] answers DNS queries coming from clients;
//! [`Resolver::ns_lookup`] resolves names for outbound connections. Both
//! share the [`DnsCache`] and the [`VirtualAddressTable`], and both leave the
//! cache populated before returning, so the next request for the same name
//! sees at least what this one stored.

use crate::cache::DnsCache;
use crate::dialer::Dialer;
use crate::dns::{
    build_query, build_response, message_id, normalize_name, parse_answer_section, read_question,
    translate_dns64, virtual_index, write_u16, AnswerFragments, DnsError, TYPE_A, TYPE_AAAA,
    TYPE_HTTPS,
};
use crate::hints::HintFlags;
use crate::nose::VirtualAddressTable;
use crate::policy::PolicyLookup;
use crate::record::{unix_now, DomainRecord};
use crate::transports::tcp::TcpClient;
use crate::transports::{self, Exchange, Timeouts, TransportError};
use crate::upstream::{Upstream, UpstreamError};
use rand::seq::SliceRandom;
use rand::Rng;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;

/// TTL for answers that are not backed by upstream data
pub const SYNTHETIC_TTL: u32 = 3600;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Malformed DNS query")]
    MalformedQuery,

    #[error("No usable upstream for {0}")]
    NoUpstream(String),

    #[error("No such host: {0}")]
    NoSuchHost(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Dns(#[from] DnsError),
}

pub type Result<T> = std::result::Result<T, ResolveError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverSettings {
    /// Floor applied to every upstream TTL
    pub min_ttl: u32,
    /// First octet of virtual IPv4 addresses
    pub virtual_prefix: u8,
    pub timeouts: Timeouts,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            min_ttl: 0,
            virtual_prefix: 255,
            timeouts: Timeouts::default(),
        }
    }
}

/// Result of answering one client query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    /// Virtual index of the name, 0 when it resolves to real addresses
    pub index: usize,
    /// Wire-format response
    pub response: Vec<u8>,
}

pub struct Resolver {
    cache: Arc<DnsCache>,
    nose: Arc<VirtualAddressTable>,
    policy: Arc<dyn PolicyLookup>,
    dialer: Arc<dyn Dialer>,
    settings: ResolverSettings,
}

impl Resolver {
    pub fn new(
        cache: Arc<DnsCache>,
        nose: Arc<VirtualAddressTable>,
        policy: Arc<dyn PolicyLookup>,
        dialer: Arc<dyn Dialer>,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            cache,
            nose,
            policy,
            dialer,
            settings,
        }
    }

    pub fn cache(&self) -> &Arc<DnsCache> {
        &self.cache
    }

    pub fn nose(&self) -> &Arc<VirtualAddressTable> {
        &self.nose
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    /// Resolve `name` for an outbound connection
    ///
    /// The family is AAAA when `hint` carries [`HintFlags::IPV6`], A
    /// otherwise. An unusable upstream URL (no or unknown scheme, no host) marks
    /// the name as virtual-only: it gets an index and no addresses.
    pub async fn ns_lookup(
        &self,
        name: &str,
        hint: HintFlags,
        upstream: &str,
    ) -> Result<(usize, Vec<IpAddr>)> {
        let name = normalize_name(name);
        let qtype = if hint.contains(HintFlags::IPV6) {
            TYPE_AAAA
        } else {
            TYPE_A
        };

        let record = self.cache.lookup_or_insert(name);
        if let Some(set) = record.addresses_for(qtype) {
            log::debug!("cached: {} {} {:?}", name, qtype, set.addresses);
            return Ok((record.index(), set.addresses.clone()));
        }

        // a bare address with no scheme is treated like an empty upstream
        let parsed = match Upstream::parse(upstream) {
            Err(UpstreamError::MissingScheme(_)) => None,
            parsed => parsed?,
        };
        let Some(upstream) = parsed else {
            record.set_hint(hint);
            let index = self.assign_virtual(&record, name);
            log::debug!("nslookup: {} has no upstream, virtual index {}", name, index);
            return Ok((index, Vec::new()));
        };

        let now = unix_now();
        let id = rand::thread_rng().gen_range(1..=u16::MAX);
        let query = build_query(name, qtype, id, upstream.options.ecs)?;
        let response = self.exchange(&upstream, &query).await.map_err(|e| {
            log::error!("nslookup {} via {} failed: {}", name, upstream, e);
            e
        })?;

        if record.index() == 0 && !hint.is_empty() {
            record.set_hint(hint);
            self.assign_virtual(&record, name);
        }

        let filter = upstream.options.answer_filter(self.settings.min_ttl);
        self.store(&record, name, parse_answer_section(&response, &filter, now));
        self.apply_fallback(&record, name, qtype, &upstream);

        let addresses = record
            .addresses_for(qtype)
            .map(|set| set.addresses.clone())
            .unwrap_or_default();
        log::debug!("nslookup: {} {} {:?}", name, qtype, addresses);
        Ok((record.index(), addresses))
    }

    /// Answer one client query
    ///
    /// `Err` means nothing should be sent back: the query was malformed or
    /// the upstream could not be reached.
    pub async fn ns_request(&self, request: &[u8], use_cache: bool) -> Result<Answer> {
        let Some(question) = read_question(request) else {
            log::warn!("Dropping malformed DNS query ({} bytes)", request.len());
            return Err(ResolveError::MalformedQuery);
        };
        let name = normalize_name(&question.name).to_string();
        let qtype = question.qtype;
        let now = unix_now();

        // answers are appended right after the question
        let mut request = request[..question.end].to_vec();
        write_u16(&mut request, 8, 0);
        write_u16(&mut request, 10, 0);

        let record = if use_cache {
            self.cache.lookup_or_insert(&name)
        } else {
            Arc::new(DomainRecord::new())
        };

        match qtype {
            TYPE_A | TYPE_AAAA => {
                if record.addresses_for(qtype).is_some() {
                    log::debug!("cached: {} {}", name, qtype);
                    return Ok(self.answer(&request, qtype, &record, now, 0));
                }
            }
            TYPE_HTTPS => {
                if record
                    .hint()
                    .intersects(HintFlags::HTTP3 | HintFlags::HTTP2 | HintFlags::UDP)
                {
                    return Ok(self.answer(&request, qtype, &record, now, SYNTHETIC_TTL));
                }
            }
            _ => return Ok(self.answer(&request, qtype, &record, now, SYNTHETIC_TTL)),
        }

        let Some(policy) = self.policy.lookup(&name) else {
            log::info!("request: {} has no policy, answering empty", name);
            return Ok(Answer {
                index: 0,
                response: build_response(
                    &request,
                    qtype,
                    SYNTHETIC_TTL,
                    &record.snapshot(),
                    self.settings.virtual_prefix,
                ),
            });
        };
        record.set_hint(policy.hint & HintFlags::DNS_MASK);
        log::info!(
            "request: {} {} via {:?} protocol {}",
            name,
            qtype,
            policy.upstream,
            policy.protocol
        );

        if policy.upstream.is_empty() {
            if policy.protocol != 0 {
                self.assign_virtual(&record, &name);
            }
            return Ok(self.answer(&request, qtype, &record, now, SYNTHETIC_TTL));
        }

        let Some(upstream) = Upstream::parse(&policy.upstream)? else {
            log::error!("request: {} has unusable upstream {:?}", name, policy.upstream);
            return Err(ResolveError::NoUpstream(name));
        };
        let options = &upstream.options;

        let mut out_qtype = qtype;
        if let Some(family) = options.family {
            if matches!(qtype, TYPE_A | TYPE_AAAA) && family.qtype() != qtype {
                log::debug!("request: {} {} skipped, upstream is {:?} only", name, qtype, family);
                return Ok(self.answer(&request, qtype, &record, now, 0));
            }
            out_qtype = family.qtype();
        } else if record.hint().contains(HintFlags::IPV6) {
            out_qtype = TYPE_AAAA;
        }

        let outgoing = if options.ecs.is_some() || out_qtype != qtype {
            let id = message_id(&request).unwrap_or(0);
            build_query(&name, out_qtype, id, options.ecs)?
        } else {
            request.clone()
        };

        let response = self.exchange(&upstream, &outgoing).await.map_err(|e| {
            log::error!("request: {} via {} failed: {}", name, upstream, e);
            e
        })?;

        let filter = options.answer_filter(self.settings.min_ttl);
        self.store(&record, &name, parse_answer_section(&response, &filter, now));

        if matches!(qtype, TYPE_A | TYPE_AAAA) {
            self.apply_fallback(&record, &name, qtype, &upstream);
            if record.addresses_for(qtype).is_none() {
                log::info!("request: {} {} no answer", name, qtype);
                return Ok(Answer {
                    index: 0,
                    response: self.answer(&request, qtype, &record, now, 0).response,
                });
            }
        }

        if record.index() == 0 && policy.wants_virtual() {
            self.assign_virtual(&record, &name);
        }

        Ok(self.answer(&request, qtype, &record, now, 0))
    }

    /// Resolve `host` to one socket address, picked at random
    pub async fn resolve_socket_addr(
        &self,
        host: &str,
        port: u16,
        hint: HintFlags,
        upstream: &str,
    ) -> Result<SocketAddr> {
        let addrs = self.resolve_socket_addrs(host, port, hint, upstream).await?;
        addrs
            .choose(&mut rand::thread_rng())
            .copied()
            .ok_or_else(|| ResolveError::NoSuchHost(host.to_string()))
    }

    /// Resolve `host` to every known socket address
    pub async fn resolve_socket_addrs(
        &self,
        host: &str,
        port: u16,
        hint: HintFlags,
        upstream: &str,
    ) -> Result<Vec<SocketAddr>> {
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = literal.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let (_, addresses) = self.ns_lookup(host, hint, upstream).await?;
        if addresses.is_empty() {
            return Err(ResolveError::NoSuchHost(host.to_string()));
        }
        Ok(addresses
            .into_iter()
            .map(|ip| SocketAddr::new(ip, port))
            .collect())
    }

    /// Map a virtual address back to its name and hint flags
    pub fn lookup_virtual(&self, addr: IpAddr) -> Option<(String, HintFlags)> {
        let IpAddr::V4(v4) = addr else {
            return None;
        };
        let index = virtual_index(self.settings.virtual_prefix, v4)?;
        let name = self.nose.name_of(index)?;
        let hint = self
            .cache
            .get(&name)
            .map(|record| record.hint())
            .unwrap_or_default();
        Some((name, hint))
    }

    /// Answer an AAAA question by asking `server` (host:port, over TCP) for A
    /// records and synthesizing AAAA records under `prefix`
    pub async fn lookup_dns64(
        &self,
        request: &[u8],
        server: &str,
        prefix: Ipv6Addr,
    ) -> Result<Vec<u8>> {
        let question = read_question(request).ok_or(ResolveError::MalformedQuery)?;
        let mut query = request[..question.end].to_vec();
        write_u16(&mut query, 10, 0);
        write_u16(&mut query, question.end - 4, TYPE_A);

        let client = TcpClient::new(server.to_string(), self.settings.timeouts);
        let response = client.exchange(&query).await?;

        let mut translated = translate_dns64(&response, prefix)
            .ok_or(DnsError::Malformed("truncated reply to DNS64 query"))?;
        let answered = read_question(&translated)
            .ok_or(DnsError::Malformed("reply to DNS64 query has no question"))?;
        write_u16(&mut translated, answered.end - 4, TYPE_AAAA);
        Ok(translated)
    }

    async fn exchange(
        &self,
        upstream: &Upstream,
        query: &[u8],
    ) -> std::result::Result<Vec<u8>, TransportError> {
        let client =
            transports::client_for(upstream, self.settings.timeouts, Arc::clone(&self.dialer))?;
        client.exchange(query).await
    }

    fn assign_virtual(&self, record: &DomainRecord, name: &str) -> usize {
        match record.index() {
            0 => match self.nose.assign_or_get(name) {
                Some(index) => record.set_index(index),
                None => 0,
            },
            index => index,
        }
    }

    fn store(&self, record: &DomainRecord, name: &str, fragments: AnswerFragments) {
        if let Some(cname) = &fragments.cname {
            log::debug!("{} is an alias of {}", name, cname);
        }
        if let Some(set) = fragments.ipv4 {
            record.publish_ipv4(set);
        }
        if let Some(set) = fragments.ipv6 {
            record.publish_ipv6(set);
        }
    }

    fn apply_fallback(&self, record: &DomainRecord, name: &str, qtype: u16, upstream: &Upstream) {
        if record.addresses_for(qtype).is_some() {
            return;
        }
        let Some(fallback) = upstream.options.fallback_for(qtype) else {
            return;
        };
        log::debug!("request: {} fallback {}", name, fallback);
        let set = crate::record::AddressSet::synthetic(fallback);
        match qtype {
            TYPE_A => record.publish_ipv4(set),
            _ => record.publish_ipv6(set),
        };
    }

    /// Build the response for `qtype`; A and AAAA carry the remaining TTL
    fn answer(
        &self,
        request: &[u8],
        qtype: u16,
        record: &DomainRecord,
        now: u64,
        ttl: u32,
    ) -> Answer {
        let ttl = match record.addresses_for(qtype) {
            Some(set) => set.remaining_ttl(now),
            None => ttl,
        };
        let snapshot = record.snapshot();
        Answer {
            index: snapshot.index,
            response: build_response(request, qtype, ttl, &snapshot, self.settings.virtual_prefix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::DirectDialer;
    use crate::dns::{parse_answer_section, AnswerFilter};
    use crate::policy::{Policy, StaticPolicy};
    use crate::record::AddressSet;

    fn resolver(policies: Vec<(&str, Policy)>) -> Resolver {
        let policy: StaticPolicy = policies
            .into_iter()
            .map(|(domain, policy)| (domain.to_string(), policy))
            .collect();
        Resolver::new(
            Arc::new(DnsCache::new(2)),
            Arc::new(VirtualAddressTable::new()),
            Arc::new(policy),
            Arc::new(DirectDialer),
            ResolverSettings::default(),
        )
    }

    fn query(name: &str, qtype: u16) -> Vec<u8> {
        build_query(name, qtype, 0x2a2a, None).unwrap()
    }

    #[tokio::test]
    async fn test_malformed_query_is_rejected() {
        let resolver = resolver(vec![]);
        assert!(matches!(
            resolver.ns_request(&[0, 1, 2], true).await,
            Err(ResolveError::MalformedQuery)
        ));
    }

    #[tokio::test]
    async fn test_no_policy_answers_empty() {
        let resolver = resolver(vec![]);
        let request = query("unlisted.example", TYPE_A);

        let answer = resolver.ns_request(&request, true).await.unwrap();
        assert_eq!(answer.index, 0);
        assert_eq!(&answer.response[..2], &[0x2a, 0x2a]);
        assert_eq!(&answer.response[6..8], &[0, 0]);
        assert_eq!(answer.response.len(), request.len());
    }

    #[tokio::test]
    async fn test_virtual_only_policy() {
        let resolver = resolver(vec![(
            "blocked.example",
            Policy {
                protocol: 2,
                ..Policy::default()
            },
        )]);

        let answer = resolver
            .ns_request(&query("www.blocked.example", TYPE_A), true)
            .await
            .unwrap();
        assert_eq!(answer.index, 1);

        let parsed = parse_answer_section(&answer.response, &AnswerFilter::default(), 0);
        assert_eq!(
            parsed.ipv4.unwrap().addresses,
            vec![IpAddr::from([255, 0, 0, 1])]
        );
        assert_eq!(
            resolver.lookup_virtual(IpAddr::from([255, 0, 0, 1])),
            Some(("www.blocked.example".to_string(), HintFlags::NONE))
        );
    }

    #[tokio::test]
    async fn test_cached_addresses_skip_policy() {
        let resolver = resolver(vec![]);
        let record = resolver.cache().lookup_or_insert("cached.example");
        record.publish_ipv4(AddressSet::new(
            unix_now() + 120,
            vec!["192.0.2.7".parse().unwrap()],
        ));

        let answer = resolver
            .ns_request(&query("cached.example", TYPE_A), true)
            .await
            .unwrap();
        let parsed = parse_answer_section(&answer.response, &AnswerFilter::default(), 0);
        assert_eq!(
            parsed.ipv4.unwrap().addresses,
            vec!["192.0.2.7".parse::<IpAddr>().unwrap()]
        );
    }

    #[tokio::test]
    async fn test_https_hit_requires_hint() {
        let resolver = resolver(vec![]);
        let record = resolver.cache().lookup_or_insert("h3.example");
        record.set_hint(HintFlags::HTTP3);

        let answer = resolver
            .ns_request(&query("h3.example", TYPE_HTTPS), true)
            .await
            .unwrap();
        assert_eq!(&answer.response[6..8], &[0, 1]);
    }

    #[tokio::test]
    async fn test_single_family_upstream_short_circuits() {
        // nothing listens on this port; a network round trip would fail
        let resolver = resolver(vec![(
            "v4only.example",
            Policy {
                upstream: "udp://127.0.0.1:9?type=A".to_string(),
                ..Policy::default()
            },
        )]);

        let answer = resolver
            .ns_request(&query("v4only.example", TYPE_AAAA), true)
            .await
            .unwrap();
        assert_eq!(&answer.response[6..8], &[0, 0]);
    }

    #[tokio::test]
    async fn test_other_types_get_empty_answers() {
        let resolver = resolver(vec![]);
        let answer = resolver.ns_request(&query("example.com", 16), true).await.unwrap();
        assert_eq!(&answer.response[2..4], &[0x81, 0x80]);
        assert_eq!(&answer.response[6..8], &[0, 0]);
    }

    #[tokio::test]
    async fn test_ns_lookup_without_upstream_is_virtual() {
        let resolver = resolver(vec![]);

        let (index, addresses) = resolver
            .ns_lookup("tunnel.example", HintFlags::HTTP2, "")
            .await
            .unwrap();
        assert_eq!(index, 1);
        assert!(addresses.is_empty());

        let (again, _) = resolver
            .ns_lookup("tunnel.example", HintFlags::HTTP2, "socks://x")
            .await
            .unwrap();
        assert_eq!(again, 1);
    }

    #[tokio::test]
    async fn test_ns_lookup_without_scheme_is_virtual() {
        let resolver = resolver(vec![]);

        let (index, addresses) = resolver
            .ns_lookup("x.example", HintFlags::NONE, "8.8.8.8")
            .await
            .unwrap();
        assert_eq!(index, 1);
        assert!(addresses.is_empty());
        assert_eq!(
            resolver.lookup_virtual(IpAddr::from([255, 0, 0, 1])),
            Some(("x.example".to_string(), HintFlags::NONE))
        );
    }

    #[tokio::test]
    async fn test_virtual_aaaa_is_a_response() {
        let resolver = resolver(vec![(
            "blocked.example",
            Policy {
                protocol: 1,
                ..Policy::default()
            },
        )]);
        let request = query("blocked.example", TYPE_AAAA);

        let answer = resolver.ns_request(&request, true).await.unwrap();
        assert_eq!(answer.index, 1);
        assert_eq!(&answer.response[..2], &[0x2a, 0x2a]);
        assert_eq!(&answer.response[2..4], &[0x81, 0x80]);
        assert_eq!(&answer.response[6..8], &[0, 0]);
    }

    #[tokio::test]
    async fn test_resolve_socket_addr_literal() {
        let resolver = resolver(vec![]);
        let addr = resolver
            .resolve_socket_addr("[2001:db8::1]", 443, HintFlags::NONE, "")
            .await
            .unwrap();
        assert_eq!(addr, "[2001:db8::1]:443".parse().unwrap());

        assert!(matches!(
            resolver
                .resolve_socket_addr("nothing.example", 443, HintFlags::NONE, "")
                .await,
            Err(ResolveError::NoSuchHost(_))
        ));
    }

    #[test]
    fn test_lookup_virtual_rejects_foreign_addresses() {
        let resolver = resolver(vec![]);
        assert_eq!(resolver.lookup_virtual(IpAddr::from([10, 0, 0, 1])), None);
        assert_eq!(resolver.lookup_virtual(IpAddr::from([255, 0, 0, 9])), None);
        assert_eq!(resolver.lookup_virtual("::1".parse().unwrap()), None);
    }
}

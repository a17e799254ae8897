// Answer section parsing
//
// Extracts A and AAAA addresses from an upstream reply. Everything else is
// skipped by RDLENGTH; CNAME and HTTPS payloads are only logged.

use super::name::{read_name_at, skip_name_at};
use super::{read_u16, read_u32, HEADER_LEN, TYPE_A, TYPE_AAAA, TYPE_CNAME, TYPE_HTTPS};
use crate::record::AddressSet;
use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Per-upstream rules applied to every accepted address
#[derive(Debug, Clone, Default)]
pub struct AnswerFilter {
    /// Addresses inside this network are treated as injected and dropped
    pub bad_subnet: Option<IpNetwork>,
    /// When set, A answers are mapped into this NAT64 prefix
    pub nat64_prefix: Option<Ipv6Addr>,
    /// Lower bound applied to every TTL
    pub min_ttl: u32,
}

impl AnswerFilter {
    /// Apply bad-subnet rejection and NAT64 rewriting to one address
    pub fn accept(&self, address: IpAddr) -> Option<IpAddr> {
        if let Some(bad) = &self.bad_subnet {
            if bad.contains(address) {
                log::debug!("Dropping {} (inside bad subnet {})", address, bad);
                return None;
            }
        }

        match (address, self.nat64_prefix) {
            (IpAddr::V4(v4), Some(prefix)) => Some(IpAddr::V6(embed_ipv4(prefix, v4))),
            _ => Some(address),
        }
    }
}

/// Place an IPv4 address in the low 32 bits of a /96 prefix
pub fn embed_ipv4(prefix: Ipv6Addr, v4: Ipv4Addr) -> Ipv6Addr {
    let mut octets = prefix.octets();
    octets[12..].copy_from_slice(&v4.octets());
    Ipv6Addr::from(octets)
}

/// Addresses extracted from one reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnswerFragments {
    pub ipv4: Option<AddressSet>,
    pub ipv6: Option<AddressSet>,
    /// Last CNAME target seen, for diagnostics
    pub cname: Option<String>,
}

impl AnswerFragments {
    pub fn is_empty(&self) -> bool {
        self.ipv4.is_none() && self.ipv6.is_none()
    }

    fn push(&mut self, address: IpAddr, ttl: u32, now: u64) {
        let slot = match address {
            IpAddr::V4(_) => &mut self.ipv4,
            IpAddr::V6(_) => &mut self.ipv6,
        };
        slot.get_or_insert_with(|| AddressSet::new(now + u64::from(ttl), Vec::new()))
            .addresses
            .push(address);
    }
}

/// Walk the answer section of `msg` and collect addresses
///
/// Parsing stops at the first truncated record; anything collected before
/// that point is kept.
pub fn parse_answer_section(msg: &[u8], filter: &AnswerFilter, now: u64) -> AnswerFragments {
    let mut fragments = AnswerFragments::default();

    let (Some(qdcount), Some(ancount)) = (read_u16(msg, 4), read_u16(msg, 6)) else {
        return fragments;
    };
    if ancount == 0 {
        return fragments;
    }

    let mut offset = HEADER_LEN;
    for _ in 0..qdcount {
        match skip_name_at(msg, offset) {
            Some(next) => offset = next + 4,
            None => return fragments,
        }
    }

    for _ in 0..ancount {
        let Some(next) = skip_name_at(msg, offset) else {
            break;
        };
        offset = next;

        let Some(rtype) = read_u16(msg, offset) else {
            break;
        };
        offset += 4;
        let Some(ttl) = read_u32(msg, offset) else {
            break;
        };
        let ttl = ttl.max(filter.min_ttl);
        offset += 4;
        let Some(rdlength) = read_u16(msg, offset) else {
            break;
        };
        offset += 2;
        let rdlength = usize::from(rdlength);
        let Some(rdata) = msg.get(offset..offset + rdlength) else {
            break;
        };

        match rtype {
            TYPE_A if rdlength == 4 => {
                let address = IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]));
                if let Some(address) = filter.accept(address) {
                    fragments.push(address, ttl, now);
                }
            }
            TYPE_AAAA if rdlength == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                let address = IpAddr::V6(Ipv6Addr::from(octets));
                if let Some(address) = filter.accept(address) {
                    fragments.push(address, ttl, now);
                }
            }
            TYPE_CNAME => {
                if let Some((cname, _)) = read_name_at(msg, offset) {
                    log::debug!("CNAME: {}", cname);
                    fragments.cname = Some(cname);
                }
            }
            TYPE_HTTPS => {
                log::trace!("HTTPS: {}", hex::encode(rdata));
            }
            _ => {}
        }

        offset += rdlength;
    }

    fragments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with(answers: &[(u16, u32, &[u8])]) -> Vec<u8> {
        let mut msg = vec![0xAB, 0xCD, 0x81, 0x80, 0, 1, 0, answers.len() as u8, 0, 0, 0, 0];
        msg.extend_from_slice(b"\x07example\x03com\x00\x00\x01\x00\x01");
        for (rtype, ttl, rdata) in answers {
            msg.extend_from_slice(&[0xC0, 0x0C]);
            msg.extend_from_slice(&rtype.to_be_bytes());
            msg.extend_from_slice(&[0x00, 0x01]);
            msg.extend_from_slice(&ttl.to_be_bytes());
            msg.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            msg.extend_from_slice(rdata);
        }
        msg
    }

    #[test]
    fn test_parse_a_and_aaaa() {
        let v6: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let msg = response_with(&[
            (TYPE_A, 60, &[1, 2, 3, 4]),
            (TYPE_A, 30, &[5, 6, 7, 8]),
            (TYPE_AAAA, 120, &v6.octets()),
        ]);

        let fragments = parse_answer_section(&msg, &AnswerFilter::default(), 1_000);
        let ipv4 = fragments.ipv4.unwrap();
        assert_eq!(ipv4.expiry, 1_060);
        assert_eq!(
            ipv4.addresses,
            vec![IpAddr::from([1, 2, 3, 4]), IpAddr::from([5, 6, 7, 8])]
        );
        assert_eq!(fragments.ipv6.unwrap().addresses, vec![IpAddr::V6(v6)]);
    }

    #[test]
    fn test_min_ttl_clamp() {
        let msg = response_with(&[(TYPE_A, 5, &[1, 2, 3, 4])]);
        let filter = AnswerFilter {
            min_ttl: 300,
            ..AnswerFilter::default()
        };

        let fragments = parse_answer_section(&msg, &filter, 0);
        assert_eq!(fragments.ipv4.unwrap().expiry, 300);
    }

    #[test]
    fn test_bad_subnet_is_dropped() {
        let msg = response_with(&[(TYPE_A, 60, &[10, 10, 34, 35]), (TYPE_A, 60, &[1, 2, 3, 4])]);
        let filter = AnswerFilter {
            bad_subnet: Some("10.10.34.0/24".parse().unwrap()),
            ..AnswerFilter::default()
        };

        let fragments = parse_answer_section(&msg, &filter, 0);
        assert_eq!(fragments.ipv4.unwrap().addresses, vec![IpAddr::from([1, 2, 3, 4])]);

        let only_bad = response_with(&[(TYPE_A, 60, &[10, 10, 34, 35])]);
        assert!(parse_answer_section(&only_bad, &filter, 0).is_empty());
    }

    #[test]
    fn test_nat64_prefix_moves_a_into_ipv6() {
        let msg = response_with(&[(TYPE_A, 60, &[93, 184, 216, 34])]);
        let filter = AnswerFilter {
            nat64_prefix: Some("64:ff9b::".parse().unwrap()),
            ..AnswerFilter::default()
        };

        let fragments = parse_answer_section(&msg, &filter, 0);
        assert!(fragments.ipv4.is_none());
        let expected: IpAddr = "64:ff9b::5db8:d822".parse().unwrap();
        assert_eq!(fragments.ipv6.unwrap().addresses, vec![expected]);
    }

    #[test]
    fn test_cname_and_https_are_skipped() {
        let msg = response_with(&[
            (TYPE_CNAME, 60, &[3, b'c', b'd', b'n', 0xC0, 0x0C]),
            (TYPE_HTTPS, 60, &[0, 1, 0]),
            (TYPE_A, 60, &[9, 9, 9, 9]),
        ]);

        let fragments = parse_answer_section(&msg, &AnswerFilter::default(), 0);
        assert_eq!(fragments.cname.as_deref(), Some("cdn.example.com"));
        assert_eq!(fragments.ipv4.unwrap().addresses, vec![IpAddr::from([9, 9, 9, 9])]);
    }

    #[test]
    fn test_truncation_keeps_earlier_records() {
        let msg = response_with(&[(TYPE_A, 60, &[1, 2, 3, 4]), (TYPE_A, 60, &[5, 6, 7, 8])]);
        let truncated = &msg[..msg.len() - 2];

        let fragments = parse_answer_section(truncated, &AnswerFilter::default(), 0);
        assert_eq!(fragments.ipv4.unwrap().addresses, vec![IpAddr::from([1, 2, 3, 4])]);
    }

    #[test]
    fn test_offsets_cover_every_record() {
        let msg = response_with(&[(TYPE_A, 60, &[1, 2, 3, 4]), (TYPE_CNAME, 60, &[0xC0, 0x0C])]);
        let question = crate::dns::read_question(&msg).unwrap();

        let mut offset = question.end;
        for _ in 0..2 {
            offset = skip_name_at(&msg, offset).unwrap();
            let rdlength = read_u16(&msg, offset + 8).unwrap() as usize;
            offset += 10 + rdlength;
        }
        assert_eq!(offset, msg.len());
    }
}

// Query and response synthesis
//
// Every synthesized RR names the question through the 0xC00C pointer, so
// responses are always the original question followed by answers.

use super::name::pack_name;
use super::{
    write_u16, DnsError, Result, CLASS_IN, QUESTION_POINTER, TYPE_A, TYPE_AAAA, TYPE_HTTPS,
    TYPE_OPT,
};
use crate::hints::HintFlags;
use crate::record::RecordSnapshot;
use bytes::BufMut;
use std::net::{IpAddr, Ipv4Addr};

/// TTL attached to virtual answers so clients come back quickly
pub const VIRTUAL_TTL: u32 = 16;

/// EDNS0 UDP payload size advertised in outgoing queries
const EDNS_UDP_PAYLOAD: u16 = 4096;
const EDNS_OPTION_ECS: u16 = 8;
const ECS_FAMILY_IPV4: u16 = 1;
const ECS_FAMILY_IPV6: u16 = 2;
const ECS_IPV4_PREFIX: u8 = 24;
const ECS_IPV6_PREFIX: u8 = 56;

const SVC_PARAM_ALPN: u16 = 1;
const SVC_PARAM_IPV4HINT: u16 = 4;
const SVC_PARAM_ECH: u16 = 5;
const SVC_PARAM_IPV6HINT: u16 = 6;

const RESPONSE_FLAGS: u16 = 0x8180;
const QUERY_FLAGS: u16 = 0x0100;

/// Build a recursive query for `name`, with an ECS option when `ecs` is set
///
/// IPv4 subnets are sent as /24 and IPv6 subnets as /56; the scope prefix is
/// always zero.
pub fn build_query(name: &str, qtype: u16, id: u16, ecs: Option<IpAddr>) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);

    buf.put_u16(id);
    buf.put_u16(QUERY_FLAGS);
    buf.put_u16(1); // QDCOUNT
    buf.put_u16(0); // ANCOUNT
    buf.put_u16(0); // NSCOUNT
    buf.put_u16(u16::from(ecs.is_some())); // ARCOUNT

    pack_name(&mut buf, name)?;
    buf.put_u16(qtype);
    buf.put_u16(CLASS_IN);

    if let Some(subnet) = ecs {
        let (family, source_prefix, address): (u16, u8, Vec<u8>) = match subnet {
            IpAddr::V4(v4) => (ECS_FAMILY_IPV4, ECS_IPV4_PREFIX, v4.octets()[..3].to_vec()),
            IpAddr::V6(v6) => (ECS_FAMILY_IPV6, ECS_IPV6_PREFIX, v6.octets()[..7].to_vec()),
        };
        let option_len = 4 + address.len() as u16;

        buf.put_u8(0); // root owner
        buf.put_u16(TYPE_OPT);
        buf.put_u16(EDNS_UDP_PAYLOAD);
        buf.put_u8(0); // extended RCODE
        buf.put_u8(0); // version
        buf.put_u16(0); // flags
        buf.put_u16(4 + option_len);
        buf.put_u16(EDNS_OPTION_ECS);
        buf.put_u16(option_len);
        buf.put_u16(family);
        buf.put_u8(source_prefix);
        buf.put_u8(0); // scope prefix
        buf.put_slice(&address);
    }

    Ok(buf)
}

/// Encode the virtual address for a Nose index
pub fn virtual_address(prefix: u8, index: usize) -> Ipv4Addr {
    Ipv4Addr::new(prefix, (index >> 16) as u8, (index >> 8) as u8, index as u8)
}

/// Recover the Nose index from a virtual address
pub fn virtual_index(prefix: u8, address: Ipv4Addr) -> Option<usize> {
    let octets = address.octets();
    if octets[0] != prefix {
        return None;
    }
    let index =
        (usize::from(octets[1]) << 16) | (usize::from(octets[2]) << 8) | usize::from(octets[3]);
    (index > 0).then_some(index)
}

fn put_rr_header(buf: &mut Vec<u8>, rtype: u16, ttl: u32, rdlength: u16) {
    buf.put_slice(&QUESTION_POINTER);
    buf.put_u16(rtype);
    buf.put_u16(CLASS_IN);
    buf.put_u32(ttl);
    buf.put_u16(rdlength);
}

fn put_address_rr(buf: &mut Vec<u8>, ttl: u32, address: IpAddr) {
    match address {
        IpAddr::V4(v4) => {
            put_rr_header(buf, TYPE_A, ttl, 4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            put_rr_header(buf, TYPE_AAAA, ttl, 16);
            buf.put_slice(&v6.octets());
        }
    }
}

fn put_svc_param(buf: &mut Vec<u8>, key: u16, value: &[u8]) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| DnsError::RecordTooLarge(value.len()))?;
    buf.put_u16(key);
    buf.put_u16(len);
    buf.put_slice(value);
    Ok(())
}

fn alpn_value(hint: HintFlags, h3_draft: bool) -> Vec<u8> {
    let mut ids: Vec<&[u8]> = Vec::new();
    if hint.contains(HintFlags::HTTP3) {
        ids.push(b"h3");
        if h3_draft {
            ids.push(b"h3-29");
        }
    }
    if hint.contains(HintFlags::HTTP2) {
        ids.push(b"h2");
    }

    let mut value = Vec::new();
    for id in ids {
        value.put_u8(id.len() as u8);
        value.put_slice(id);
    }
    value
}

/// Wrap SvcParams into a complete HTTPS RR with priority 1 and root target
fn put_https_rr(buf: &mut Vec<u8>, ttl: u32, params: &[u8]) -> Result<()> {
    let rdlength = 3 + params.len();
    let rdlength = u16::try_from(rdlength).map_err(|_| DnsError::RecordTooLarge(rdlength))?;
    put_rr_header(buf, TYPE_HTTPS, ttl, rdlength);
    buf.put_u16(1); // SvcPriority
    buf.put_u8(0); // TargetName "."
    buf.put_slice(params);
    Ok(())
}

/// Synthesize answer RRs for `qtype` from cached state
///
/// A and AAAA produce one RR per address. HTTPS produces a single record
/// carrying ALPN, ECH, ipv4hint and ipv6hint parameters, or nothing when
/// none applies.
pub fn build_answer_rrs(qtype: u16, ttl: u32, record: &RecordSnapshot) -> Result<(u16, Vec<u8>)> {
    let mut buf = Vec::new();

    match qtype {
        TYPE_A | TYPE_AAAA => {
            let set = if qtype == TYPE_A { &record.ipv4 } else { &record.ipv6 };
            let Some(set) = set else {
                return Ok((0, buf));
            };
            for address in &set.addresses {
                put_address_rr(&mut buf, ttl, *address);
            }
            Ok((set.addresses.len() as u16, buf))
        }
        TYPE_HTTPS => {
            let mut params = Vec::new();

            let alpn = alpn_value(record.hint, false);
            if !alpn.is_empty() {
                put_svc_param(&mut params, SVC_PARAM_ALPN, &alpn)?;
            }
            if !record.echo.is_empty() {
                put_svc_param(&mut params, SVC_PARAM_ECH, &record.echo)?;
            }
            if let Some(set) = record.ipv4.as_ref().filter(|s| !s.is_empty()) {
                let mut value = Vec::with_capacity(set.addresses.len() * 4);
                for address in &set.addresses {
                    match address {
                        IpAddr::V4(v4) => value.put_slice(&v4.octets()),
                        IpAddr::V6(_) => return Err(DnsError::MixedFamily(*address, "ipv4hint")),
                    }
                }
                put_svc_param(&mut params, SVC_PARAM_IPV4HINT, &value)?;
            }
            if let Some(set) = record.ipv6.as_ref().filter(|s| !s.is_empty()) {
                let mut value = Vec::with_capacity(set.addresses.len() * 16);
                for address in &set.addresses {
                    match address {
                        IpAddr::V6(v6) => value.put_slice(&v6.octets()),
                        IpAddr::V4(_) => return Err(DnsError::MixedFamily(*address, "ipv6hint")),
                    }
                }
                put_svc_param(&mut params, SVC_PARAM_IPV6HINT, &value)?;
            }

            if params.is_empty() {
                return Ok((0, buf));
            }
            put_https_rr(&mut buf, ttl, &params)?;
            Ok((1, buf))
        }
        _ => Ok((0, buf)),
    }
}

fn virtual_answer(qtype: u16, record: &RecordSnapshot, prefix: u8) -> Result<(u16, Vec<u8>)> {
    let mut buf = Vec::new();
    let address = virtual_address(prefix, record.index);

    match qtype {
        TYPE_A => {
            put_address_rr(&mut buf, VIRTUAL_TTL, IpAddr::V4(address));
            Ok((1, buf))
        }
        TYPE_HTTPS => {
            let mut params = Vec::new();
            let alpn = alpn_value(record.hint, true);
            if !alpn.is_empty() {
                put_svc_param(&mut params, SVC_PARAM_ALPN, &alpn)?;
            }
            if !record.echo.is_empty() {
                put_svc_param(&mut params, SVC_PARAM_ECH, &record.echo)?;
            }
            put_svc_param(&mut params, SVC_PARAM_IPV4HINT, &address.octets())?;
            put_https_rr(&mut buf, VIRTUAL_TTL, &params)?;
            Ok((1, buf))
        }
        _ => Ok((0, buf)),
    }
}

/// Turn a (question-only) request into a response
///
/// Records with a virtual index get placeholder answers, the rest get their
/// real cached addresses, except that a virtual AAAA question is answered
/// with no records. A synthesis failure yields a response without answers.
pub fn build_response(
    request: &[u8],
    qtype: u16,
    ttl: u32,
    record: &RecordSnapshot,
    virtual_prefix: u8,
) -> Vec<u8> {
    let mut response = Vec::with_capacity(request.len() + 64);
    response.extend_from_slice(request);
    write_u16(&mut response, 2, RESPONSE_FLAGS);

    // virtual names have no IPv6 side
    if record.index > 0 && qtype == TYPE_AAAA {
        write_u16(&mut response, 6, 0);
        return response;
    }

    let answers = if record.index > 0 {
        virtual_answer(qtype, record, virtual_prefix)
    } else {
        build_answer_rrs(qtype, ttl, record)
    };

    match answers {
        Ok((count, rrs)) => {
            write_u16(&mut response, 6, count);
            response.extend_from_slice(&rrs);
        }
        Err(e) => {
            log::error!("Failed to synthesize answer: {}", e);
            write_u16(&mut response, 6, 0);
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{parse_answer_section, read_question, AnswerFilter};
    use crate::record::AddressSet;

    fn request(name: &str, qtype: u16) -> Vec<u8> {
        build_query(name, qtype, 0x4242, None).unwrap()
    }

    #[test]
    fn test_build_query_round_trip() {
        let query = build_query("mail.example.org", TYPE_AAAA, 7, None).unwrap();
        let question = read_question(&query).unwrap();

        assert_eq!(question.name, "mail.example.org");
        assert_eq!(question.qtype, TYPE_AAAA);
        assert_eq!(question.end, query.len());
        assert_eq!(&query[..2], &[0, 7]);
        assert_eq!(&query[10..12], &[0, 0]);
    }

    #[test]
    fn test_build_query_ecs_ipv4() {
        let query = build_query("example.com", TYPE_A, 1, Some("203.0.113.77".parse().unwrap()))
            .unwrap();
        let question = read_question(&query).unwrap();
        let opt = &query[question.end..];

        assert_eq!(&query[10..12], &[0, 1]);
        assert_eq!(&opt[1..3], &TYPE_OPT.to_be_bytes());
        assert_eq!(&opt[9..11], &11u16.to_be_bytes());
        // code 8, len 7, family 1, /24, scope 0, three octets
        assert_eq!(&opt[11..], &[0, 8, 0, 7, 0, 1, 24, 0, 203, 0, 113]);
    }

    #[test]
    fn test_build_query_ecs_ipv6() {
        let query =
            build_query("example.com", TYPE_A, 1, Some("2001:db8:aa:bb::1".parse().unwrap()))
                .unwrap();
        let question = read_question(&query).unwrap();
        let opt = &query[question.end..];

        assert_eq!(&opt[9..11], &15u16.to_be_bytes());
        assert_eq!(
            &opt[11..],
            &[0, 8, 0, 11, 0, 2, 56, 0, 0x20, 0x01, 0x0d, 0xb8, 0x00, 0xaa, 0x00]
        );
    }

    #[test]
    fn test_answer_rrs_round_trip_addresses() {
        let addresses: Vec<IpAddr> = vec![
            "1.2.3.4".parse().unwrap(),
            "5.6.7.8".parse().unwrap(),
            "9.10.11.12".parse().unwrap(),
        ];
        let record = RecordSnapshot {
            ipv4: Some(AddressSet::new(0, addresses.clone())),
            ..RecordSnapshot::default()
        };

        let response = build_response(&request("example.com", TYPE_A), TYPE_A, 60, &record, 255);
        let parsed = parse_answer_section(&response, &AnswerFilter::default(), 0);

        assert_eq!(&response[6..8], &[0, 3]);
        assert_eq!(parsed.ipv4.unwrap().addresses, addresses);
    }

    #[test]
    fn test_https_rr_layout() {
        let record = RecordSnapshot {
            hint: HintFlags::HTTP3 | HintFlags::HTTP2,
            ipv4: Some(AddressSet::synthetic("1.2.3.4".parse().unwrap())),
            ipv6: Some(AddressSet::synthetic("2001:db8::1".parse().unwrap())),
            echo: vec![0xEE, 0xFF],
            ..RecordSnapshot::default()
        };

        let (count, rr) = build_answer_rrs(TYPE_HTTPS, 300, &record).unwrap();
        assert_eq!(count, 1);
        assert_eq!(&rr[..6], &[0xC0, 0x0C, 0, 65, 0, 1]);
        assert_eq!(&rr[6..10], &300u32.to_be_bytes());
        assert_eq!(usize::from(u16::from_be_bytes([rr[10], rr[11]])), rr.len() - 12);
        assert_eq!(&rr[12..15], &[0, 1, 0]);

        let params = &rr[15..];
        assert_eq!(&params[..10], &[0, 1, 0, 6, 2, b'h', b'3', 2, b'h', b'2']);
        assert_eq!(&params[10..16], &[0, 5, 0, 2, 0xEE, 0xFF]);
        assert_eq!(&params[16..24], &[0, 4, 0, 4, 1, 2, 3, 4]);
        assert_eq!(&params[24..28], &[0, 6, 0, 16]);
        assert_eq!(params.len(), 28 + 16);
    }

    #[test]
    fn test_https_rr_omitted_without_params() {
        let (count, rr) = build_answer_rrs(TYPE_HTTPS, 300, &RecordSnapshot::default()).unwrap();
        assert_eq!(count, 0);
        assert!(rr.is_empty());
    }

    #[test]
    fn test_https_rr_rejects_mixed_family() {
        let record = RecordSnapshot {
            ipv4: Some(AddressSet::synthetic("::1".parse().unwrap())),
            ..RecordSnapshot::default()
        };
        assert!(matches!(
            build_answer_rrs(TYPE_HTTPS, 0, &record),
            Err(DnsError::MixedFamily(_, "ipv4hint"))
        ));

        let response = build_response(&request("example.com", TYPE_HTTPS), TYPE_HTTPS, 0, &record, 255);
        assert_eq!(&response[6..8], &[0, 0]);
    }

    #[test]
    fn test_virtual_a_answer() {
        let record = RecordSnapshot {
            index: 5,
            ..RecordSnapshot::default()
        };
        let req = request("blocked.example", TYPE_A);

        let response = build_response(&req, TYPE_A, 0, &record, 198);
        let parsed = parse_answer_section(&response, &AnswerFilter::default(), 0);

        assert_eq!(&response[2..4], &[0x81, 0x80]);
        assert_eq!(parsed.ipv4.unwrap().addresses, vec![IpAddr::from([198, 0, 0, 5])]);
        assert_eq!(&response[req.len() + 6..req.len() + 10], &VIRTUAL_TTL.to_be_bytes());
    }

    #[test]
    fn test_virtual_aaaa_is_unanswered() {
        let record = RecordSnapshot {
            index: 5,
            ipv6: Some(AddressSet::synthetic("2001:db8::1".parse().unwrap())),
            ..RecordSnapshot::default()
        };
        let req = request("blocked.example", TYPE_AAAA);

        let response = build_response(&req, TYPE_AAAA, 0, &record, 255);
        assert_eq!(response.len(), req.len());
        assert_eq!(&response[..2], &req[..2]);
        assert_eq!(&response[2..4], &[0x81, 0x80]);
        assert_eq!(&response[6..8], &[0, 0]);
        assert_eq!(&response[12..], &req[12..]);
    }

    #[test]
    fn test_virtual_https_answer() {
        let record = RecordSnapshot {
            index: 0x0102,
            hint: HintFlags::HTTP3,
            ..RecordSnapshot::default()
        };
        let req = request("blocked.example", TYPE_HTTPS);

        let response = build_response(&req, TYPE_HTTPS, 3600, &record, 255);
        let params = &response[req.len() + 15..];

        assert_eq!(&response[6..8], &[0, 1]);
        assert_eq!(
            params,
            &[
                0, 1, 0, 9, 2, b'h', b'3', 5, b'h', b'3', b'-', b'2', b'9', 0, 4, 0, 4, 255, 0, 1,
                2
            ]
        );
    }

    #[test]
    fn test_virtual_address_encoding() {
        let address = virtual_address(255, 70_000);
        assert_eq!(address, Ipv4Addr::new(255, 1, 17, 112));
        assert_eq!(virtual_index(255, address), Some(70_000));
        assert_eq!(virtual_index(254, address), None);
        assert_eq!(virtual_index(255, Ipv4Addr::new(255, 0, 0, 0)), None);
    }
}

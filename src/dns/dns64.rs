// DNS64 answer synthesis (RFC 6147)
//
// Only ever applied to replies of our own secondary A query. Compression
// pointers that target bytes after the first rewritten record would be
// shifted by the rewrite, so answers referencing each other by pointer are
// not supported; pointers to the question are.

use super::name::{read_question, skip_name_at};
use super::{read_u16, TYPE_A, TYPE_AAAA};
use bytes::BufMut;
use std::net::Ipv6Addr;

/// Rewrite every A answer of `response` into an AAAA answer under `prefix`
///
/// The header, question, non-A answers and the authority and additional
/// sections are copied unchanged. Returns `None` if the message is
/// truncated.
pub fn translate_dns64(response: &[u8], prefix: Ipv6Addr) -> Option<Vec<u8>> {
    let question = read_question(response)?;
    let ancount = read_u16(response, 6)?;
    let prefix = prefix.octets();

    let mut out = Vec::with_capacity(response.len() + 12 * usize::from(ancount));
    out.extend_from_slice(&response[..question.end]);

    let mut offset = question.end;
    for _ in 0..ancount {
        let name_end = skip_name_at(response, offset)?;
        let rtype = read_u16(response, name_end)?;
        let rdlength = usize::from(read_u16(response, name_end + 8)?);
        let rdata_start = name_end + 10;
        let rdata = response.get(rdata_start..rdata_start + rdlength)?;

        out.extend_from_slice(&response[offset..name_end]);
        if rtype == TYPE_A && rdlength == 4 {
            out.put_u16(TYPE_AAAA);
            out.extend_from_slice(&response[name_end + 2..name_end + 8]); // class, TTL
            out.put_u16(16);
            out.extend_from_slice(&prefix[..12]);
            out.extend_from_slice(rdata);
        } else {
            out.extend_from_slice(&response[name_end..rdata_start + rdlength]);
        }

        offset = rdata_start + rdlength;
    }

    out.extend_from_slice(&response[offset..]);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{parse_answer_section, AnswerFilter, TYPE_CNAME};
    use std::net::IpAddr;

    fn a_response() -> Vec<u8> {
        let mut msg = vec![0x55, 0x66, 0x81, 0x80, 0, 1, 0, 2, 0, 0, 0, 0];
        msg.extend_from_slice(b"\x07example\x03com\x00\x00\x01\x00\x01");
        // CNAME example.com -> example.com (kept verbatim)
        msg.extend_from_slice(&[0xC0, 0x0C, 0, TYPE_CNAME as u8, 0, 1, 0, 0, 0, 60, 0, 2, 0xC0, 0x0C]);
        // A 93.184.216.34
        msg.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1, 0, 0, 0x0e, 0x10, 0, 4, 93, 184, 216, 34]);
        msg
    }

    #[test]
    fn test_translate_single_a() {
        let response = a_response();
        let prefix: Ipv6Addr = "64:ff9b::".parse().unwrap();

        let translated = translate_dns64(&response, prefix).unwrap();
        let question_end = read_question(&response).unwrap().end;

        assert_eq!(&translated[..question_end], &response[..question_end]);
        assert_eq!(translated.len(), response.len() + 12);

        let parsed = parse_answer_section(&translated, &AnswerFilter::default(), 0);
        assert!(parsed.ipv4.is_none());
        let ipv6 = parsed.ipv6.unwrap();
        assert_eq!(ipv6.expiry, 3600);
        let IpAddr::V6(address) = ipv6.addresses[0] else {
            panic!("expected an IPv6 address");
        };
        assert_eq!(&address.octets()[..12], &prefix.octets()[..12]);
        assert_eq!(&address.octets()[12..], &[93, 184, 216, 34]);
    }

    #[test]
    fn test_translate_rejects_truncated() {
        let response = a_response();
        let prefix: Ipv6Addr = "64:ff9b::".parse().unwrap();
        assert!(translate_dns64(&response[..response.len() - 1], prefix).is_none());
    }
}

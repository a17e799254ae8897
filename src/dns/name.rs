// Domain name reading, skipping and packing
//
// Name compression is followed for exactly one hop: a pointer may appear at
// the end of a name, its target is decoded without following any further
// pointer, and the reader resumes right after the two pointer bytes. This
// covers every message produced by mainstream recursive resolvers for a
// single question, and it is all the synthetic answers here ever emit.

use super::{read_u16, DnsError, Result, HEADER_LEN};
use bytes::BufMut;

/// Longest label allowed by RFC 1035
pub const MAX_LABEL_LEN: usize = 63;

const POINTER_MASK: u8 = 0xC0;

/// The single question of a DNS message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Dotted name, case preserved, without a trailing dot
    pub name: String,
    pub qtype: u16,
    /// Offset of the first byte after QTYPE and QCLASS
    pub end: usize,
}

/// Read the question that starts right after the header
///
/// Returns `None` for truncated input, a root (empty) name, compressed
/// labels or non UTF-8 labels; callers must drop the request.
pub fn read_question(msg: &[u8]) -> Option<Question> {
    let mut offset = HEADER_LEN;
    let mut name = String::new();

    loop {
        let len = usize::from(*msg.get(offset)?);
        offset += 1;
        if len == 0 {
            break;
        }
        if len > MAX_LABEL_LEN {
            return None;
        }
        let label = msg.get(offset..offset + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(std::str::from_utf8(label).ok()?);
        offset += len;
    }

    if name.is_empty() {
        return None;
    }

    let qtype = read_u16(msg, offset)?;
    let end = offset + 4;
    if end > msg.len() {
        return None;
    }

    Some(Question { name, qtype, end })
}

/// Read a possibly compressed name anywhere in `msg`
///
/// Returns the dotted name and the offset just past it.
pub fn read_name_at(msg: &[u8], offset: usize) -> Option<(String, usize)> {
    read_name(msg, offset, true)
}

fn read_name(msg: &[u8], mut offset: usize, follow: bool) -> Option<(String, usize)> {
    let mut name = String::new();

    loop {
        let len = *msg.get(offset)?;
        offset += 1;
        if len == 0 {
            break;
        }

        if len & POINTER_MASK == POINTER_MASK {
            if !follow {
                return None;
            }
            let low = *msg.get(offset)?;
            let target = (usize::from(len & !POINTER_MASK) << 8) | usize::from(low);
            // forward or self references can only come from hostile input
            if target >= offset - 1 {
                return None;
            }
            let (suffix, _) = read_name(msg, target, false)?;
            if !name.is_empty() && !suffix.is_empty() {
                name.push('.');
            }
            name.push_str(&suffix);
            return Some((name, offset + 1));
        }

        let len = usize::from(len);
        if len > MAX_LABEL_LEN {
            return None;
        }
        let label = msg.get(offset..offset + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(std::str::from_utf8(label).ok()?);
        offset += len;
    }

    Some((name, offset))
}

/// Advance past a name without decoding it
///
/// Returns `None` when the name runs off the end of the message.
pub fn skip_name_at(msg: &[u8], mut offset: usize) -> Option<usize> {
    loop {
        let len = *msg.get(offset)?;
        offset += 1;
        if len == 0 {
            return Some(offset);
        }
        if len & POINTER_MASK == POINTER_MASK {
            msg.get(offset)?;
            return Some(offset + 1);
        }
        let len = usize::from(len);
        if len > MAX_LABEL_LEN {
            return None;
        }
        offset += len;
        if offset > msg.len() {
            return None;
        }
    }
}

/// Write `name` in uncompressed wire form
///
/// A trailing dot and empty labels are ignored, so `""` and `"."` both pack
/// to the root name.
pub fn pack_name<B: BufMut>(buf: &mut B, name: &str) -> Result<()> {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        if label.len() > MAX_LABEL_LEN {
            return Err(DnsError::Malformed("label longer than 63 bytes"));
        }
        buf.put_u8(label.len() as u8);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);
    Ok(())
}

/// Cache key form of a name: trailing dot removed, case preserved
pub fn normalize_name(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

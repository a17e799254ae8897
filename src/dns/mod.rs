// DNS wire codec
//
// Hand-rolled reader and writer for the small subset of RFC 1035 the
// resolver needs: one question, answers with at most one level of name
// compression, EDNS0 client subnet, and synthesized A/AAAA/HTTPS records.

pub mod answer;
pub mod builder;
pub mod dns64;
pub mod name;

pub use answer::{parse_answer_section, AnswerFilter, AnswerFragments};
pub use builder::{
    build_answer_rrs, build_query, build_response, virtual_address, virtual_index, VIRTUAL_TTL,
};
pub use dns64::translate_dns64;
pub use name::{normalize_name, pack_name, read_name_at, read_question, skip_name_at, Question};

use std::net::IpAddr;
use thiserror::Error;

/// Size of the fixed DNS header
pub const HEADER_LEN: usize = 12;

/// Largest message we are willing to buffer from any transport
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

/// Compression pointer to the question name at offset 12
pub const QUESTION_POINTER: [u8; 2] = [0xC0, 0x0C];

pub const TYPE_A: u16 = 1;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_OPT: u16 = 41;
pub const TYPE_HTTPS: u16 = 65;

pub const CLASS_IN: u16 = 1;

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("Malformed DNS message: {0}")]
    Malformed(&'static str),

    #[error("Address {0} does not belong to the {1} hint set")]
    MixedFamily(IpAddr, &'static str),

    #[error("Synthesized record too large: {0} bytes")]
    RecordTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, DnsError>;

/// Read the transaction ID of a message, if it has one
pub fn message_id(msg: &[u8]) -> Option<u16> {
    msg.get(0..2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

/// Read a big-endian u16 at `offset`
pub(crate) fn read_u16(msg: &[u8], offset: usize) -> Option<u16> {
    msg.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
}

/// Read a big-endian u32 at `offset`
pub(crate) fn read_u32(msg: &[u8], offset: usize) -> Option<u32> {
    msg.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// Overwrite a big-endian u16 at `offset`; out-of-range writes are ignored
pub(crate) fn write_u16(msg: &mut [u8], offset: usize, value: u16) {
    if let Some(slot) = msg.get_mut(offset..offset + 2) {
        slot.copy_from_slice(&value.to_be_bytes());
    }
}

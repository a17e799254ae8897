//! Per-domain behavior hints
//!
//! A small bitset attached to every cached domain. Some bits steer how the
//! resolver queries upstream (IPv6 preference), some shape synthesized
//! `HTTPS` answers (ALPN), and the rest are consumed by the dialer and the
//! interception layer.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Bitset of resolution and behavior hints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HintFlags(u32);

impl HintFlags {
    pub const NONE: HintFlags = HintFlags(0);
    /// Resolve AAAA instead of A
    pub const IPV6: HintFlags = HintFlags(1 << 0);
    /// Advertise `h3` in synthesized HTTPS records
    pub const HTTP3: HintFlags = HintFlags(1 << 1);
    /// Advertise `h2` in synthesized HTTPS records
    pub const HTTP2: HintFlags = HintFlags(1 << 2);
    /// Destination accepts UDP (QUIC) traffic
    pub const UDP: HintFlags = HintFlags(1 << 3);
    /// Dial with TCP Fast Open
    pub const TFO: HintFlags = HintFlags(1 << 4);
    /// Always hand out a virtual address
    pub const MODIFY: HintFlags = HintFlags(1 << 5);

    /// Bits that are meaningful to the DNS layer and get stored on records
    pub const DNS_MASK: HintFlags =
        HintFlags(Self::IPV6.0 | Self::HTTP3.0 | Self::HTTP2.0 | Self::UDP.0);

    const NAMES: [(&'static str, HintFlags); 6] = [
        ("ipv6", Self::IPV6),
        ("h3", Self::HTTP3),
        ("h2", Self::HTTP2),
        ("udp", Self::UDP),
        ("tfo", Self::TFO),
        ("modify", Self::MODIFY),
    ];

    pub const fn from_bits(bits: u32) -> Self {
        HintFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// All bits of `other` are set
    pub const fn contains(self, other: HintFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// At least one bit of `other` is set
    pub const fn intersects(self, other: HintFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// Parse a single hint name as used in configuration files
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::NAMES
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, flag)| *flag)
    }

    /// Names of all set bits, in declaration order
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(n, _)| *n)
            .collect()
    }
}

impl BitOr for HintFlags {
    type Output = HintFlags;

    fn bitor(self, rhs: HintFlags) -> HintFlags {
        HintFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for HintFlags {
    fn bitor_assign(&mut self, rhs: HintFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for HintFlags {
    type Output = HintFlags;

    fn bitand(self, rhs: HintFlags) -> HintFlags {
        HintFlags(self.0 & rhs.0)
    }
}

impl fmt::Display for HintFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        write!(f, "{}", self.names().join("|"))
    }
}

impl Serialize for HintFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for HintFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        let mut flags = HintFlags::NONE;
        for name in &names {
            flags |= HintFlags::from_name(name)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown hint: {}", name)))?;
        }
        Ok(flags)
    }
}

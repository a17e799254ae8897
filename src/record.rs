//! Cached resolution state for a single domain
//!
//! A [`DomainRecord`] is shared by every request for the same name, so all of
//! its fields only ever move forward: address sets and the echo bytes are
//! published once, the virtual index goes from 0 to its final value once.
//! Readers work on a [`RecordSnapshot`] and never see a half-written record.

use crate::hints::HintFlags;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Resolved addresses of one family
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet {
    /// Absolute expiry in unix seconds, 0 for synthetic or fallback sets
    pub expiry: u64,
    /// Addresses in answer order
    pub addresses: Vec<IpAddr>,
}

impl AddressSet {
    pub fn new(expiry: u64, addresses: Vec<IpAddr>) -> Self {
        Self { expiry, addresses }
    }

    /// A set with no real TTL
    pub fn synthetic(address: IpAddr) -> Self {
        Self {
            expiry: 0,
            addresses: vec![address],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Seconds left before `expiry`, 0 for synthetic sets
    pub fn remaining_ttl(&self, now: u64) -> u32 {
        u32::try_from(self.expiry.saturating_sub(now)).unwrap_or(u32::MAX)
    }
}

/// Process-lifetime cache entry for one domain
#[derive(Debug, Default)]
pub struct DomainRecord {
    index: AtomicUsize,
    hint: AtomicU32,
    ipv4: OnceLock<AddressSet>,
    ipv6: OnceLock<AddressSet>,
    echo: OnceLock<Vec<u8>>,
}

impl DomainRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a fresh record carrying a copy of another record's state
    pub fn from_snapshot(snapshot: &RecordSnapshot) -> Self {
        let record = Self {
            index: AtomicUsize::new(snapshot.index),
            hint: AtomicU32::new(snapshot.hint.bits()),
            ..Self::default()
        };
        if let Some(set) = &snapshot.ipv4 {
            record.publish_ipv4(set.clone());
        }
        if let Some(set) = &snapshot.ipv6 {
            record.publish_ipv6(set.clone());
        }
        if !snapshot.echo.is_empty() {
            record.set_echo(snapshot.echo.clone());
        }
        record
    }

    /// Virtual index, 0 when none has been assigned
    pub fn index(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    /// Set the virtual index if the record has none yet
    ///
    /// Returns the index the record ends up with, which is the earlier one
    /// when another task won the race.
    pub fn set_index(&self, index: usize) -> usize {
        match self
            .index
            .compare_exchange(0, index, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => index,
            Err(current) => current,
        }
    }

    pub fn hint(&self) -> HintFlags {
        HintFlags::from_bits(self.hint.load(Ordering::Acquire))
    }

    pub fn set_hint(&self, hint: HintFlags) {
        self.hint.store(hint.bits(), Ordering::Release);
    }

    pub fn ipv4(&self) -> Option<&AddressSet> {
        self.ipv4.get()
    }

    pub fn ipv6(&self) -> Option<&AddressSet> {
        self.ipv6.get()
    }

    /// Resolved addresses for a query type (1 or 28)
    pub fn addresses_for(&self, qtype: u16) -> Option<&AddressSet> {
        match qtype {
            crate::dns::TYPE_A => self.ipv4(),
            crate::dns::TYPE_AAAA => self.ipv6(),
            _ => None,
        }
    }

    /// Publish the IPv4 set unless one is already present
    ///
    /// Empty sets are never published, so a later answer can still fill the
    /// family.
    pub fn publish_ipv4(&self, set: AddressSet) -> bool {
        !set.is_empty() && self.ipv4.set(set).is_ok()
    }

    /// Publish the IPv6 set unless one is already present
    pub fn publish_ipv6(&self, set: AddressSet) -> bool {
        !set.is_empty() && self.ipv6.set(set).is_ok()
    }

    pub fn echo(&self) -> &[u8] {
        self.echo.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Attach the opaque ECH config echoed in synthesized HTTPS answers
    pub fn set_echo(&self, echo: Vec<u8>) -> bool {
        self.echo.set(echo).is_ok()
    }

    /// Consistent copy of the current state
    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            index: self.index(),
            hint: self.hint(),
            ipv4: self.ipv4().cloned(),
            ipv6: self.ipv6().cloned(),
            echo: self.echo().to_vec(),
        }
    }
}

/// Point-in-time view of a [`DomainRecord`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSnapshot {
    pub index: usize,
    pub hint: HintFlags,
    pub ipv4: Option<AddressSet>,
    pub ipv6: Option<AddressSet>,
    pub echo: Vec<u8>,
}

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

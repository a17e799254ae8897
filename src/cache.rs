//! Resolution cache keyed by domain name
//!
//! Entries live for the whole process. A miss on `a.b.example.com` may be
//! seeded from the nearest cached ancestor (`b.example.com`,
//! `example.com`, ...) up to a configured depth, which lets a policy
//! attached to a parent domain cover all of its subdomains without a fresh
//! upstream query per name.

use crate::dns::normalize_name;
use crate::record::DomainRecord;
use dashmap::DashMap;
use std::sync::Arc;

/// Concurrent map of domain name to shared [`DomainRecord`]
#[derive(Debug, Default)]
pub struct DnsCache {
    entries: DashMap<String, Arc<DomainRecord>>,
    subdomain_depth: usize,
}

impl DnsCache {
    /// Create an empty cache that checks up to `subdomain_depth` ancestors
    pub fn new(subdomain_depth: usize) -> Self {
        Self {
            entries: DashMap::new(),
            subdomain_depth,
        }
    }

    /// Exact lookup, no ancestor fallback
    pub fn get(&self, name: &str) -> Option<Arc<DomainRecord>> {
        self.entries
            .get(normalize_name(name))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Store `record` under `name`, replacing any existing entry
    pub fn insert(&self, name: &str, record: DomainRecord) -> Arc<DomainRecord> {
        let record = Arc::new(record);
        self.entries
            .insert(normalize_name(name).to_string(), Arc::clone(&record));
        record
    }

    /// Return the record for `name`, creating it on a miss
    ///
    /// A new record starts as a copy of the nearest cached ancestor, or
    /// empty. Concurrent callers for the same name always get the same
    /// record object.
    pub fn lookup_or_insert(&self, name: &str) -> Arc<DomainRecord> {
        let name = normalize_name(name);
        if let Some(existing) = self.entries.get(name) {
            return Arc::clone(existing.value());
        }

        let seeded = match self.nearest_ancestor(name) {
            Some((parent, record)) => {
                log::trace!("Seeding {} from cached {}", name, parent);
                DomainRecord::from_snapshot(&record.snapshot())
            }
            None => DomainRecord::new(),
        };

        let entry = self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(seeded));
        Arc::clone(entry.value())
    }

    fn nearest_ancestor<'a>(&self, name: &'a str) -> Option<(&'a str, Arc<DomainRecord>)> {
        let mut rest = name;
        for _ in 0..self.subdomain_depth {
            let dot = rest.find('.')?;
            rest = &rest[dot + 1..];
            if rest.is_empty() {
                return None;
            }
            if let Some(record) = self.entries.get(rest) {
                return Some((rest, Arc::clone(record.value())));
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

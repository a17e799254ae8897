//! Per-domain resolution policy
//!
//! The resolver asks the policy once per cache miss which upstream to use for
//! a name and how the name should be treated downstream.

use crate::dns::normalize_name;
use crate::hints::HintFlags;
use std::collections::HashMap;

/// How one domain is resolved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    /// Upstream URL, empty for names handled only through virtual addresses
    pub upstream: String,
    pub hint: HintFlags,
    /// Interception protocol selected for the domain, 0 for none
    pub protocol: u8,
}

impl Policy {
    /// The name must be mapped to a virtual address
    pub fn wants_virtual(&self) -> bool {
        self.protocol != 0 || self.hint.contains(HintFlags::MODIFY)
    }
}

pub trait PolicyLookup: Send + Sync {
    fn lookup(&self, name: &str) -> Option<Policy>;
}

/// Fixed policy table matched on the name or its nearest listed ancestor
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    rules: HashMap<String, Policy>,
}

impl StaticPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the policy for `domain` and everything below it
    pub fn insert(&mut self, domain: &str, policy: Policy) {
        self.rules
            .insert(normalize_name(domain).to_ascii_lowercase(), policy);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl FromIterator<(String, Policy)> for StaticPolicy {
    fn from_iter<I: IntoIterator<Item = (String, Policy)>>(iter: I) -> Self {
        let mut table = StaticPolicy::new();
        for (domain, policy) in iter {
            table.insert(&domain, policy);
        }
        table
    }
}

impl PolicyLookup for StaticPolicy {
    fn lookup(&self, name: &str) -> Option<Policy> {
        let name = normalize_name(name).to_ascii_lowercase();
        let mut candidate = name.as_str();
        loop {
            if let Some(policy) = self.rules.get(candidate) {
                return Some(policy.clone());
            }
            let (_, parent) = candidate.split_once('.')?;
            candidate = parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> StaticPolicy {
        [
            (
                "example.com".to_string(),
                Policy {
                    upstream: "udp://127.0.0.1:53".to_string(),
                    hint: HintFlags::HTTP2,
                    protocol: 0,
                },
            ),
            (
                "blocked.example.com.".to_string(),
                Policy {
                    upstream: String::new(),
                    hint: HintFlags::NONE,
                    protocol: 1,
                },
            ),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_exact_and_suffix_matches() {
        let policy = table();

        assert_eq!(
            policy.lookup("Example.COM").unwrap().upstream,
            "udp://127.0.0.1:53"
        );
        assert_eq!(policy.lookup("www.example.com").unwrap().hint, HintFlags::HTTP2);
        assert!(policy.lookup("cdn.blocked.example.com").unwrap().wants_virtual());
        assert!(policy.lookup("example.org").is_none());
        assert!(policy.lookup("notexample.com").is_none());
    }

    #[test]
    fn test_modify_hint_wants_virtual() {
        let policy = Policy {
            hint: HintFlags::MODIFY,
            ..Policy::default()
        };
        assert!(policy.wants_virtual());
        assert!(!Policy::default().wants_virtual());
    }
}

//! Virtual address table
//!
//! Names that must be intercepted are given a small integer index, and the
//! index is what ends up inside the placeholder addresses handed to clients.
//! The interception layer later maps the destination address it sees back to
//! the name through this table. Indices are dense, start at 1 and never
//! change for the lifetime of the process. Placeholder IPv4 addresses carry
//! 24 bits of index, so the table stops growing at [`MAX_VIRTUAL_INDEX`].

use std::collections::HashMap;
use std::sync::RwLock;

/// Name stored at index 0 so real entries start at 1
pub const SENTINEL_NAME: &str = "nose.invalid";

/// Largest index that fits the low three octets of a placeholder address
pub const MAX_VIRTUAL_INDEX: usize = 0x00FF_FFFF;

#[derive(Debug)]
struct NoseInner {
    names: Vec<String>,
    by_name: HashMap<String, usize>,
}

/// Append-only registry of intercepted names
#[derive(Debug)]
pub struct VirtualAddressTable {
    inner: RwLock<NoseInner>,
    max_index: usize,
}

impl VirtualAddressTable {
    pub fn new() -> Self {
        Self::with_max_index(MAX_VIRTUAL_INDEX)
    }

    fn with_max_index(max_index: usize) -> Self {
        Self {
            inner: RwLock::new(NoseInner {
                names: vec![SENTINEL_NAME.to_string()],
                by_name: HashMap::new(),
            }),
            max_index,
        }
    }

    /// Index for `name`, assigning the next free one on first use
    ///
    /// Returns `None` once every index up to the limit is taken.
    pub fn assign_or_get(&self, name: &str) -> Option<usize> {
        if let Some(index) = self.index_of(name) {
            return Some(index);
        }

        let mut inner = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(&index) = inner.by_name.get(name) {
            return Some(index);
        }
        let index = inner.names.len();
        if index > self.max_index {
            log::error!("Virtual address space exhausted, {} stays unindexed", name);
            return None;
        }
        inner.names.push(name.to_string());
        inner.by_name.insert(name.to_string(), index);
        log::debug!("Assigned virtual index {} to {}", index, name);
        Some(index)
    }

    /// Index already assigned to `name`
    pub fn index_of(&self, name: &str) -> Option<usize> {
        let inner = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.by_name.get(name).copied()
    }

    /// Name registered at `index`; the sentinel slot is never returned
    pub fn name_of(&self, index: usize) -> Option<String> {
        if index == 0 {
            return None;
        }
        let inner = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.names.get(index).cloned()
    }

    /// Number of assigned indices, excluding the sentinel
    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(guard) => guard.names.len() - 1,
            Err(poisoned) => poisoned.into_inner().names.len() - 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for VirtualAddressTable {
    fn default() -> Self {
        Self::new()
    }
}

//! Traversal cache: unfiltered walk results kept per root table
use crate::arch::{AddressHalf, Root};
use crate::range::PageRange;
use indexmap::IndexMap;
use serde::Serialize;

/// Cache key: a root table and the half of the address space it translates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RootKey {
    pub address: u64,
    pub half: AddressHalf,
}

impl From<Root> for RootKey {
    fn from(root: Root) -> Self {
        RootKey {
            address: root.address,
            half: root.half,
        }
    }
}

/// Walk results retained across calls, in insertion order.
///
/// Owned by the caller and handed to [`crate::translation::walk`] by reference.
#[derive(Debug, Default, Clone)]
pub struct TraversalCache {
    entries: IndexMap<RootKey, Vec<PageRange>>,
}

impl TraversalCache {
    pub fn new() -> Self {
        TraversalCache {
            entries: IndexMap::new(),
        }
    }

    pub fn get(&self, key: &RootKey) -> Option<&[PageRange]> {
        self.entries.get(key).map(|ranges| ranges.as_slice())
    }

    pub fn insert(&mut self, key: RootKey, ranges: Vec<PageRange>) {
        self.entries.insert(key, ranges);
    }

    /// Cached roots in the order they were saved.
    pub fn list(&self) -> Vec<RootKey> {
        self.entries.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_keeps_insertion_order() {
        let mut cache = TraversalCache::new();
        cache.insert(RootKey::from(Root::full(0x9000)), Vec::new());
        cache.insert(RootKey::from(Root::full(0x1000)), Vec::new());
        let listed: Vec<u64> = cache.list().iter().map(|k| k.address).collect();
        assert_eq!(listed, vec![0x9000, 0x1000]);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_halves_are_distinct_keys() {
        let mut cache = TraversalCache::new();
        let lower = RootKey {
            address: 0x4000,
            half: AddressHalf::Lower,
        };
        let upper = RootKey {
            address: 0x4000,
            half: AddressHalf::Upper,
        };
        cache.insert(lower, Vec::new());
        assert!(cache.get(&lower).is_some());
        assert!(cache.get(&upper).is_none());
        assert_eq!(cache.len(), 1);
    }
}

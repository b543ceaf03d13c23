//! LRU cache of page mappings
//!
//! Rebuilding a mapping costs one spare-area read per page, so hot blocks are
//! kept here. Entries must be dropped whenever their block is programmed or
//! erased.

use super::PageMapping;
use crate::types::PhysicalBlock;
use lru::LruCache;
use std::num::NonZeroUsize;

pub struct PageMapCache {
    cache: Option<LruCache<PhysicalBlock, PageMapping>>,
}

impl PageMapCache {
    /// Create a cache holding `capacity` mappings (0 disables caching)
    pub fn new(capacity: usize) -> Self {
        PageMapCache {
            cache: NonZeroUsize::new(capacity).map(LruCache::new),
        }
    }

    pub fn get(&mut self, block: PhysicalBlock) -> Option<PageMapping> {
        self.cache.as_mut()?.get(&block).cloned()
    }

    pub fn put(&mut self, mapping: PageMapping) {
        if let Some(cache) = self.cache.as_mut() {
            cache.put(mapping.block(), mapping);
        }
    }

    pub fn invalidate(&mut self, block: PhysicalBlock) {
        if let Some(cache) = self.cache.as_mut() {
            cache.pop(&block);
        }
    }

    pub fn clear(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.cache.as_ref().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(block: u32) -> PageMapping {
        let mut map = PageMapping::empty(PhysicalBlock(block), 4);
        map.record(0, 0);
        map
    }

    #[test]
    fn test_cache_basic() {
        let mut cache = PageMapCache::new(4);
        assert!(cache.get(PhysicalBlock(1)).is_none());

        cache.put(mapping(1));
        assert_eq!(cache.get(PhysicalBlock(1)), Some(mapping(1)));

        cache.invalidate(PhysicalBlock(1));
        assert!(cache.get(PhysicalBlock(1)).is_none());
    }

    #[test]
    fn test_cache_lru_eviction() {
        let mut cache = PageMapCache::new(2);
        cache.put(mapping(1));
        cache.put(mapping(2));
        cache.put(mapping(3)); // evicts 1

        assert!(cache.get(PhysicalBlock(1)).is_none());
        assert!(cache.get(PhysicalBlock(2)).is_some());
        assert!(cache.get(PhysicalBlock(3)).is_some());
    }

    #[test]
    fn test_disabled_cache() {
        let mut cache = PageMapCache::new(0);
        cache.put(mapping(1));
        assert!(cache.get(PhysicalBlock(1)).is_none());
        assert!(cache.is_empty());
    }
}

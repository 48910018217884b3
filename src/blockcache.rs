//! Local block-location cache
//!
//! Worker-local cache from (name server, block id) to the DS replica list,
//! consulted before the NS block-info RPC on read paths. Entries are
//! invalidated when a data server reports the block missing or moved.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::debug;

use crate::types::ServerAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BlockKey {
    ns: ServerAddr,
    block_id: u32,
}

struct Inner {
    map: HashMap<BlockKey, Vec<ServerAddr>>,
    // recent-use order, front = most recent
    order: VecDeque<BlockKey>,
}

/// Bounded LRU of block locations
pub struct BlockCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl BlockCache {
    /// `capacity == 0` disables caching entirely.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, ns: ServerAddr, block_id: u32) -> Option<Vec<ServerAddr>> {
        if self.capacity == 0 {
            return None;
        }
        let key = BlockKey { ns, block_id };
        let mut inner = self.inner.lock();
        let ds_list = inner.map.get(&key)?.clone();
        inner.order.retain(|k| *k != key);
        inner.order.push_front(key);
        Some(ds_list)
    }

    pub fn insert(&self, ns: ServerAddr, block_id: u32, ds_list: Vec<ServerAddr>) {
        if self.capacity == 0 || ds_list.is_empty() {
            return;
        }
        let key = BlockKey { ns, block_id };
        let mut inner = self.inner.lock();
        if inner.map.insert(key, ds_list).is_none() {
            inner.order.push_front(key);
            if inner.map.len() > self.capacity {
                if let Some(oldest) = inner.order.pop_back() {
                    inner.map.remove(&oldest);
                }
            }
        } else {
            inner.order.retain(|k| *k != key);
            inner.order.push_front(key);
        }
    }

    /// Drop a stale location after a DS-side failure.
    pub fn invalidate(&self, ns: ServerAddr, block_id: u32) {
        let key = BlockKey { ns, block_id };
        let mut inner = self.inner.lock();
        if inner.map.remove(&key).is_some() {
            inner.order.retain(|k| *k != key);
            debug!(block_id, %ns, "invalidated cached block location");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> ServerAddr {
        ServerAddr::new(Ipv4Addr::new(10, 0, 0, last), 3200)
    }

    #[test]
    fn test_insert_and_get() {
        let cache = BlockCache::new(4);
        cache.insert(addr(1), 42, vec![addr(5), addr(6)]);
        assert_eq!(cache.get(addr(1), 42), Some(vec![addr(5), addr(6)]));
        assert_eq!(cache.get(addr(1), 43), None);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = BlockCache::new(2);
        cache.insert(addr(1), 1, vec![addr(5)]);
        cache.insert(addr(1), 2, vec![addr(5)]);
        cache.get(addr(1), 1); // block 2 is now the oldest
        cache.insert(addr(1), 3, vec![addr(5)]);
        assert!(cache.get(addr(1), 2).is_none());
        assert!(cache.get(addr(1), 1).is_some());
        assert!(cache.get(addr(1), 3).is_some());
    }

    #[test]
    fn test_invalidate() {
        let cache = BlockCache::new(4);
        cache.insert(addr(1), 42, vec![addr(5)]);
        cache.invalidate(addr(1), 42);
        assert!(cache.get(addr(1), 42).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_disabled_cache() {
        let cache = BlockCache::new(0);
        cache.insert(addr(1), 42, vec![addr(5)]);
        assert!(cache.get(addr(1), 42).is_none());
    }

    #[test]
    fn test_ns_scoping() {
        let cache = BlockCache::new(4);
        cache.insert(addr(1), 42, vec![addr(5)]);
        assert!(cache.get(addr(2), 42).is_none());
    }
}

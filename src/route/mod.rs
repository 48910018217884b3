//! Route-info cache
//!
//! Worker-shared cache of per-application-key cluster topology, refreshed by
//! the keepalive cycle and consulted by every operation. Entries live in a
//! pre-sized arena addressed by stable slot indices; an ordered index keyed
//! by (key hash, key bytes) gives O(log n) lookup with byte-wise tie-break
//! on hash collision. All access goes through one cache-wide mutex; the lock
//! is never held across an RPC.

pub mod info;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
pub use info::{
    AccessType, ClusterGroup, ClusterStat, DedupServerInfo, GroupInfo, LogicalCluster,
    OperKind, OperStat, PhysicalCluster, RouteInfo, OPER_COUNT,
};

/// Hash seed every peer uses for application keys.
const APPKEY_HASH_SEED: u32 = 97;

/// MurmurHash2 over `data` with the protocol seed.
pub fn appkey_hash(data: &[u8]) -> u32 {
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h: u32 = APPKEY_HASH_SEED ^ data.len() as u32;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes(chunk.try_into().unwrap_or_default());
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        for (i, &byte) in tail.iter().enumerate() {
            h ^= (byte as u32) << (8 * i);
        }
        h = h.wrapping_mul(M);
    }
    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct CacheKey {
    hash: u32,
    key: Vec<u8>,
}

impl CacheKey {
    fn new(app_key: &str) -> Self {
        Self {
            hash: appkey_hash(app_key.as_bytes()),
            key: app_key.as_bytes().to_vec(),
        }
    }
}

struct Slot {
    key: CacheKey,
    snapshot: Arc<RouteInfo>,
    stats: [OperStat; OPER_COUNT],
}

struct Inner {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: BTreeMap<CacheKey, usize>,
    /// recent-use order, front = most recent; eviction takes the back
    recent: VecDeque<usize>,
    /// fixed keepalive sequence, insertion order
    kp_ring: Vec<usize>,
    kp_cursor: usize,
}

impl Inner {
    fn detach(&mut self, idx: usize) -> Option<Slot> {
        let slot = self.slots[idx].take()?;
        self.index.remove(&slot.key);
        self.recent.retain(|&i| i != idx);
        if let Some(pos) = self.kp_ring.iter().position(|&i| i == idx) {
            self.kp_ring.remove(pos);
            if pos < self.kp_cursor {
                self.kp_cursor -= 1;
            }
            if self.kp_cursor >= self.kp_ring.len() {
                self.kp_cursor = 0;
            }
        }
        self.free.push(idx);
        Some(slot)
    }

    fn touch(&mut self, idx: usize) {
        self.recent.retain(|&i| i != idx);
        self.recent.push_front(idx);
    }

    /// Drop the least-recently-used entry. Returns the evicted app key.
    fn expire_one(&mut self) -> Option<String> {
        let idx = *self.recent.back()?;
        let slot = self.detach(idx)?;
        Some(slot.snapshot.app_key.clone())
    }
}

/// Data a keepalive tick needs to build its request; snapshotted under the
/// lock, consumed without it.
#[derive(Debug, Clone)]
pub struct KeepaliveTick {
    pub app_key: String,
    pub app_id: u64,
    pub session_id: String,
    pub modify_time: u64,
    pub rc_servers: Vec<crate::types::ServerAddr>,
    pub stats: [OperStat; OPER_COUNT],
}

/// Outcome of applying one keepalive response
#[derive(Debug, PartialEq, Eq)]
pub enum KeepaliveOutcome {
    /// Server reported no topology change
    Unchanged,
    /// Entry rebuilt from the response
    Refreshed,
    /// The RC session is gone server-side; the entry has been deleted
    Deleted,
}

/// Shared route-info cache, one per worker group
pub struct RouteCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl RouteCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: Vec::with_capacity(capacity),
                free: Vec::new(),
                index: BTreeMap::new(),
                recent: VecDeque::new(),
                kp_ring: Vec::new(),
                kp_cursor: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the cached entry for `app_key`, refreshing its recent-use
    /// position.
    pub fn lookup(&self, app_key: &str) -> Option<Arc<RouteInfo>> {
        let key = CacheKey::new(app_key);
        let mut inner = self.inner.lock();
        let idx = *inner.index.get(&key)?;
        inner.touch(idx);
        inner.slots[idx].as_ref().map(|s| Arc::clone(&s.snapshot))
    }

    /// Insert a freshly logged-in entry.
    ///
    /// An existing entry for the same key is replaced in place (its own slot
    /// is never an eviction candidate for this insert). On a full cache the
    /// least-recently-used entry is expired and the insert retried once; a
    /// second failure is [`Error::CacheExhausted`].
    pub fn insert(&self, info: RouteInfo) -> Result<Arc<RouteInfo>> {
        let key = CacheKey::new(&info.app_key);
        let mut inner = self.inner.lock();

        if let Some(&idx) = inner.index.get(&key) {
            let snapshot = Arc::new(info);
            if let Some(slot) = inner.slots[idx].as_mut() {
                slot.snapshot = Arc::clone(&snapshot);
            }
            inner.touch(idx);
            return Ok(snapshot);
        }

        if inner.index.len() >= self.capacity {
            match inner.expire_one() {
                Some(evicted) => {
                    debug!(app_key = %evicted, "route cache full, expired oldest entry")
                }
                None => {
                    return Err(Error::CacheExhausted {
                        app_key: info.app_key,
                    })
                }
            }
            if inner.index.len() >= self.capacity {
                return Err(Error::CacheExhausted {
                    app_key: info.app_key,
                });
            }
        }

        let idx = match inner.free.pop() {
            Some(idx) => idx,
            None => {
                inner.slots.push(None);
                inner.slots.len() - 1
            }
        };
        let snapshot = Arc::new(info);
        inner.slots[idx] = Some(Slot {
            key: key.clone(),
            snapshot: Arc::clone(&snapshot),
            stats: [OperStat::default(); OPER_COUNT],
        });
        inner.index.insert(key, idx);
        inner.recent.push_front(idx);
        inner.kp_ring.push(idx);
        Ok(snapshot)
    }

    /// Remove `app_key` from the lookup structure and the keepalive ring.
    pub fn remove(&self, app_key: &str) -> bool {
        let key = CacheKey::new(app_key);
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.index.get(&key) else {
            return false;
        };
        inner.detach(idx).is_some()
    }

    /// Account one finished operation against its entry.
    pub fn record_stat(
        &self,
        app_key: &str,
        kind: OperKind,
        bytes: u64,
        rt_ms: u64,
        success: bool,
    ) {
        let key = CacheKey::new(app_key);
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.index.get(&key) else {
            return;
        };
        if let Some(slot) = inner.slots[idx].as_mut() {
            slot.stats[kind as usize].record(bytes, rt_ms, success);
        }
    }

    /// Select the next keepalive target by advancing the ring cursor, and
    /// hand back everything the request builder needs. The entry's counters
    /// are zeroed as part of the snapshot.
    pub fn keepalive_next(&self) -> Option<KeepaliveTick> {
        let mut inner = self.inner.lock();
        if inner.kp_ring.is_empty() {
            return None;
        }
        let cursor = inner.kp_cursor % inner.kp_ring.len();
        inner.kp_cursor = (cursor + 1) % inner.kp_ring.len();
        let idx = inner.kp_ring[cursor];
        let slot = inner.slots[idx].as_mut()?;
        let stats = std::mem::take(&mut slot.stats);
        let info = &slot.snapshot;
        Some(KeepaliveTick {
            app_key: info.app_key.clone(),
            app_id: info.app_id,
            session_id: info.session_id.clone(),
            modify_time: info.modify_time,
            rc_servers: info.rc_servers.clone(),
            stats,
        })
    }

    /// Record NS-provided group topology on the cached entry. Snapshots are
    /// immutable, so the entry is re-published with the update applied.
    pub fn set_group_info(
        &self,
        app_key: &str,
        ns_vip: crate::types::ServerAddr,
        group_count: i32,
        group_seq: i32,
    ) {
        let key = CacheKey::new(app_key);
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.index.get(&key) else {
            return;
        };
        if let Some(slot) = inner.slots[idx].as_mut() {
            let mut info = (*slot.snapshot).clone();
            info.set_group_info(ns_vip, group_count, group_seq);
            slot.snapshot = Arc::new(info);
        }
    }

    /// Swap in a rebuilt entry after a keepalive refresh. The previous
    /// topology is dropped wholesale; operations holding the old snapshot
    /// keep it alive until they finish.
    pub fn apply_refresh(&self, app_key: &str, mut info: RouteInfo) -> KeepaliveOutcome {
        let key = CacheKey::new(app_key);
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.index.get(&key) else {
            return KeepaliveOutcome::Deleted;
        };
        if let Some(slot) = inner.slots[idx].as_mut() {
            info.version = slot.snapshot.version + 1;
            slot.snapshot = Arc::new(info);
        }
        inner.touch(idx);
        KeepaliveOutcome::Refreshed
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn info(app_key: &str) -> RouteInfo {
        RouteInfo {
            app_key: app_key.to_string(),
            app_id: 1,
            session_id: format!("1-{app_key}"),
            rc_servers: Vec::new(),
            logical_clusters: Vec::new(),
            need_dedup: false,
            report_interval: 10,
            modify_time: 100,
            version: 0,
            meta_root_server: None,
            unlink_cluster_groups: Vec::new(),
        }
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(appkey_hash(b"tfs"), appkey_hash(b"tfs"));
        assert_ne!(appkey_hash(b"tfs"), appkey_hash(b"tfs2"));
    }

    #[test]
    fn test_lookup_miss_and_hit() {
        let cache = RouteCache::new(4);
        assert!(cache.lookup("app-a").is_none());
        cache.insert(info("app-a")).unwrap();
        assert_eq!(cache.lookup("app-a").unwrap().app_key, "app-a");
    }

    #[test]
    fn test_insert_full_evicts_exactly_one_oldest() {
        let cache = RouteCache::new(2);
        cache.insert(info("app-a")).unwrap();
        cache.insert(info("app-b")).unwrap();
        // touch a so b becomes the eviction candidate
        cache.lookup("app-a");
        cache.insert(info("app-c")).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup("app-b").is_none());
        assert!(cache.lookup("app-a").is_some());
        assert!(cache.lookup("app-c").is_some());
    }

    #[test]
    fn test_insert_existing_key_updates_in_place() {
        let cache = RouteCache::new(1);
        cache.insert(info("app-a")).unwrap();
        let mut updated = info("app-a");
        updated.modify_time = 200;
        // full cache, same key: must not evict its own target
        cache.insert(updated).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup("app-a").unwrap().modify_time, 200);
    }

    #[test]
    fn test_cache_exhausted_at_zero_capacity_is_impossible() {
        // capacity is clamped to at least one entry
        let cache = RouteCache::new(0);
        assert_matches!(cache.insert(info("app-a")), Ok(_));
    }

    #[test]
    fn test_remove_clears_index_and_ring() {
        let cache = RouteCache::new(4);
        cache.insert(info("app-a")).unwrap();
        cache.insert(info("app-b")).unwrap();
        assert!(cache.remove("app-a"));
        assert!(cache.lookup("app-a").is_none());

        // only app-b remains in the keepalive ring
        let tick = cache.keepalive_next().unwrap();
        assert_eq!(tick.app_key, "app-b");
        let tick = cache.keepalive_next().unwrap();
        assert_eq!(tick.app_key, "app-b");
    }

    #[test]
    fn test_keepalive_round_robin() {
        let cache = RouteCache::new(4);
        cache.insert(info("app-a")).unwrap();
        cache.insert(info("app-b")).unwrap();
        let first = cache.keepalive_next().unwrap();
        let second = cache.keepalive_next().unwrap();
        let third = cache.keepalive_next().unwrap();
        assert_eq!(first.app_key, "app-a");
        assert_eq!(second.app_key, "app-b");
        assert_eq!(third.app_key, "app-a");
    }

    #[test]
    fn test_keepalive_snapshots_and_resets_counters() {
        let cache = RouteCache::new(4);
        cache.insert(info("app-a")).unwrap();
        cache.record_stat("app-a", OperKind::Read, 4096, 3, true);

        let tick = cache.keepalive_next().unwrap();
        assert_eq!(tick.stats[OperKind::Read as usize].times, 1);
        assert_eq!(tick.stats[OperKind::Read as usize].bytes, 4096);

        let tick = cache.keepalive_next().unwrap();
        assert!(tick.stats[OperKind::Read as usize].is_empty());
    }

    #[test]
    fn test_apply_refresh_bumps_version() {
        let cache = RouteCache::new(4);
        cache.insert(info("app-a")).unwrap();
        let mut fresh = info("app-a");
        fresh.modify_time = 999;
        assert_eq!(
            cache.apply_refresh("app-a", fresh),
            KeepaliveOutcome::Refreshed
        );
        let entry = cache.lookup("app-a").unwrap();
        assert_eq!(entry.modify_time, 999);
        assert_eq!(entry.version, 1);
    }

    #[test]
    fn test_refresh_keeps_old_snapshot_alive() {
        let cache = RouteCache::new(4);
        cache.insert(info("app-a")).unwrap();
        let old = cache.lookup("app-a").unwrap();
        let mut fresh = info("app-a");
        fresh.modify_time = 999;
        cache.apply_refresh("app-a", fresh);
        // in-flight holder still sees the topology it resolved
        assert_eq!(old.modify_time, 100);
    }

    #[test]
    fn test_dead_session_removal_matches_lookup() {
        let cache = RouteCache::new(4);
        cache.insert(info("app-a")).unwrap();
        assert!(cache.remove("app-a"));
        assert!(cache.lookup("app-a").is_none());
        assert!(cache.keepalive_next().is_none());
    }
}

//! Size-bounded, versioned cache map with lazy expiry.
//!
//! Entries are never evicted when the cache is invalidated; they are
//! dropped lazily the next time a read observes them as expired, or when an
//! insert pushes the map over its byte budget. This keeps invalidation
//! proportional to the number of listeners, not the size of the cache.

use std::collections::HashMap;

/// Weight and staleness surface the map needs from its values.
pub trait CacheWeight {
    /// Entry weight in bytes (approximate).
    fn weight(&self) -> usize;
    /// Millisecond timestamp after which the entry is stale.
    fn stale_at(&self) -> u64;
    /// Cache version the entry was created under.
    fn version(&self) -> u64;
}

/// Pure staleness predicate shared by the read and upsert paths.
pub fn is_value_expired<V: CacheWeight>(now: u64, current_version: u64, value: &V) -> bool {
    value.version() < current_version || value.stale_at() <= now
}

/// Which logical sub-map a key addresses.
///
/// A revalidation in progress lives in its own slot so it never clobbers a
/// currently-valid canonical entry until explicitly promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlot {
    Canonical,
    Revalidating,
}

#[derive(Debug, Default)]
struct SlotPair {
    canonical: Option<usize>,
    revalidating: Option<usize>,
}

impl SlotPair {
    fn get(&self, slot: KeySlot) -> Option<usize> {
        match slot {
            KeySlot::Canonical => self.canonical,
            KeySlot::Revalidating => self.revalidating,
        }
    }

    fn set(&mut self, slot: KeySlot, idx: Option<usize>) {
        match slot {
            KeySlot::Canonical => self.canonical = idx,
            KeySlot::Revalidating => self.revalidating = idx,
        }
    }

    fn is_empty(&self) -> bool {
        self.canonical.is_none() && self.revalidating.is_none()
    }
}

#[derive(Debug)]
struct Node<V> {
    key: String,
    slot: KeySlot,
    value: V,
    size: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

/// A size-bounded key/value store with LRU eviction and lazy expiry.
#[derive(Debug)]
pub struct CacheMap<V> {
    index: HashMap<String, SlotPair>,
    nodes: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used.
    tail: Option<usize>,
    total_size: usize,
    max_size: usize,
}

/// Create a cache map with the given byte budget.
pub fn create_cache_map<V: CacheWeight + Clone>(max_size: usize) -> CacheMap<V> {
    CacheMap {
        index: HashMap::new(),
        nodes: Vec::new(),
        free: Vec::new(),
        head: None,
        tail: None,
        total_size: 0,
        max_size,
    }
}

impl<V: CacheWeight + Clone> CacheMap<V> {
    /// Number of live entries across both sub-maps.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Whether the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current total weight of all entries.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Read an entry, evicting it if it has expired relative to `now` and
    /// `current_version`. A hit refreshes the entry's recency.
    pub fn get(&mut self, now: u64, current_version: u64, key: &str, slot: KeySlot) -> Option<V> {
        let idx = self.index.get(key)?.get(slot)?;
        let expired = {
            let node = self.nodes[idx].as_ref().unwrap();
            is_value_expired(now, current_version, &node.value)
        };
        if expired {
            self.remove(idx);
            return None;
        }
        self.detach(idx);
        self.push_front(idx);
        Some(self.nodes[idx].as_ref().unwrap().value.clone())
    }

    /// Read an entry without touching recency or expiry.
    pub fn peek(&self, key: &str, slot: KeySlot) -> Option<&V> {
        let idx = self.index.get(key)?.get(slot)?;
        Some(&self.nodes[idx].as_ref().unwrap().value)
    }

    /// Insert or replace an entry, evicting least-recently-used entries if
    /// the byte budget is exceeded. The entry just written is never evicted
    /// by its own insert.
    pub fn set(&mut self, key: &str, slot: KeySlot, value: V) {
        let size = value.weight();
        if let Some(idx) = self.index.get(key).and_then(|pair| pair.get(slot)) {
            let node = self.nodes[idx].as_mut().unwrap();
            self.total_size = self.total_size - node.size + size;
            node.value = value;
            node.size = size;
            self.detach(idx);
            self.push_front(idx);
            self.evict_over_budget(idx);
            return;
        }
        let idx = self.allocate(Node {
            key: key.to_string(),
            slot,
            value,
            size,
            prev: None,
            next: None,
        });
        self.index.entry(key.to_string()).or_default().set(slot, Some(idx));
        self.total_size += size;
        self.push_front(idx);
        self.evict_over_budget(idx);
    }

    /// Re-attribute an entry's weight once its real size is known (payload
    /// sizes only settle after streaming completes). Does not touch recency.
    pub fn set_size(&mut self, key: &str, slot: KeySlot, size: usize) {
        let Some(idx) = self.index.get(key).and_then(|pair| pair.get(slot)) else {
            return;
        };
        let node = self.nodes[idx].as_mut().unwrap();
        self.total_size = self.total_size - node.size + size;
        node.size = size;
        self.evict_over_budget(idx);
    }

    /// Remove an entry. Does not affect version counters.
    pub fn delete(&mut self, key: &str, slot: KeySlot) -> Option<V> {
        let idx = self.index.get(key)?.get(slot)?;
        Some(self.remove(idx))
    }

    fn allocate(&mut self, node: Node<V>) -> usize {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn remove(&mut self, idx: usize) -> V {
        self.detach(idx);
        let node = self.nodes[idx].take().unwrap();
        self.free.push(idx);
        self.total_size -= node.size;
        if let Some(pair) = self.index.get_mut(&node.key) {
            pair.set(node.slot, None);
            if pair.is_empty() {
                self.index.remove(&node.key);
            }
        }
        node.value
    }

    fn evict_over_budget(&mut self, keep: usize) {
        let mut cursor = self.tail;
        while self.total_size > self.max_size {
            let Some(idx) = cursor else { break };
            cursor = self.nodes[idx].as_ref().unwrap().prev;
            if idx == keep {
                continue;
            }
            tracing::debug!(key = %self.nodes[idx].as_ref().unwrap().key, "evicting over-budget cache entry");
            self.remove(idx);
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.nodes[idx].as_ref().unwrap();
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.nodes[p].as_mut().unwrap().next = next,
            None if self.head == Some(idx) => self.head = next,
            None => {}
        }
        match next {
            Some(n) => self.nodes[n].as_mut().unwrap().prev = prev,
            None if self.tail == Some(idx) => self.tail = prev,
            None => {}
        }
        let node = self.nodes[idx].as_mut().unwrap();
        node.prev = None;
        node.next = None;
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.nodes[idx].as_mut().unwrap();
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.nodes[h].as_mut().unwrap().prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Val {
        id: u32,
        size: usize,
        stale_at: u64,
        version: u64,
    }

    impl CacheWeight for Val {
        fn weight(&self) -> usize {
            self.size
        }
        fn stale_at(&self) -> u64 {
            self.stale_at
        }
        fn version(&self) -> u64 {
            self.version
        }
    }

    fn val(id: u32, size: usize, stale_at: u64, version: u64) -> Val {
        Val {
            id,
            size,
            stale_at,
            version,
        }
    }

    #[test]
    fn test_get_miss_returns_none() {
        let mut map = create_cache_map::<Val>(100);
        assert!(map.get(0, 0, "a", KeySlot::Canonical).is_none());
    }

    #[test]
    fn test_set_then_get() {
        let mut map = create_cache_map(100);
        map.set("a", KeySlot::Canonical, val(1, 10, 100, 0));
        let got = map.get(0, 0, "a", KeySlot::Canonical).unwrap();
        assert_eq!(got.id, 1);
    }

    #[test]
    fn test_lazy_expiry_on_stale_time() {
        let mut map = create_cache_map(100);
        map.set("a", KeySlot::Canonical, val(1, 10, 50, 0));
        assert!(map.get(50, 0, "a", KeySlot::Canonical).is_none());
        // Idempotent: a second read of the same expired key is a plain miss.
        assert!(map.get(50, 0, "a", KeySlot::Canonical).is_none());
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn test_lazy_expiry_on_version_bump() {
        let mut map = create_cache_map(100);
        map.set("a", KeySlot::Canonical, val(1, 10, u64::MAX, 3));
        assert!(map.get(0, 3, "a", KeySlot::Canonical).is_some());
        assert!(map.get(0, 4, "a", KeySlot::Canonical).is_none());
    }

    #[test]
    fn test_revalidation_slot_is_independent() {
        let mut map = create_cache_map(100);
        map.set("a", KeySlot::Canonical, val(1, 10, u64::MAX, 0));
        map.set("a", KeySlot::Revalidating, val(2, 10, u64::MAX, 0));
        assert_eq!(map.get(0, 0, "a", KeySlot::Canonical).unwrap().id, 1);
        assert_eq!(map.get(0, 0, "a", KeySlot::Revalidating).unwrap().id, 2);
        map.delete("a", KeySlot::Revalidating);
        assert_eq!(map.get(0, 0, "a", KeySlot::Canonical).unwrap().id, 1);
    }

    #[test]
    fn test_lru_eviction_over_budget() {
        let mut map = create_cache_map(30);
        map.set("a", KeySlot::Canonical, val(1, 10, u64::MAX, 0));
        map.set("b", KeySlot::Canonical, val(2, 10, u64::MAX, 0));
        map.set("c", KeySlot::Canonical, val(3, 10, u64::MAX, 0));
        // Touch "a" so "b" is the least recently used.
        map.get(0, 0, "a", KeySlot::Canonical);
        map.set("d", KeySlot::Canonical, val(4, 10, u64::MAX, 0));
        assert!(map.get(0, 0, "b", KeySlot::Canonical).is_none());
        assert!(map.get(0, 0, "a", KeySlot::Canonical).is_some());
        assert!(map.get(0, 0, "d", KeySlot::Canonical).is_some());
    }

    #[test]
    fn test_set_size_reattribution_can_evict() {
        let mut map = create_cache_map(30);
        map.set("a", KeySlot::Canonical, val(1, 10, u64::MAX, 0));
        map.set("b", KeySlot::Canonical, val(2, 10, u64::MAX, 0));
        map.set_size("b", KeySlot::Canonical, 25);
        assert_eq!(map.total_size(), 25);
        assert!(map.get(0, 0, "a", KeySlot::Canonical).is_none());
        assert!(map.get(0, 0, "b", KeySlot::Canonical).is_some());
    }

    #[test]
    fn test_just_inserted_entry_survives_its_own_insert() {
        let mut map = create_cache_map(10);
        map.set("big", KeySlot::Canonical, val(1, 50, u64::MAX, 0));
        assert!(map.get(0, 0, "big", KeySlot::Canonical).is_some());
    }

    #[test]
    fn test_delete_removes_weight() {
        let mut map = create_cache_map(100);
        map.set("a", KeySlot::Canonical, val(1, 10, u64::MAX, 0));
        assert_eq!(map.total_size(), 10);
        assert!(map.delete("a", KeySlot::Canonical).is_some());
        assert_eq!(map.total_size(), 0);
        assert!(map.delete("a", KeySlot::Canonical).is_none());
    }
}

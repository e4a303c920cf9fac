//! Bounded map with recency tracking.
//!
//! Backs both the address cache's per-endpoint LRU and the endpoint pool's
//! idle eviction. Every access stamps the entry with a monotonically
//! increasing sequence number and the time of the access, so the least
//! recently used entry and the idle entries are both found by walking the
//! stamp order from the oldest end.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

struct Slot<V> {
    value: V,
    stamp: u64,
    touched_at: Instant,
}

/// Map keeping entries in recency order, optionally capacity-bounded.
pub struct RecencyMap<K, V> {
    entries: HashMap<K, Slot<V>>,
    /// stamp → key, oldest first.
    order: BTreeMap<u64, K>,
    next_stamp: u64,
    capacity: Option<usize>,
}

impl<K: Eq + Hash + Clone, V> RecencyMap<K, V> {
    /// Create a map holding at most `capacity` entries (at least one).
    pub fn bounded(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_stamp: 0,
            capacity: Some(capacity.max(1)),
        }
    }

    /// Create a map without a capacity bound.
    pub fn unbounded() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_stamp: 0,
            capacity: None,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Capacity bound, if any.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn stamp(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        stamp
    }

    /// Look up `key` and mark it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if !self.touch(key) {
            return None;
        }
        self.entries.get(key).map(|slot| &slot.value)
    }

    /// Look up `key` without affecting recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    /// Whether `key` is present. Does not affect recency.
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Mark `key` most recently used. Returns false when absent.
    pub fn touch(&mut self, key: &K) -> bool {
        let stamp = self.stamp();
        let Some(slot) = self.entries.get_mut(key) else {
            return false;
        };
        self.order.remove(&slot.stamp);
        slot.stamp = stamp;
        slot.touched_at = Instant::now();
        self.order.insert(stamp, key.clone());
        true
    }

    /// Insert or replace `key`, marking it most recently used.
    ///
    /// When the insertion grows the map past its capacity, the least
    /// recently used entry is removed and returned.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        let stamp = self.stamp();
        let slot = Slot {
            value,
            stamp,
            touched_at: Instant::now(),
        };
        if let Some(previous) = self.entries.insert(key.clone(), slot) {
            self.order.remove(&previous.stamp);
        }
        self.order.insert(stamp, key);

        match self.capacity {
            Some(capacity) if self.entries.len() > capacity => self.pop_least_recent(),
            _ => None,
        }
    }

    /// Remove `key`.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.stamp);
        Some(slot.value)
    }

    /// The least recently used key.
    pub fn least_recent(&self) -> Option<&K> {
        self.order.values().next()
    }

    /// Remove and return the least recently used entry.
    pub fn pop_least_recent(&mut self) -> Option<(K, V)> {
        let (_, key) = self.order.pop_first()?;
        let slot = self.entries.remove(&key)?;
        Some((key, slot.value))
    }

    /// Remove every entry not touched within `idle` of `now`, oldest first.
    pub fn drain_idle(&mut self, now: Instant, idle: Duration) -> Vec<(K, V)> {
        let mut drained = Vec::new();
        while let Some(key) = self.order.values().next().cloned() {
            let expired = self
                .entries
                .get(&key)
                .is_some_and(|slot| now.saturating_duration_since(slot.touched_at) >= idle);
            if !expired {
                break;
            }
            if let Some(value) = self.remove(&key) {
                drained.push((key, value));
            }
        }
        drained
    }

    /// Remove every entry, oldest first.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        let mut drained = Vec::with_capacity(self.entries.len());
        while let Some(entry) = self.pop_least_recent() {
            drained.push(entry);
        }
        drained
    }

    /// Keys from least to most recently used.
    pub fn keys_by_recency(&self) -> Vec<K> {
        self.order.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_least_recently_used() {
        let mut map = RecencyMap::bounded(2);
        assert!(map.insert("a", 1).is_none());
        assert!(map.insert("b", 2).is_none());

        // "a" becomes most recent, so "b" is the eviction victim
        assert_eq!(map.get(&"a"), Some(&1));
        assert_eq!(map.insert("c", 3), Some(("b", 2)));

        assert_eq!(map.len(), 2);
        assert_eq!(map.keys_by_recency(), vec!["a", "c"]);
    }

    #[test]
    fn test_capacity_never_exceeded() {
        for capacity in 1..=6 {
            let mut map = RecencyMap::bounded(capacity);
            for i in 0..20 {
                let evicted = map.insert(i, i);
                assert!(map.len() <= capacity);
                if i >= capacity {
                    // with no reads in between, insertion order is recency order
                    assert_eq!(evicted, Some((i - capacity, i - capacity)));
                }
            }
        }
    }

    #[test]
    fn test_replace_does_not_evict() {
        let mut map = RecencyMap::bounded(2);
        map.insert("a", 1);
        map.insert("b", 2);
        assert!(map.insert("a", 10).is_none());
        assert_eq!(map.peek(&"a"), Some(&10));
        assert_eq!(map.least_recent(), Some(&"b"));
    }

    #[test]
    fn test_peek_does_not_touch() {
        let mut map = RecencyMap::bounded(2);
        map.insert("a", 1);
        map.insert("b", 2);
        assert_eq!(map.peek(&"a"), Some(&1));
        assert_eq!(map.insert("c", 3), Some(("a", 1)));
    }

    #[test]
    fn test_remove() {
        let mut map = RecencyMap::unbounded();
        map.insert("a", 1);
        assert_eq!(map.remove(&"a"), Some(1));
        assert_eq!(map.remove(&"a"), None);
        assert!(map.is_empty());
        assert!(!map.touch(&"a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_idle() {
        let mut map = RecencyMap::unbounded();
        map.insert("a", 1);
        map.insert("b", 2);

        tokio::time::advance(Duration::from_secs(10)).await;
        map.touch(&"b");
        map.insert("c", 3);

        tokio::time::advance(Duration::from_secs(10)).await;
        let drained = map.drain_idle(Instant::now(), Duration::from_secs(15));
        assert_eq!(drained, vec![("a", 1)]);
        assert_eq!(map.keys_by_recency(), vec!["b", "c"]);

        tokio::time::advance(Duration::from_secs(10)).await;
        let drained = map.drain_idle(Instant::now(), Duration::from_secs(15));
        assert_eq!(drained, vec![("b", 2), ("c", 3)]);
        assert!(map.is_empty());
    }
}

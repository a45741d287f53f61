//! Insertion-ordered map with sliding-TTL eviction.
//!
//! Backs both the cursor map and the pending-reply cache. Accesses refresh
//! an entry's deadline and move it to the back of the order, so the front of
//! the map is always the next entry to expire and eviction is a pop loop,
//! not a scan.

use std::hash::Hash;
use std::time::{Duration, Instant};

use hashlink::linked_hash_map::RawEntryMut;
use hashlink::LinkedHashMap;

struct TtlEntry<V> {
    value: V,
    last_access: Instant,
}

/// A TTL cache over [`LinkedHashMap`]. All methods take `now` explicitly;
/// production callers pass `Instant::now()`.
pub struct TtlMap<K: Eq + Hash, V> {
    ttl: Duration,
    inner: LinkedHashMap<K, TtlEntry<V>>,
}

impl<K: Eq + Hash, V> TtlMap<K, V> {
    pub fn new(ttl: Duration) -> Self {
        TtlMap {
            ttl,
            inner: LinkedHashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Inserts or replaces, refreshing the entry's deadline.
    pub fn insert(&mut self, key: K, value: V, now: Instant) {
        self.inner.remove(&key);
        self.inner.insert(
            key,
            TtlEntry {
                value,
                last_access: now,
            },
        );
    }

    /// Looks up `key`, refreshing its deadline on a hit. Expired entries are
    /// treated as absent (and dropped on the spot).
    pub fn get(&mut self, key: &K, now: Instant) -> Option<&V> {
        self.get_mut(key, now).map(|value| &*value)
    }

    /// Mutable lookup with the same refresh semantics as [`TtlMap::get`].
    pub fn get_mut(&mut self, key: &K, now: Instant) -> Option<&mut V> {
        match self.inner.raw_entry_mut().from_key(key) {
            RawEntryMut::Occupied(mut occupied) => {
                if now.duration_since(occupied.get().last_access) >= self.ttl {
                    occupied.remove();
                    None
                } else {
                    occupied.to_back();
                    let entry = occupied.into_mut();
                    entry.last_access = now;
                    Some(&mut entry.value)
                }
            }
            RawEntryMut::Vacant(_) => None,
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.remove(key).map(|entry| entry.value)
    }

    /// Pops every entry whose TTL has elapsed, in expiry order.
    pub fn evict_expired(&mut self, now: Instant) -> Vec<(K, V)> {
        let mut evicted = vec![];
        while let Some((_, entry)) = self.inner.front() {
            if now.duration_since(entry.last_access) < self.ttl {
                break;
            }
            let (key, entry) = self.inner.pop_front().expect("front just observed");
            evicted.push((key, entry.value));
        }
        evicted
    }
}

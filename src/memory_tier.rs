//! Bounded in-memory tier of the layered cache.
//!
//! Recency is tracked by an [`LruCache`] used in unbounded mode; both budgets (entry count and
//! admission cost) are enforced here by popping least-recently-used entries until the incoming
//! entry fits.

use lru::LruCache;
use std::hash::Hash;

use crate::entry::CacheEntry;

struct Slot<V> {
    entry: CacheEntry<V>,
    cost: usize,
}

/// Result of a memory tier lookup.
pub(crate) enum Lookup<V> {
    Hit(CacheEntry<V>),
    /// An entry existed but had expired; it has been removed.
    Expired,
    Miss,
}

/// Result of admitting an entry.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    Admitted { evicted: usize },
    /// The entry alone exceeds the budgets and was not stored.
    Rejected,
}

pub(crate) struct MemoryTier<K, V>
where
    K: Hash + Eq,
{
    entries: LruCache<K, Slot<V>>,
    total_cost: usize,
    max_entries: usize,
    max_cost: usize,
    /// Bumped on every logical write (set, remove, clear) so readers can detect that the cache
    /// changed while they were waiting on the persistent tier.
    generation: u64,
}

impl<K, V> MemoryTier<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub(crate) fn new(max_entries: usize, max_cost: usize) -> Self {
        MemoryTier {
            entries: LruCache::unbounded(),
            total_cost: 0,
            max_entries,
            max_cost,
            generation: 0,
        }
    }

    /// Look up a key, marking it most recently used on a hit.
    pub(crate) fn get(&mut self, key: &K, now_ms: i64) -> Lookup<V> {
        let expired = match self.entries.peek(key) {
            None => return Lookup::Miss,
            Some(slot) => slot.entry.is_expired(now_ms),
        };
        if expired {
            self.remove(key);
            return Lookup::Expired;
        }

        match self.entries.get(key) {
            Some(slot) => Lookup::Hit(slot.entry.clone()),
            None => Lookup::Miss,
        }
    }

    /// Insert or replace an entry, evicting least-recently-used entries until it fits.
    pub(crate) fn insert(&mut self, key: K, entry: CacheEntry<V>, cost: usize) -> Admission {
        self.remove(&key);

        if self.max_entries == 0 || cost > self.max_cost {
            return Admission::Rejected;
        }

        let mut evicted = 0;
        while self.entries.len() >= self.max_entries || self.total_cost + cost > self.max_cost {
            match self.entries.pop_lru() {
                Some((_, slot)) => {
                    self.total_cost -= slot.cost;
                    evicted += 1;
                }
                None => break,
            }
        }

        self.total_cost += cost;
        self.entries.put(key, Slot { entry, cost });
        Admission::Admitted { evicted }
    }

    /// Insert only if the key is absent. Used for read-through promotion.
    pub(crate) fn insert_if_absent(
        &mut self,
        key: K,
        entry: CacheEntry<V>,
        cost: usize,
    ) -> Option<Admission> {
        if self.entries.contains(&key) {
            return None;
        }
        Some(self.insert(key, entry, cost))
    }

    pub(crate) fn remove(&mut self, key: &K) -> bool {
        match self.entries.pop(key) {
            Some(slot) => {
                self.total_cost -= slot.cost;
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.total_cost = 0;
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn advance_generation(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn total_cost(&self) -> usize {
        self.total_cost
    }

    /// Keys from most to least recently used.
    #[cfg(test)]
    pub(crate) fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }
}

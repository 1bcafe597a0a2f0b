use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::entry::{CacheEntry, StoredBytes};
use crate::memory_tier::{Admission, Lookup, MemoryTier};
use crate::observability::{EventSink, FetchEvent, NoopSink};
use crate::persistence::PersistenceLane;
use crate::store::PersistentStore;
use crate::utils::{hashed_key, now_ms};

/// Admission cost charged for values whose serialized size cannot be computed.
pub const NOMINAL_COST: usize = 1024;

/// Budgets of the in-memory tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayeredCacheConfig {
    /// Maximum number of entries held in memory.
    pub max_entries: usize,
    /// Maximum summed admission cost (serialized bytes) held in memory.
    pub max_cost: usize,
}

impl Default for LayeredCacheConfig {
    fn default() -> Self {
        LayeredCacheConfig {
            max_entries: 100,
            max_cost: 50 * 1024 * 1024,
        }
    }
}

/// How [`LayeredCache::fetch`] combines the cache with a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Return the cached value if present, otherwise produce, store and return.
    CacheFirst,
    /// Always produce; fall back to the cached value when the producer fails.
    NetworkFirst,
    /// Return the cached value and refresh it in the background; cache-first on a miss.
    CacheThenRefresh,
    /// Cache-first, but only entries written with an expiration count as hits, and fresh
    /// values are stored with the given ttl.
    Timed(Duration),
    /// Always produce. The cache is neither read nor written.
    NoCache,
}

/// System low-memory signal, delivered over a [`broadcast`] channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPressure;

struct Inner<K, V>
where
    K: Hash + Eq,
{
    namespace: String,
    memory: Mutex<MemoryTier<K, V>>,
    lane: Option<PersistenceLane>,
    sink: Arc<dyn EventSink>,
}

impl<K, V> Inner<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn purge_memory(&self) {
        let mut memory = self.memory.lock();
        let dropped = memory.len();
        memory.clear();
        tracing::info!(
            "Purged {} entries from memory tier of '{}'",
            dropped,
            self.namespace
        );
    }
}

/// Generic two-tier cache: a bounded LRU memory tier in front of an optional persistent store.
///
/// The memory tier holds native values; only the persistent tier sees serialized bytes. Store
/// failures never reach callers, they degrade to misses.
///
/// Cloning is cheap and every clone shares the same tiers.
pub struct LayeredCache<K, V>
where
    K: Hash + Eq,
{
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for LayeredCache<K, V>
where
    K: Hash + Eq,
{
    fn clone(&self) -> Self {
        LayeredCache {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> LayeredCache<K, V>
where
    K: Serialize + Hash + Eq + Clone + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Create a memory-only cache.
    pub fn new(namespace: impl Into<String>, config: LayeredCacheConfig) -> Self {
        Self::with_parts(namespace, config, None, Arc::new(NoopSink))
    }

    /// Create a cache, optionally backed by a persistent store.
    ///
    /// With a store this spawns the background I/O lane and must be called from within a tokio
    /// runtime.
    pub fn with_parts(
        namespace: impl Into<String>,
        config: LayeredCacheConfig,
        store: Option<Arc<dyn PersistentStore>>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let namespace = namespace.into();
        let lane = store.map(|store| PersistenceLane::spawn(store, &namespace, Arc::clone(&sink)));
        LayeredCache {
            inner: Arc::new(Inner {
                namespace,
                memory: Mutex::new(MemoryTier::new(config.max_entries, config.max_cost)),
                lane,
                sink,
            }),
        }
    }

    /// Namespace under which entries are persisted.
    pub fn name(&self) -> &str {
        &self.inner.namespace
    }

    pub fn is_persistent(&self) -> bool {
        self.inner.lane.is_some()
    }

    fn disk_key(key: &K) -> Option<String> {
        match serde_json::to_vec(key) {
            Ok(raw) => Some(hashed_key(&raw)),
            Err(e) => {
                tracing::warn!("Cache key is not serializable, skipping persistence: {}", e);
                None
            }
        }
    }

    /// Store a value, expiring `ttl` from now (never when `None`).
    ///
    /// Returns without waiting for the persistent tier.
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>) {
        let entry = CacheEntry::new(value, now_ms(), ttl);
        let encoded = serde_json::to_vec(&entry);
        let cost = encoded.as_ref().map(Vec::len).unwrap_or(NOMINAL_COST);
        let disk_key = self.inner.lane.as_ref().and_then(|_| Self::disk_key(&key));
        let expires_at = entry.expires_at;

        let mut memory = self.inner.memory.lock();
        memory.advance_generation();
        let admission = memory.insert(key, entry, cost);
        self.record_admission(admission, cost);

        // Enqueued under the lock so the lane sees writes in generation order.
        if let (Some(lane), Some(disk_key)) = (&self.inner.lane, disk_key) {
            match encoded {
                Ok(data) => lane.write(disk_key, StoredBytes::new(data, expires_at)),
                Err(e) => {
                    tracing::warn!(
                        "Value for '{}' is not serializable, kept in memory only: {}",
                        self.inner.namespace,
                        e
                    );
                    lane.remove(disk_key);
                }
            }
        }
    }

    /// Return the cached value, reading through to the persistent tier on a memory miss.
    pub async fn get(&self, key: &K) -> Option<V> {
        self.get_entry(key).await.map(|entry| entry.value)
    }

    async fn get_entry(&self, key: &K) -> Option<CacheEntry<V>> {
        let generation = {
            let mut memory = self.inner.memory.lock();
            let lookup = memory.get(key, now_ms());
            match lookup {
                Lookup::Hit(entry) => return Some(entry),
                Lookup::Expired => {
                    // The persisted copy carries the same expiration.
                    if let Some(lane) = &self.inner.lane {
                        if let Some(disk_key) = Self::disk_key(key) {
                            lane.remove(disk_key);
                        }
                    }
                    drop(memory);
                    self.record_miss(None);
                    return None;
                }
                Lookup::Miss => memory.generation(),
            }
        };

        let Some(lane) = &self.inner.lane else {
            self.record_miss(None);
            return None;
        };
        let disk_key = Self::disk_key(key)?;

        let Some(stored) = lane.read(disk_key.clone()).await else {
            self.record_miss(Some(disk_key));
            return None;
        };

        let entry: CacheEntry<V> = match serde_json::from_slice(&stored.data) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(
                    "Dropping undecodable persisted entry in '{}': {}",
                    self.inner.namespace,
                    e
                );
                lane.remove(disk_key.clone());
                self.record_miss(Some(disk_key));
                return None;
            }
        };
        if entry.is_expired(now_ms()) {
            self.record_miss(Some(disk_key));
            return None;
        }

        let mut memory = self.inner.memory.lock();
        if memory.generation() == generation {
            let cost = stored.data.len();
            if let Some(admission) = memory.insert_if_absent(key.clone(), entry.clone(), cost) {
                self.record_admission(admission, cost);
            }
        } else {
            tracing::debug!(
                "Skipping promotion in '{}', cache changed during read",
                self.inner.namespace
            );
        }
        Some(entry)
    }

    fn record_admission(&self, admission: Admission, cost: usize) {
        match admission {
            Admission::Admitted { evicted } if evicted > 0 => {
                tracing::debug!(
                    "Evicted {} entries from '{}' to admit a new one",
                    evicted,
                    self.inner.namespace
                );
                self.inner.sink.emit(FetchEvent::Evicted {
                    cache: self.inner.namespace.clone(),
                    count: evicted,
                });
            }
            Admission::Admitted { .. } => {}
            Admission::Rejected => {
                tracing::debug!(
                    "Entry of cost {} exceeds the memory budget of '{}', not kept in memory",
                    cost,
                    self.inner.namespace
                );
            }
        }
    }

    fn record_miss(&self, disk_key: Option<String>) {
        tracing::debug!("Cache miss in '{}'", self.inner.namespace);
        self.inner.sink.emit(FetchEvent::CacheMiss {
            cache: self.inner.namespace.clone(),
            key: disk_key.unwrap_or_default(),
        });
    }

    /// Resolve a value through the cache according to `policy`.
    ///
    /// Producer failures are returned unchanged, except under [`CachePolicy::NetworkFirst`]
    /// when a cached value can stand in.
    pub async fn fetch<F, Fut, E>(&self, key: K, policy: CachePolicy, producer: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        match policy {
            CachePolicy::CacheFirst => {
                if let Some(cached) = self.get(&key).await {
                    return Ok(cached);
                }
                self.produce_and_store(key, producer, None).await
            }
            CachePolicy::NetworkFirst => match producer().await {
                Ok(value) => {
                    self.set(key, value.clone(), None);
                    Ok(value)
                }
                Err(e) => match self.get(&key).await {
                    Some(cached) => {
                        tracing::debug!(
                            "Producer failed for '{}', serving cached value: {}",
                            self.inner.namespace,
                            e
                        );
                        Ok(cached)
                    }
                    None => Err(e),
                },
            },
            CachePolicy::CacheThenRefresh => {
                let Some(cached) = self.get(&key).await else {
                    return self.produce_and_store(key, producer, None).await;
                };

                let cache = self.clone();
                tokio::spawn(async move {
                    match producer().await {
                        Ok(value) => cache.set(key, value, None),
                        Err(e) => tracing::warn!(
                            "Background refresh for '{}' failed: {}",
                            cache.inner.namespace,
                            e
                        ),
                    }
                });
                Ok(cached)
            }
            CachePolicy::Timed(ttl) => {
                if let Some(entry) = self.get_entry(&key).await {
                    if entry.expires_at.is_some() {
                        return Ok(entry.value);
                    }
                }
                self.produce_and_store(key, producer, Some(ttl)).await
            }
            CachePolicy::NoCache => producer().await,
        }
    }

    async fn produce_and_store<F, Fut, E>(
        &self,
        key: K,
        producer: F,
        ttl: Option<Duration>,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let value = producer().await?;
        self.set(key, value.clone(), ttl);
        Ok(value)
    }

    /// Remove an entry from both tiers.
    pub fn remove(&self, key: &K) {
        let disk_key = self.inner.lane.as_ref().and_then(|_| Self::disk_key(key));
        let mut memory = self.inner.memory.lock();
        memory.advance_generation();
        memory.remove(key);
        if let (Some(lane), Some(disk_key)) = (&self.inner.lane, disk_key) {
            lane.remove(disk_key);
        }
    }

    /// Remove every entry from both tiers.
    pub fn clear(&self) {
        let mut memory = self.inner.memory.lock();
        memory.advance_generation();
        memory.clear();
        if let Some(lane) = &self.inner.lane {
            lane.clear();
        }
    }

    /// Wait until every persistent write, remove and clear issued so far has been applied.
    pub async fn flush(&self) {
        if let Some(lane) = &self.inner.lane {
            lane.flush().await;
        }
    }

    /// Drop the whole memory tier. The persistent tier is untouched.
    pub fn purge_memory(&self) {
        self.inner.purge_memory();
    }

    /// Purge the memory tier on every [`MemoryPressure`] signal.
    ///
    /// The listener only holds a weak reference and stops once the cache is dropped or the
    /// channel closes.
    pub fn listen_for_memory_pressure(
        &self,
        mut signals: broadcast::Receiver<MemoryPressure>,
    ) -> JoinHandle<()> {
        let weak: Weak<Inner<K, V>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(MemoryPressure) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        inner.purge_memory();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Number of entries in the memory tier.
    pub fn len(&self) -> usize {
        self.inner.memory.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Summed admission cost of the memory tier.
    pub fn total_cost(&self) -> usize {
        self.inner.memory.lock().total_cost()
    }

    pub fn contains_in_memory(&self, key: &K) -> bool {
        self.inner.memory.lock().contains(key)
    }
}

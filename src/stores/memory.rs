use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::entry::StoredBytes;
use crate::error::CacheError;
use crate::store::PersistentStore;
use crate::utils::{build_cache_key, now_ms};

/// Configuration for HashMapStore.
#[derive(Debug, Clone, Default)]
pub struct HashMapStoreConfig {
    /// Upper bound on stored keys across all namespaces.
    ///
    /// On `set`, expired entries are dropped first; if the map is still over the bound the
    /// entries closest to expiry go next. `None` disables the bound.
    pub max_items: Option<usize>,
}

/// In-process stand-in for a persistent store.
///
/// Nothing survives a restart, which makes it suitable for tests and for running the layered
/// cache with its second tier enabled but without touching disk.
pub struct HashMapStore {
    state: RwLock<HashMap<String, StoredBytes>>,
    max_items: Option<usize>,
}

impl HashMapStore {
    /// Create a new HashMapStore with the given configuration.
    pub fn new(config: HashMapStoreConfig) -> Self {
        HashMapStore {
            state: RwLock::new(HashMap::new()),
            max_items: config.max_items,
        }
    }

    /// Number of keys currently held, expired or not.
    pub async fn len(&self) -> usize {
        self.state.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.is_empty()
    }

    fn evict(state: &mut HashMap<String, StoredBytes>, max_items: usize) {
        let now = now_ms();

        // First delete all expired entries
        state.retain(|_, v| !v.is_expired(now));

        if state.len() > max_items {
            let mut entries: Vec<_> = state
                .iter()
                .map(|(k, v)| (k.clone(), v.expires_at.unwrap_or(i64::MAX)))
                .collect();
            entries.sort_by_key(|(_, expires)| *expires);

            let to_remove = state.len() - max_items;
            for (key, _) in entries.into_iter().take(to_remove) {
                state.remove(&key);
            }
        }
    }
}

#[async_trait]
impl PersistentStore for HashMapStore {
    fn name(&self) -> &'static str {
        "hashmap"
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredBytes>, CacheError> {
        let cache_key = build_cache_key(&namespace, key);
        let state = self.state.read().await;

        let Some(stored) = state.get(&cache_key) else {
            return Ok(None);
        };

        if stored.is_expired(now_ms()) {
            drop(state);
            self.state.write().await.remove(&cache_key);
            return Ok(None);
        }

        Ok(Some(stored.clone()))
    }

    async fn set(&self, namespace: &str, key: &str, bytes: StoredBytes) -> Result<(), CacheError> {
        let cache_key = build_cache_key(&namespace, key);
        let mut state = self.state.write().await;
        state.insert(cache_key, bytes);

        if let Some(max_items) = self.max_items {
            Self::evict(&mut state, max_items);
        }
        Ok(())
    }

    async fn remove(&self, namespace: &str, keys: &[&str]) -> Result<(), CacheError> {
        let mut state = self.state.write().await;

        for key in keys {
            state.remove(&build_cache_key(&namespace, key));
        }

        Ok(())
    }

    async fn clear(&self, namespace: &str) -> Result<(), CacheError> {
        let prefix = build_cache_key(&namespace, "");
        self.state
            .write()
            .await
            .retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_remove() {
        let store = HashMapStore::new(HashMapStoreConfig::default());

        let result = store.get("feeds", "key1").await.unwrap();
        assert!(result.is_none());

        let bytes = StoredBytes::new(b"value1".to_vec(), Some(now_ms() + 60_000));
        store.set("feeds", "key1", bytes).await.unwrap();

        let result = store.get("feeds", "key1").await.unwrap();
        assert_eq!(result.unwrap().data, b"value1");

        store.remove("feeds", &["key1"]).await.unwrap();
        assert!(store.get("feeds", "key1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let store = HashMapStore::new(HashMapStoreConfig::default());
        let bytes = StoredBytes::new(b"old".to_vec(), Some(now_ms() - 1));
        store.set("feeds", "key1", bytes).await.unwrap();

        assert!(store.get("feeds", "key1").await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_clear_is_scoped_to_namespace() {
        let store = HashMapStore::new(HashMapStoreConfig::default());
        store
            .set("a", "k", StoredBytes::new(b"1".to_vec(), None))
            .await
            .unwrap();
        store
            .set("b", "k", StoredBytes::new(b"2".to_vec(), None))
            .await
            .unwrap();

        store.clear("a").await.unwrap();

        assert!(store.get("a", "k").await.unwrap().is_none());
        assert!(store.get("b", "k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_max_items_drops_soonest_expiring() {
        let store = HashMapStore::new(HashMapStoreConfig { max_items: Some(2) });
        let now = now_ms();
        store
            .set("ns", "short", StoredBytes::new(vec![1], Some(now + 1_000)))
            .await
            .unwrap();
        store
            .set("ns", "forever", StoredBytes::new(vec![2], None))
            .await
            .unwrap();
        store
            .set("ns", "long", StoredBytes::new(vec![3], Some(now + 60_000)))
            .await
            .unwrap();

        assert_eq!(store.len().await, 2);
        assert!(store.get("ns", "short").await.unwrap().is_none());
        assert!(store.get("ns", "forever").await.unwrap().is_some());
    }
}

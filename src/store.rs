use async_trait::async_trait;

use crate::entry::StoredBytes;
use crate::error::CacheError;

/// A byte-oriented key/value store backing the persistent tier of a layered cache.
///
/// Keys arrive already hashed into a filesystem and network safe form. The store keeps the
/// expiration metadata next to the bytes and is responsible for cleaning up expired data on its
/// own, but callers re-check expiry anyway.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// A name for logs.
    ///
    /// # Example
    /// - "file"
    /// - "redis"
    fn name(&self) -> &'static str;

    /// Return the stored bytes.
    ///
    /// The response must be `None` for misses and for entries past their expiration.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredBytes>, CacheError>;

    /// Sets the bytes for the given key, replacing any previous value.
    async fn set(&self, namespace: &str, key: &str, bytes: StoredBytes) -> Result<(), CacheError>;

    /// Removes the key(s) from the store.
    async fn remove(&self, namespace: &str, keys: &[&str]) -> Result<(), CacheError>;

    /// Removes every key in the namespace.
    async fn clear(&self, namespace: &str) -> Result<(), CacheError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    /// Store whose reads and writes always fail.
    pub struct BrokenStore;

    #[async_trait]
    impl PersistentStore for BrokenStore {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn get(&self, _: &str, key: &str) -> Result<Option<StoredBytes>, CacheError> {
            Err(CacheError::operation("broken", key, "disk on fire"))
        }

        async fn set(&self, _: &str, key: &str, _: StoredBytes) -> Result<(), CacheError> {
            Err(CacheError::operation("broken", key, "disk on fire"))
        }

        async fn remove(&self, _: &str, _: &[&str]) -> Result<(), CacheError> {
            Ok(())
        }

        async fn clear(&self, _: &str) -> Result<(), CacheError> {
            Ok(())
        }
    }

    /// Wraps a store and delays every read.
    pub struct SlowReads {
        pub inner: Arc<dyn PersistentStore>,
        pub delay: Duration,
    }

    #[async_trait]
    impl PersistentStore for SlowReads {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredBytes>, CacheError> {
            tokio::time::sleep(self.delay).await;
            self.inner.get(namespace, key).await
        }

        async fn set(&self, namespace: &str, key: &str, bytes: StoredBytes) -> Result<(), CacheError> {
            self.inner.set(namespace, key, bytes).await
        }

        async fn remove(&self, namespace: &str, keys: &[&str]) -> Result<(), CacheError> {
            self.inner.remove(namespace, keys).await
        }

        async fn clear(&self, namespace: &str) -> Result<(), CacheError> {
            self.inner.clear(namespace).await
        }
    }
}

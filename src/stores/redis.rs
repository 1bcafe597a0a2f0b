use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;

use crate::entry::StoredBytes;
use crate::error::CacheError;
use crate::store::PersistentStore;
use crate::utils::{build_cache_key, now_ms};

#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// e.g. `redis://localhost:6379`, or `rediss://` for TLS.
    pub url: String,

    /// Prefix prepended to every key, so several applications can share one database.
    pub key_prefix: String,
}

/// Redis-backed persistent store.
///
/// Expiration is delegated to redis (`SET ... PX`); on read the remaining `PTTL` is turned back
/// into an absolute expiration timestamp.
pub struct RedisStore {
    connection: MultiplexedConnection,
    key_prefix: String,
}

impl RedisStore {
    /// Connect to the server. Fails fast if it is unreachable.
    ///
    /// # Example
    /// ```ignore
    /// let store = RedisStore::new(RedisStoreConfig {
    ///     url: "redis://localhost:6379".to_string(),
    ///     key_prefix: "docfetch".to_string(),
    /// })
    /// .await?;
    /// ```
    pub async fn new(config: RedisStoreConfig) -> Result<Self, CacheError> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            CacheError::operation("redis", "", format!("invalid redis url {}: {}", config.url, e))
        })?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheError::operation("redis", "", format!("connect failed: {}", e)))?;

        Ok(RedisStore {
            connection,
            key_prefix: config.key_prefix,
        })
    }

    fn redis_key(&self, namespace: &str, key: &str) -> String {
        build_cache_key(&self.key_prefix, &build_cache_key(&namespace, key))
    }

    /// Milliseconds left until `expires_at`, never below one.
    fn ttl_ms(expires_at: i64) -> u64 {
        (expires_at - now_ms()).max(1) as u64
    }
}

#[async_trait]
impl PersistentStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredBytes>, CacheError> {
        let redis_key = self.redis_key(namespace, key);
        let mut conn = self.connection.clone();

        let (data, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .get(&redis_key)
            .pttl(&redis_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::operation("redis", key, format!("GET failed: {}", e)))?;

        // PTTL is -1 for keys without expiry and -2 for missing keys.
        Ok(data.map(|data| {
            let expires_at = (pttl >= 0).then(|| now_ms() + pttl);
            StoredBytes::new(data, expires_at)
        }))
    }

    async fn set(&self, namespace: &str, key: &str, bytes: StoredBytes) -> Result<(), CacheError> {
        let redis_key = self.redis_key(namespace, key);
        let mut conn = self.connection.clone();

        match bytes.expires_at {
            Some(expires_at) => {
                let _: () = conn
                    .pset_ex(&redis_key, bytes.data, Self::ttl_ms(expires_at))
                    .await
                    .map_err(|e| {
                        CacheError::operation("redis", key, format!("PSETEX failed: {}", e))
                    })?;
            }
            None => {
                let _: () = conn.set(&redis_key, bytes.data).await.map_err(|e| {
                    CacheError::operation("redis", key, format!("SET failed: {}", e))
                })?;
            }
        }

        Ok(())
    }

    async fn remove(&self, namespace: &str, keys: &[&str]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut conn = self.connection.clone();
        let redis_keys: Vec<String> = keys.iter().map(|k| self.redis_key(namespace, k)).collect();

        let _: () = conn.del(&redis_keys).await.map_err(|e| {
            CacheError::operation("redis", redis_keys.join(","), format!("DEL failed: {}", e))
        })?;

        Ok(())
    }

    async fn clear(&self, namespace: &str) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}*", self.redis_key(namespace, ""));

        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(&pattern)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::operation("redis", &pattern, format!("KEYS failed: {}", e)))?;

        if keys.is_empty() {
            return Ok(());
        }

        let _: () = conn
            .del(&keys)
            .await
            .map_err(|e| CacheError::operation("redis", &pattern, format!("DEL failed: {}", e)))?;

        Ok(())
    }
}

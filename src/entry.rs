use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::utils::duration_ms;

/// A cache entry containing a value and its optional expiration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    /// The cached value.
    pub value: V,

    /// Unix timestamp in milliseconds.
    /// At and after this time the entry must not be returned. `None` never expires.
    pub expires_at: Option<i64>,
}

impl<V> CacheEntry<V> {
    /// Create a cache entry expiring `ttl` after `now_ms`, or never when `ttl` is `None`.
    pub fn new(value: V, now_ms: i64, ttl: Option<Duration>) -> Self {
        CacheEntry {
            value,
            expires_at: ttl.map(|ttl| now_ms.saturating_add(duration_ms(ttl))),
        }
    }

    /// Check if the entry has expired and should not be used.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|expires_at| now_ms >= expires_at)
    }
}

/// Raw bytes as held by a persistent store, with the expiration metadata kept alongside.
///
/// `data` is always the JSON serialization of a [`CacheEntry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBytes {
    pub data: Vec<u8>,
    pub expires_at: Option<i64>,
}

impl StoredBytes {
    pub fn new(data: Vec<u8>, expires_at: Option<i64>) -> Self {
        StoredBytes { data, expires_at }
    }

    /// Check if the stored bytes have expired according to their metadata.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|expires_at| now_ms >= expires_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_boundary() {
        let entry = CacheEntry::new("v", 1_000, Some(Duration::from_millis(500)));
        assert_eq!(entry.expires_at, Some(1_500));
        assert!(!entry.is_expired(1_499));
        assert!(entry.is_expired(1_500));
        assert!(entry.is_expired(2_000));
    }

    #[test]
    fn test_no_ttl_never_expires() {
        let entry = CacheEntry::new(42u32, 1_000, None);
        assert!(!entry.is_expired(i64::MAX));
    }

    #[test]
    fn test_serialized_entry_keeps_expiry() {
        let entry = CacheEntry::new("doc".to_string(), 10, Some(Duration::from_millis(5)));
        let json = serde_json::to_vec(&entry).unwrap();
        let back: CacheEntry<String> = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.value, "doc");
        assert_eq!(back.expires_at, Some(15));
    }
}

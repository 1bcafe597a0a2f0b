//! Shared utilities for the fetch layer.

use sha2::{Digest, Sha256};
use std::fmt::Display;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Build a composite cache key from namespace and key.
///
/// Format: `{namespace}::{key}`
pub fn build_cache_key<N: Display>(namespace: &N, key: &str) -> String {
    format!("{}::{}", namespace, key)
}

/// Get the current time in milliseconds since UNIX epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Convert a duration to whole milliseconds, saturating at `i64::MAX`.
pub fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Hex-encoded SHA-256 digest, used as a filesystem and redis safe key.
pub fn hashed_key(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}

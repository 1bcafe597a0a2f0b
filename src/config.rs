use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::breaker::CircuitBreakerConfig;
use crate::document::FreshnessPolicy;
use crate::error::ConfigError;
use crate::layered::LayeredCacheConfig;

/// Prefix of the environment variables read by [`FetchLayerConfig::from_env`].
pub const ENV_PREFIX: &str = "DOCFETCH_";

/// Complete configuration of the fetch layer.
///
/// Durations are in milliseconds so the struct maps directly onto flat config files and
/// environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchLayerConfig {
    /// Memory tier entry budget, per format cache.
    pub max_entries: usize,
    /// Memory tier byte budget, per format cache.
    pub max_cost_bytes: usize,
    pub stale_after_ms: u64,
    pub expire_after_ms: u64,
    /// Keep a persistent tier under `persistence_dir`.
    pub persist: bool,
    pub persistence_dir: Option<PathBuf>,
    pub failure_threshold: u32,
    pub breaker_timeout_ms: u64,
    pub half_open_retry_count: u32,
    /// Default for [`FetchOptions::prefer_primary`](crate::FetchOptions).
    pub prefer_primary: bool,
    pub request_timeout_ms: u64,
}

impl Default for FetchLayerConfig {
    fn default() -> Self {
        let cache = LayeredCacheConfig::default();
        let freshness = FreshnessPolicy::conservative();
        let breaker = CircuitBreakerConfig::default();
        FetchLayerConfig {
            max_entries: cache.max_entries,
            max_cost_bytes: cache.max_cost,
            stale_after_ms: freshness.stale_after().as_millis() as u64,
            expire_after_ms: freshness.expire_after().as_millis() as u64,
            persist: false,
            persistence_dir: None,
            failure_threshold: breaker.failure_threshold,
            breaker_timeout_ms: breaker.timeout.as_millis() as u64,
            half_open_retry_count: breaker.half_open_retry_count,
            prefer_primary: true,
            request_timeout_ms: 30_000,
        }
    }
}

impl FetchLayerConfig {
    /// Defaults overridden by any `DOCFETCH_*` variables that are set, e.g.
    /// `DOCFETCH_MAX_ENTRIES=200` or `DOCFETCH_PERSISTENCE_DIR=/var/cache/docfetch`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(format!("{}{}", ENV_PREFIX, name)).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = FetchLayerConfig::default();

        if let Some(v) = parse(&lookup, "MAX_ENTRIES")? {
            config.max_entries = v;
        }
        if let Some(v) = parse(&lookup, "MAX_COST_BYTES")? {
            config.max_cost_bytes = v;
        }
        if let Some(v) = parse(&lookup, "STALE_AFTER_MS")? {
            config.stale_after_ms = v;
        }
        if let Some(v) = parse(&lookup, "EXPIRE_AFTER_MS")? {
            config.expire_after_ms = v;
        }
        if let Some(v) = parse(&lookup, "PERSIST")? {
            config.persist = v;
        }
        if let Some(dir) = lookup("PERSISTENCE_DIR") {
            config.persistence_dir = Some(PathBuf::from(dir));
        }
        if let Some(v) = parse(&lookup, "FAILURE_THRESHOLD")? {
            config.failure_threshold = v;
        }
        if let Some(v) = parse(&lookup, "BREAKER_TIMEOUT_MS")? {
            config.breaker_timeout_ms = v;
        }
        if let Some(v) = parse(&lookup, "HALF_OPEN_RETRY_COUNT")? {
            config.half_open_retry_count = v;
        }
        if let Some(v) = parse(&lookup, "PREFER_PRIMARY")? {
            config.prefer_primary = v;
        }
        if let Some(v) = parse(&lookup, "REQUEST_TIMEOUT_MS")? {
            config.request_timeout_ms = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.freshness()?;
        for (name, value) in [
            ("max_entries", self.max_entries as u64),
            ("max_cost_bytes", self.max_cost_bytes as u64),
            ("failure_threshold", u64::from(self.failure_threshold)),
            ("half_open_retry_count", u64::from(self.half_open_retry_count)),
            ("request_timeout_ms", self.request_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    name,
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn cache(&self) -> LayeredCacheConfig {
        LayeredCacheConfig {
            max_entries: self.max_entries,
            max_cost: self.max_cost_bytes,
        }
    }

    pub fn freshness(&self) -> Result<FreshnessPolicy, ConfigError> {
        FreshnessPolicy::new(
            Duration::from_millis(self.stale_after_ms),
            Duration::from_millis(self.expire_after_ms),
        )
    }

    pub fn breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            timeout: Duration::from_millis(self.breaker_timeout_ms),
            half_open_retry_count: self.half_open_retry_count,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
    }
}

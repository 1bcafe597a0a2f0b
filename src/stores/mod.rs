//! Persistent store implementations for the layered cache.

pub mod file;
pub mod memory;
pub mod redis;

pub use file::{FileStore, FileStoreConfig};
pub use memory::{HashMapStore, HashMapStoreConfig};
pub use redis::{RedisStore, RedisStoreConfig};

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::entry::StoredBytes;
use crate::error::CacheError;
use crate::store::PersistentStore;
use crate::utils::{hashed_key, now_ms};

/// Marker written in the header line of entries that never expire.
const NO_EXPIRY: &str = "-";

/// Configuration for FileStore.
#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    /// Root directory. Each namespace gets its own subdirectory.
    pub root: PathBuf,
}

/// Filesystem-backed persistent store.
///
/// Layout: `{root}/{namespace}/{sha256(key)}`. Each file starts with a header line holding the
/// expiration timestamp in unix milliseconds (or `-`), followed by the raw bytes. Writes go to a
/// temporary sibling first and are renamed into place, so readers never see a torn file.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a new FileStore. The directory is created lazily on first write.
    pub fn new(config: FileStoreConfig) -> Self {
        FileStore { root: config.root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        let safe: String = namespace
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(safe)
    }

    fn file_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.namespace_dir(namespace)
            .join(hashed_key(key.as_bytes()))
    }

    fn encode(bytes: &StoredBytes) -> Vec<u8> {
        let header = match bytes.expires_at {
            Some(expires_at) => expires_at.to_string(),
            None => NO_EXPIRY.to_string(),
        };
        let mut out = Vec::with_capacity(header.len() + 1 + bytes.data.len());
        out.extend_from_slice(header.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(&bytes.data);
        out
    }

    fn decode(raw: &[u8]) -> Option<StoredBytes> {
        let newline = raw.iter().position(|b| *b == b'\n')?;
        let header = std::str::from_utf8(&raw[..newline]).ok()?;
        let expires_at = match header {
            NO_EXPIRY => None,
            other => Some(other.parse::<i64>().ok()?),
        };
        Some(StoredBytes::new(raw[newline + 1..].to_vec(), expires_at))
    }

    async fn remove_file(&self, path: &Path, key: &str) -> Result<(), CacheError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::operation(
                "file",
                key,
                format!("remove failed: {}", e),
            )),
        }
    }
}

#[async_trait]
impl PersistentStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredBytes>, CacheError> {
        let path = self.file_path(namespace, key);

        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CacheError::operation(
                    "file",
                    key,
                    format!("read failed: {}", e),
                ));
            }
        };

        let Some(stored) = Self::decode(&raw) else {
            self.remove_file(&path, key).await?;
            return Err(CacheError::Serialization(format!(
                "corrupt cache file {}",
                path.display()
            )));
        };

        if stored.is_expired(now_ms()) {
            self.remove_file(&path, key).await?;
            return Ok(None);
        }

        Ok(Some(stored))
    }

    async fn set(&self, namespace: &str, key: &str, bytes: StoredBytes) -> Result<(), CacheError> {
        let dir = self.namespace_dir(namespace);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            CacheError::operation("file", key, format!("create_dir failed: {}", e))
        })?;

        let path = self.file_path(namespace, key);
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, Self::encode(&bytes))
            .await
            .map_err(|e| CacheError::operation("file", key, format!("write failed: {}", e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| CacheError::operation("file", key, format!("rename failed: {}", e)))?;

        Ok(())
    }

    async fn remove(&self, namespace: &str, keys: &[&str]) -> Result<(), CacheError> {
        for key in keys {
            let path = self.file_path(namespace, key);
            self.remove_file(&path, key).await?;
        }
        Ok(())
    }

    async fn clear(&self, namespace: &str) -> Result<(), CacheError> {
        let dir = self.namespace_dir(namespace);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(CacheError::operation(
                    "file",
                    namespace,
                    format!("read_dir failed: {}", e),
                ));
            }
        };

        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            CacheError::operation("file", namespace, format!("read_dir failed: {}", e))
        })? {
            let path = entry.path();
            self.remove_file(&path, namespace).await?;
        }

        Ok(())
    }
}

//! Content-addressed result cache
//!
//! Finished ledgers are stored under the SHA-256 of the raw input bytes, so
//! identical bytes under any filename share one entry. Vision-model outputs
//! are memoized under the same hash plus a digest of the call input.
//!
//! Entries are wrapped in a versioned JSON envelope. An entry written under a
//! different format version reads as a miss. Unreadable or corrupt entries
//! also read as misses; the cache never fails an analysis.

use crate::error::CacheError;
use crate::ledger::LedgerSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Current envelope format; bump when `LedgerSnapshot` changes shape
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Raw key/value storage behind the result cache
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError>;

    async fn has(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.get(key).await?.is_some())
    }
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.read().await.contains_key(key))
    }
}

/// One file per key under a root directory
///
/// Writes go to a temporary sibling and are renamed into place, so readers
/// never observe a partial entry. Concurrent writers of one key race and the
/// last rename wins.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    root: PathBuf,
}

impl FileCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Keys are `/`-separated; each segment becomes a directory level
    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/').filter(|s| !s.is_empty() && *s != "..") {
            path.push(segment);
        }
        path.set_extension("json");
        path
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &value).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool, CacheError> {
        Ok(tokio::fs::try_exists(self.path_for(key)).await?)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    format_version: u32,
    created_at: DateTime<Utc>,
    payload: T,
}

/// Only the version is needed to decide hit or miss
#[derive(Debug, Deserialize)]
struct EnvelopeHeader {
    format_version: u32,
}

/// Versioned cache of analysis results
#[derive(Clone)]
pub struct ResultCache {
    store: Arc<dyn CacheStore>,
    format_version: u32,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("format_version", &self.format_version)
            .finish_non_exhaustive()
    }
}

/// Key for a finished ledger
pub fn ledger_key(content_hash: &str) -> String {
    format!("ledger/{}", content_hash)
}

/// Key for a memoized model output
pub fn model_key(content_hash: &str, operation: &str, input: &str) -> String {
    format!("model/{}/{}/{}", content_hash, operation, sha256_hex(input.as_bytes()))
}

/// Lowercase hex SHA-256
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

impl ResultCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self::with_format_version(store, CACHE_FORMAT_VERSION)
    }

    pub fn with_format_version(store: Arc<dyn CacheStore>, format_version: u32) -> Self {
        Self {
            store,
            format_version,
        }
    }

    /// Memory-backed cache
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheStore::new()))
    }

    pub fn format_version(&self) -> u32 {
        self.format_version
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = match self.store.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };

        let header: EnvelopeHeader = match serde_json::from_slice(&bytes) {
            Ok(h) => h,
            Err(e) => {
                warn!(key = %key, error = %e, "Corrupt cache entry, treating as miss");
                return None;
            }
        };
        if header.format_version != self.format_version {
            debug!(
                key = %key,
                found = header.format_version,
                expected = self.format_version,
                "Cache format version mismatch, treating as miss"
            );
            return None;
        }

        match serde_json::from_slice::<Envelope<T>>(&bytes) {
            Ok(envelope) => Some(envelope.payload),
            Err(e) => {
                warn!(key = %key, error = %e, "Cache payload unreadable, treating as miss");
                None
            }
        }
    }

    /// Store `payload` unless a same-version entry already exists
    async fn put_json<T: Serialize>(&self, key: &str, payload: &T) -> Result<bool, CacheError> {
        if let Ok(Some(existing)) = self.store.get(key).await {
            if let Ok(header) = serde_json::from_slice::<EnvelopeHeader>(&existing) {
                if header.format_version == self.format_version {
                    debug!(key = %key, "Cache entry already present, not rewriting");
                    return Ok(false);
                }
            }
        }

        let envelope = Envelope {
            format_version: self.format_version,
            created_at: Utc::now(),
            payload,
        };
        let bytes = serde_json::to_vec(&envelope)?;
        self.store.put(key, bytes).await?;
        debug!(key = %key, "Cache entry written");
        Ok(true)
    }

    pub async fn get_ledger(&self, content_hash: &str) -> Option<LedgerSnapshot> {
        self.get_json(&ledger_key(content_hash)).await
    }

    /// Returns `true` if a new entry was written
    pub async fn put_ledger(&self, snapshot: &LedgerSnapshot) -> Result<bool, CacheError> {
        self.put_json(&ledger_key(&snapshot.content_hash), snapshot).await
    }

    pub async fn has_ledger(&self, content_hash: &str) -> bool {
        self.get_ledger(content_hash).await.is_some()
    }

    pub async fn get_model_output(
        &self,
        content_hash: &str,
        operation: &str,
        input: &str,
    ) -> Option<String> {
        self.get_json(&model_key(content_hash, operation, input)).await
    }

    pub async fn put_model_output(
        &self,
        content_hash: &str,
        operation: &str,
        input: &str,
        output: &str,
    ) -> Result<bool, CacheError> {
        self.put_json(&model_key(content_hash, operation, input), &output)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Signal;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn snapshot(hash: &str) -> LedgerSnapshot {
        LedgerSnapshot {
            content_hash: hash.to_string(),
            signals: vec![Signal::new("identity.width", 64.0, 1.0, "identity")],
            contributors: BTreeSet::from(["identity".to_string()]),
            conflicts: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(model_key("h", "correct_text", "x").starts_with("model/h/correct_text/"));
    }

    #[tokio::test]
    async fn test_memory_round_trip() {
        let cache = ResultCache::in_memory();
        assert!(cache.get_ledger("abc").await.is_none());

        let snap = snapshot("abc");
        assert!(cache.put_ledger(&snap).await.unwrap());
        assert_eq!(cache.get_ledger("abc").await, Some(snap.clone()));
        assert!(cache.has_ledger("abc").await);

        // Same-version entry is not rewritten
        assert!(!cache.put_ledger(&snap).await.unwrap());
    }

    #[tokio::test]
    async fn test_version_mismatch_is_a_miss() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
        let v1 = ResultCache::with_format_version(Arc::clone(&store), 1);
        let v2 = ResultCache::with_format_version(Arc::clone(&store), 2);

        v1.put_ledger(&snapshot("abc")).await.unwrap();
        assert!(v2.get_ledger("abc").await.is_none());

        // Newer version overwrites the stale entry
        assert!(v2.put_ledger(&snapshot("abc")).await.unwrap());
        assert!(v2.get_ledger("abc").await.is_some());
        assert!(v1.get_ledger("abc").await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let store = Arc::new(MemoryCacheStore::new());
        store.put("ledger/abc", b"not json".to_vec()).await.unwrap();
        let cache = ResultCache::new(store);
        assert!(cache.get_ledger("abc").await.is_none());
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::new(Arc::new(FileCacheStore::new(dir.path())));

        let snap = snapshot("deadbeef");
        cache.put_ledger(&snap).await.unwrap();
        assert!(dir.path().join("ledger").join("deadbeef.json").exists());
        assert_eq!(cache.get_ledger("deadbeef").await, Some(snap));

        cache
            .put_model_output("deadbeef", "correct_text", "Back Bf the net", "Back of the net")
            .await
            .unwrap();
        assert_eq!(
            cache
                .get_model_output("deadbeef", "correct_text", "Back Bf the net")
                .await
                .as_deref(),
            Some("Back of the net")
        );
        assert!(cache
            .get_model_output("deadbeef", "correct_text", "other")
            .await
            .is_none());
    }
}

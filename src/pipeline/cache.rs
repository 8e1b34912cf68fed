//! Content-addressed upload cache.
//!
//! Identical pixels hash to the same SHA-256 digest, so a block that did not
//! change between two conversions (or two identical blocks in one document)
//! reuses the URL from the first upload. Entries carry their upload time and
//! are purged lazily, on the lookup that finds them expired.
//!
//! The cache is best-effort: a store that cannot be read or written degrades
//! to "always upload" with a warning, never to a failed block.

use crate::store::KvStore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const KEY_PREFIX: &str = "cache:";

/// One cached upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub content_hash: String,
    pub url: String,
    /// Unix milliseconds.
    pub uploaded_at: u64,
    pub kind: String,
}

/// Result of [`UploadCache::get_or_upload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLookup {
    pub url: String,
    pub hash: String,
    /// `true` when the uploader was not invoked.
    pub cached: bool,
}

/// SHA-256 of `bytes` as lower-case hex.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct UploadCache {
    store: Arc<dyn KvStore>,
    ttl: Duration,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl UploadCache {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Non-expired entry for `hash`, purging it if it has expired.
    pub fn lookup(&self, hash: &str) -> Option<CacheEntry> {
        self.lookup_at(hash, now_millis())
    }

    fn lookup_at(&self, hash: &str, now: u64) -> Option<CacheEntry> {
        let key = format!("{KEY_PREFIX}{hash}");
        let raw = match self.store.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Upload cache read failed: {}", e);
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Dropping unreadable cache entry {}: {}", key, e);
                self.purge(&key);
                return None;
            }
        };

        if now.saturating_sub(entry.uploaded_at) > self.ttl.as_millis() as u64 {
            debug!("Cache entry {} expired", &hash[..hash.len().min(12)]);
            self.purge(&key);
            return None;
        }
        Some(entry)
    }

    fn purge(&self, key: &str) {
        if let Err(e) = self.store.remove(key) {
            warn!("Failed to purge cache entry {}: {}", key, e);
        }
    }

    /// Record an upload.
    pub fn insert(&self, entry: &CacheEntry) {
        let key = format!("{KEY_PREFIX}{}", entry.content_hash);
        match serde_json::to_string(entry) {
            Ok(json) => {
                if let Err(e) = self.store.set(&key, json) {
                    warn!("Upload cache write failed: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialise cache entry: {}", e),
        }
    }

    fn lock_for(&self, hash: &str) -> Arc<tokio::sync::Mutex<()>> {
        match self.in_flight.lock() {
            Ok(mut map) => Arc::clone(map.entry(hash.to_string()).or_default()),
            // A poisoned map only loses de-duplication, not correctness.
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn release(&self, hash: &str) {
        if let Ok(mut map) = self.in_flight.lock() {
            if map.get(hash).is_some_and(|l| Arc::strong_count(l) == 1) {
                map.remove(hash);
            }
        }
    }

    /// Return the cached URL for `bytes`, or run `upload` and cache its URL.
    ///
    /// Concurrent calls for the same content are serialised, so `upload` runs
    /// at most once per content hash while an entry is live.
    pub async fn get_or_upload<F, Fut, E>(
        &self,
        bytes: &[u8],
        kind: &str,
        upload: F,
    ) -> Result<CacheLookup, E>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        let hash = content_hash(bytes);
        let lock = self.lock_for(&hash);
        let result = {
            let _held = lock.lock().await;
            self.get_or_upload_locked(&hash, kind, upload).await
        };
        drop(lock);
        self.release(&hash);
        result
    }

    async fn get_or_upload_locked<F, Fut, E>(
        &self,
        hash: &str,
        kind: &str,
        upload: F,
    ) -> Result<CacheLookup, E>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        if let Some(entry) = self.lookup(hash) {
            debug!("Cache hit {} → {}", &hash[..12], entry.url);
            return Ok(CacheLookup {
                url: entry.url,
                hash: hash.to_string(),
                cached: true,
            });
        }

        let url = upload(hash.to_string()).await?;
        self.insert(&CacheEntry {
            content_hash: hash.to_string(),
            url: url.clone(),
            uploaded_at: now_millis(),
            kind: kind.to_string(),
        });
        Ok(CacheLookup {
            url,
            hash: hash.to_string(),
            cached: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache(ttl: Duration) -> (UploadCache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (UploadCache::new(store.clone(), ttl), store)
    }

    #[test]
    fn hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn second_lookup_hits_cache() {
        let (cache, _) = cache(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        let upload = |hash: String| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, String>(format!("https://cdn.test/{hash}.png")) }
        };

        let first = cache.get_or_upload(b"pixels", "code", upload).await.unwrap();
        let second = cache.get_or_upload(b"pixels", "code", upload).await.unwrap();
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.url, second.url);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_upload_is_not_cached() {
        let (cache, store) = cache(Duration::from_secs(60));
        let err = cache
            .get_or_upload(b"x", "math", |_| async { Err::<String, _>("503") })
            .await;
        assert_eq!(err, Err("503"));
        assert!(store.is_empty());
    }

    #[test]
    fn expired_entries_are_purged_on_lookup() {
        let (cache, store) = cache(Duration::from_secs(10));
        cache.insert(&CacheEntry {
            content_hash: "h".into(),
            url: "u".into(),
            uploaded_at: 1_000,
            kind: "code".into(),
        });
        assert!(cache.lookup_at("h", 5_000).is_some());
        assert!(cache.lookup_at("h", 11_001).is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn concurrent_identical_content_uploads_once() {
        let (cache, _) = cache(Duration::from_secs(60));
        let cache = Arc::new(cache);
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_upload(b"same block", "code", |hash| async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Ok::<_, String>(hash)
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

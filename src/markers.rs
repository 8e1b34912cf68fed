//! Persisted "already uploaded" markers.
//!
//! A marker says: in document version `V`, block `id` already has an image at
//! `url`. Re-running a conversion on the same text resolves marked blocks
//! straight from the marker, without touching the DOM or the image host.
//! Markers live under `uploaded:{version}:{block_id}` in the shared
//! [`KvStore`] and expire like cache entries.

use crate::pipeline::cache::{content_hash, now_millis};
use crate::store::KvStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedMarker {
    pub url: String,
    /// Unix milliseconds.
    pub marked_at: u64,
}

/// Version identifier of a source text (SHA-256 hex).
pub fn document_version(source: &str) -> String {
    content_hash(source.as_bytes())
}

fn prefix(version: &str) -> String {
    format!("uploaded:{version}:")
}

fn key(version: &str, block_id: &str) -> String {
    format!("uploaded:{version}:{block_id}")
}

pub struct UploadedMarkers {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl UploadedMarkers {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Mark several blocks of `version` as uploaded at once.
    pub fn seed<'a>(&self, version: &str, entries: impl IntoIterator<Item = (&'a str, &'a str)>) {
        for (block_id, url) in entries {
            self.record(version, block_id, url);
        }
    }

    pub fn record(&self, version: &str, block_id: &str, url: &str) {
        let marker = UploadedMarker {
            url: url.to_string(),
            marked_at: now_millis(),
        };
        let result = serde_json::to_string(&marker)
            .map_err(|e| e.to_string())
            .and_then(|json| {
                self.store
                    .set(&key(version, block_id), json)
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = result {
            warn!("Failed to record upload marker for {}: {}", block_id, e);
        }
    }

    pub fn is_uploaded(&self, version: &str, block_id: &str) -> bool {
        self.url_for(version, block_id).is_some()
    }

    /// URL of a live marker; expired or unreadable markers are removed.
    pub fn url_for(&self, version: &str, block_id: &str) -> Option<String> {
        self.url_for_at(version, block_id, now_millis())
    }

    fn url_for_at(&self, version: &str, block_id: &str, now: u64) -> Option<String> {
        let key = key(version, block_id);
        let raw = match self.store.get(&key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Upload marker read failed: {}", e);
                return None;
            }
        };
        match serde_json::from_str::<UploadedMarker>(&raw) {
            Ok(m) if now.saturating_sub(m.marked_at) <= self.ttl.as_millis() as u64 => Some(m.url),
            Ok(_) => {
                debug!("Marker {} expired", key);
                let _ = self.store.remove(&key);
                None
            }
            Err(e) => {
                warn!("Dropping unreadable marker {}: {}", key, e);
                let _ = self.store.remove(&key);
                None
            }
        }
    }

    /// Remove every marker of `version`. Returns how many were removed.
    pub fn clear_document(&self, version: &str) -> usize {
        let keys = match self.store.keys_with_prefix(&prefix(version)) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Failed to list markers: {}", e);
                return 0;
            }
        };
        keys.iter()
            .filter(|k| self.store.remove(k).is_ok())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn markers() -> UploadedMarkers {
        UploadedMarkers::new(Arc::new(MemoryStore::new()), Duration::from_secs(60))
    }

    #[test]
    fn seed_and_query() {
        let m = markers();
        let v = document_version("doc");
        m.seed(&v, [("code-1", "u1"), ("math-1", "u2")]);
        assert!(m.is_uploaded(&v, "code-1"));
        assert_eq!(m.url_for(&v, "math-1").as_deref(), Some("u2"));
        assert!(!m.is_uploaded(&v, "code-2"));
        assert!(!m.is_uploaded(&document_version("other"), "code-1"));
    }

    #[test]
    fn clear_document_only_touches_that_version() {
        let m = markers();
        m.seed("v1", [("a", "1"), ("b", "2")]);
        m.seed("v2", [("a", "3")]);
        assert_eq!(m.clear_document("v1"), 2);
        assert!(!m.is_uploaded("v1", "a"));
        assert!(m.is_uploaded("v2", "a"));
    }

    #[test]
    fn expired_marker_is_dropped() {
        let m = UploadedMarkers::new(Arc::new(MemoryStore::new()), Duration::from_millis(5));
        m.record("v", "a", "u");
        let later = now_millis() + 1_000;
        assert_eq!(m.url_for_at("v", "a", later), None);
        assert_eq!(m.url_for("v", "a"), None);
    }

    #[test]
    fn version_is_content_hash() {
        assert_eq!(document_version("x"), document_version("x"));
        assert_ne!(document_version("x"), document_version("y"));
        assert_eq!(document_version("x").len(), 64);
    }
}

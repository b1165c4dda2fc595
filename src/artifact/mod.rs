//! Processed-artifact cache
//!
//! Read-through cache of final rendered bytes, keyed by a content-plus-
//! parameters fingerprint and sealed with AES-GCM at rest. A missing object
//! is a miss, not an error. Writes run detached so a disconnecting client
//! never aborts a cache fill, and write failures only ever cost us a future
//! cache hit.

mod cipher;
mod store;

pub use cipher::Cipher;
pub use store::{ObjectStore, S3ArtifactStore};

use std::sync::Arc;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Error)]
pub enum ArtifactError {
    #[error("artifact store failure: {0}")]
    Store(String),

    #[error("artifact cipher failure: {0}")]
    Cipher(String),
}

/// Fingerprint of a rendered artifact: SHA-256 over the raw document bytes
/// followed by the render parameters as decimal strings. Stable across runs
/// and processes.
pub fn artifact_key(payload: &[u8], page: usize, width: u32, scale: f32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(page.to_string());
    hasher.update(width.to_string());
    hasher.update(format!("{scale:.5}"));
    hex::encode(hasher.finalize())
}

/// Facade over the store chain with the per-request bypass flag threaded
/// explicitly. Bypass skips both reads and writes; it is a testing aid, not
/// a public API.
#[derive(Clone)]
pub struct ArtifactCache {
    store: Arc<dyn ObjectStore>,
}

impl ArtifactCache {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        ArtifactCache { store }
    }

    pub async fn get(&self, key: &str, bypass: bool) -> Result<Option<Bytes>, ArtifactError> {
        if bypass {
            return Ok(None);
        }
        self.store.get(key).await
    }

    /// Fire-and-forget write. Errors are logged, never surfaced.
    pub fn put_detached(&self, key: String, payload: Bytes, bypass: bool) {
        if bypass {
            return;
        }
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(err) = store.put(&key, payload).await {
                warn!(key, "fail to put the object into the artifact cache: {err}");
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// In-memory store for tests.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub objects: Mutex<HashMap<String, Bytes>>,
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn get(&self, key: &str) -> Result<Option<Bytes>, ArtifactError> {
            Ok(self.objects.lock().get(key).cloned())
        }

        async fn put(&self, key: &str, payload: Bytes) -> Result<(), ArtifactError> {
            self.objects.lock().insert(key.to_string(), payload);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryStore;
    use super::*;

    #[test]
    fn key_is_stable() {
        let a = artifact_key(b"payload", 1, 1024, 1.5);
        let b = artifact_key(b"payload", 1, 1024, 1.5);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn key_tracks_every_parameter() {
        let base = artifact_key(b"payload", 1, 1024, 1.5);
        assert_ne!(base, artifact_key(b"payload2", 1, 1024, 1.5));
        assert_ne!(base, artifact_key(b"payload", 2, 1024, 1.5));
        assert_ne!(base, artifact_key(b"payload", 1, 800, 1.5));
        assert_ne!(base, artifact_key(b"payload", 1, 1024, 1.50001));
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let cache = ArtifactCache::new(Arc::new(MemoryStore::default()));
        cache.put_detached("k".to_string(), Bytes::from_static(b"rendered"), false);

        // Detached put; poll until the spawned task lands.
        for _ in 0..50 {
            if cache.get("k", false).await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(
            cache.get("k", false).await.unwrap().unwrap(),
            Bytes::from_static(b"rendered")
        );
    }

    #[tokio::test]
    async fn missing_object_is_a_miss_not_an_error() {
        let cache = ArtifactCache::new(Arc::new(MemoryStore::default()));
        assert!(cache.get("absent", false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bypass_skips_reads_and_writes() {
        let store = Arc::new(MemoryStore::default());
        let cache = ArtifactCache::new(store.clone());

        cache.put_detached("k".to_string(), Bytes::from_static(b"x"), true);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(store.objects.lock().is_empty());

        store
            .objects
            .lock()
            .insert("k".to_string(), Bytes::from_static(b"x"));
        assert!(cache.get("k", true).await.unwrap().is_none());
        assert!(cache.get("k", false).await.unwrap().is_some());
    }
}

//! LRU cache of open rasterizer handles
//!
//! Keyed by the local file path. At most one handle exists per path; opening
//! is serialized by a construction lock so concurrent requests for the same
//! document observe a single handle. Eviction, explicit removal and purge
//! all stop the handle, which is how the file cache's eviction callback
//! makes the renderer let go of a file before deleting it.
//!
//! Lock ordering: construction lock, then handle map. The map lock on its
//! own is safe to take from synchronous callers (the eviction callback).

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use super::{handle::Rasterizer, RenderBackend, RenderError};

#[derive(Clone)]
pub struct RasterCache {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn RenderBackend>,
    buffer_size: usize,
    construct: tokio::sync::Mutex<()>,
    handles: Mutex<LruCache<std::path::PathBuf, Arc<Rasterizer>>>,
}

impl RasterCache {
    pub fn new(size: usize, buffer_size: usize, backend: Arc<dyn RenderBackend>) -> Self {
        let capacity = NonZeroUsize::new(size).unwrap_or(NonZeroUsize::new(20).unwrap());
        RasterCache {
            inner: Arc::new(Inner {
                backend,
                buffer_size,
                construct: tokio::sync::Mutex::new(()),
                handles: Mutex::new(LruCache::new(capacity)),
            }),
        }
    }

    /// Return the handle for `path`, opening the document on first use.
    pub async fn get_or_open(&self, path: &Path) -> Result<Arc<Rasterizer>, RenderError> {
        if let Some(handle) = self.lookup(path) {
            return Ok(handle);
        }

        let _guard = self.inner.construct.lock().await;
        // Someone may have opened it while we awaited the lock.
        if let Some(handle) = self.lookup(path) {
            return Ok(handle);
        }

        debug!(path = %path.display(), "initializing new rasterizer");
        let handle = Rasterizer::open(
            self.inner.backend.clone(),
            path.to_path_buf(),
            self.inner.buffer_size,
        )
        .await?;

        let mut handles = self.inner.handles.lock();
        if let Some((victim_path, victim)) = handles.push(path.to_path_buf(), handle.clone()) {
            if victim_path != path {
                victim.stop();
            }
        }
        Ok(handle)
    }

    fn lookup(&self, path: &Path) -> Option<Arc<Rasterizer>> {
        self.inner.handles.lock().get(&path.to_path_buf()).cloned()
    }

    /// True when a handle for `path` is loaded.
    pub fn contains(&self, path: &Path) -> bool {
        self.inner.handles.lock().contains(&path.to_path_buf())
    }

    pub fn len(&self) -> usize {
        self.inner.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop and drop the handle for `path`, if any. Safe to call from the
    /// file cache's eviction callback.
    pub fn remove(&self, path: &Path) {
        let handle = self.inner.handles.lock().pop(&path.to_path_buf());
        if let Some(handle) = handle {
            handle.stop();
        }
    }

    /// Stop and drop every handle.
    pub fn purge(&self) {
        let mut handles = self.inner.handles.lock();
        while let Some((_, handle)) = handles.pop_lru() {
            handle.stop();
        }
    }
}

//! Size-bounded, single-flight LRU file cache
//!
//! Keys map to absolute paths under the cache's base directory. A file
//! exists on disk exactly as long as its entry is present in the LRU; the
//! cache alone deletes files. Concurrent fetches for the same key share one
//! download: the first caller creates an in-flight slot and runs the
//! downloader, everyone else parks on the slot's watch channel and re-checks
//! when it closes.
//!
//! The eviction callback runs inside the cache's critical section, before
//! the file is removed, so a borrower of the path (the renderer cache) can
//! release its handle first.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, warn};

use super::{DownloadError, Downloader, FetchKey};

/// Called under the cache lock when an entry is evicted, before the file is
/// deleted.
pub type EvictCallback = Box<dyn Fn(&FetchKey, &Path) + Send + Sync>;

/// A row of the cache listing.
#[derive(Debug, Clone)]
pub struct FileCacheEntry {
    pub key: FetchKey,
    pub storage_path: PathBuf,
}

#[derive(Clone)]
pub struct FileCache {
    inner: Arc<Inner>,
}

struct Inner {
    base_dir: PathBuf,
    default_extension: String,
    download_timeout: Duration,
    downloader: Arc<dyn Downloader>,
    on_evict: OnceLock<EvictCallback>,
    state: Mutex<CacheState>,
}

struct CacheState {
    lru: LruCache<FetchKey, PathBuf>,
    inflight: HashMap<FetchKey, watch::Receiver<bool>>,
}

enum Action {
    Ready(PathBuf),
    Wait(watch::Receiver<bool>),
    Download(watch::Sender<bool>),
}

impl FileCache {
    pub fn new(
        size: usize,
        base_dir: impl Into<PathBuf>,
        default_extension: impl Into<String>,
        download_timeout: Duration,
        downloader: Arc<dyn Downloader>,
    ) -> Self {
        let capacity = NonZeroUsize::new(size).unwrap_or(NonZeroUsize::new(512).unwrap());
        FileCache {
            inner: Arc::new(Inner {
                base_dir: base_dir.into(),
                default_extension: default_extension.into(),
                download_timeout,
                downloader,
                on_evict: OnceLock::new(),
                state: Mutex::new(CacheState {
                    lru: LruCache::new(capacity),
                    inflight: HashMap::new(),
                }),
            }),
        }
    }

    /// Register the eviction callback. May be set once, before serving.
    pub fn set_on_evict(&self, callback: EvictCallback) {
        if self.inner.on_evict.set(callback).is_err() {
            warn!("file cache eviction callback was already set");
        }
    }

    /// The absolute path `key` would be stored at, whether or not it is
    /// cached.
    pub fn storage_path(&self, key: &FetchKey) -> PathBuf {
        self.inner.storage_path(key)
    }

    /// Read-only presence check; does not touch LRU order.
    pub fn contains(&self, key: &FetchKey) -> bool {
        self.inner.state.lock().lru.contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the cache contents, most recently used first.
    pub fn entries(&self) -> Vec<FileCacheEntry> {
        let st = self.inner.state.lock();
        st.lru
            .iter()
            .map(|(key, path)| FileCacheEntry {
                key: key.clone(),
                storage_path: path.clone(),
            })
            .collect()
    }

    /// Return the local path for `key`, downloading on a miss. Concurrent
    /// calls for the same key trigger exactly one download.
    pub async fn fetch(&self, key: &FetchKey) -> Result<PathBuf, DownloadError> {
        self.fetch_inner(key, None).await
    }

    /// Like [`fetch`](Self::fetch), but a cached file whose mtime is not
    /// strictly newer than `newer_than` is evicted and re-downloaded.
    pub async fn fetch_newer_than(
        &self,
        key: &FetchKey,
        newer_than: SystemTime,
    ) -> Result<PathBuf, DownloadError> {
        self.fetch_inner(key, Some(newer_than)).await
    }

    /// Evict everything, deleting the files.
    pub fn purge(&self) {
        self.inner.purge();
    }

    /// Evict everything on a background task; the receiver resolves when the
    /// purge is done.
    pub fn purge_async(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            inner.purge();
            let _ = tx.send(());
        });
        rx
    }

    async fn fetch_inner(
        &self,
        key: &FetchKey,
        newer_than: Option<SystemTime>,
    ) -> Result<PathBuf, DownloadError> {
        if let Some(t) = newer_than {
            self.inner.evict_if_stale(key, t);
        }

        loop {
            let action = {
                let mut st = self.inner.state.lock();
                if let Some(rx) = st.inflight.get(key) {
                    Action::Wait(rx.clone())
                } else {
                    let present = st.lru.get(key).filter(|path| path.exists()).cloned();
                    match present {
                        Some(path) => Action::Ready(path),
                        None => {
                            // Drops an entry whose file vanished underneath
                            // us; absent keys make this a no-op.
                            st.lru.pop(key);
                            let (tx, rx) = watch::channel(false);
                            st.inflight.insert(key.clone(), rx);
                            Action::Download(tx)
                        }
                    }
                }
            };

            match action {
                Action::Ready(path) => return Ok(path),
                Action::Wait(mut rx) => {
                    debug!(%key, "awaiting in-flight download");
                    // A dropped sender wakes us too; either way the next
                    // iteration re-checks presence and may take over the
                    // download itself.
                    let _ = rx.changed().await;
                }
                Action::Download(done) => return self.run_download(key.clone(), done).await,
            }
        }
    }

    /// Run the download on a detached task so that a disconnecting client
    /// does not abort a download other waiters depend on. The task installs
    /// the file, clears the in-flight slot and closes the signal; waiters
    /// wake only after the slot is gone, so they never observe an empty
    /// slot.
    async fn run_download(
        &self,
        key: FetchKey,
        done: watch::Sender<bool>,
    ) -> Result<PathBuf, DownloadError> {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let dest = inner.storage_path(&key);
            let result = match tokio::time::timeout(
                inner.download_timeout,
                inner.downloader.fetch(&key, &dest),
            )
            .await
            {
                Ok(Ok(())) => Ok(dest),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(DownloadError::Transient(format!(
                    "download of '{key}' timed out"
                ))),
            };

            {
                let mut st = inner.state.lock();
                if let Ok(path) = &result {
                    inner.insert_locked(&mut st, key.clone(), path.clone());
                }
                st.inflight.remove(&key);
            }
            let _ = done.send(true);
            result
        });

        match task.await {
            Ok(result) => result,
            Err(err) => Err(DownloadError::Fatal(format!("download task failed: {err}"))),
        }
    }
}

impl Inner {
    fn storage_path(&self, key: &FetchKey) -> PathBuf {
        self.base_dir
            .join(key.storage_rel_path(&self.default_extension))
    }

    fn insert_locked(&self, st: &mut CacheState, key: FetchKey, path: PathBuf) {
        if let Some((victim_key, victim_path)) = st.lru.push(key.clone(), path) {
            // push returns the displaced LRU entry, or the old value when the
            // key was already present; only the former is an eviction.
            if victim_key != key {
                self.evict_entry(&victim_key, &victim_path);
            }
        }
    }

    /// Runs with the state lock held: callback first, then file removal.
    fn evict_entry(&self, key: &FetchKey, path: &Path) {
        debug!(%key, path = %path.display(), "evicting cache entry");
        if let Some(callback) = self.on_evict.get() {
            callback(key, path);
        }
        if let Err(err) = std::fs::remove_file(path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                error!(%key, path = %path.display(), "unable to remove evicted file: {err}");
            }
        }
    }

    fn evict_if_stale(&self, key: &FetchKey, newer_than: SystemTime) {
        let mut st = self.state.lock();
        if st.inflight.contains_key(key) {
            // A download is already underway; whatever it produces is
            // considered current.
            return;
        }
        let Some(path) = st.lru.peek(key) else {
            return;
        };
        let stale = std::fs::metadata(path)
            .and_then(|meta| meta.modified())
            .map(|mtime| mtime <= newer_than)
            .unwrap_or(true);
        if stale {
            let path = path.clone();
            st.lru.pop(key);
            self.evict_entry(key, &path);
        }
    }

    fn purge(&self) {
        let mut st = self.state.lock();
        while let Some((key, path)) = st.lru.pop_lru() {
            self.evict_entry(&key, &path);
        }
    }
}

//! On-demand fetch pipeline
//!
//! A `FetchKey` names a remote document; a `Downloader` materializes it on
//! local disk; the `FileCache` fronts the downloaders with a size-bounded,
//! single-flight LRU.

mod cache;
mod downloader;
mod key;

pub use cache::{FileCache, FileCacheEntry};
pub use downloader::{HttpDownloader, ObjectStoreDownloader, Origin, OriginDownloader};
pub use key::FetchKey;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

/// Typed downloader failure taxonomy.
#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    /// The origin reports the document does not exist.
    #[error("document not found at the origin")]
    NotFound,

    /// The request names something the origin cannot serve.
    #[error("invalid request: {0}")]
    Client(String),

    /// Worth retrying: timeouts, connection resets.
    #[error("transient download failure: {0}")]
    Transient(String),

    /// Not worth retrying.
    #[error("download failed: {0}")]
    Fatal(String),
}

/// Strategy producing a local file from a logical path.
///
/// Implementations stream into a temporary file next to `dest` and atomically
/// rename it into place on success; a failed download leaves nothing behind.
/// Downloaders never touch the cache index, that is the `FileCache`'s job.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn fetch(&self, key: &FetchKey, dest: &Path) -> Result<(), DownloadError>;
}

//! Application state management

use std::sync::Arc;

use ab_glyph::FontVec;

use crate::annotations::AnnotationClient;
use crate::artifact::ArtifactCache;
use crate::config::Config;
use crate::fetch::{FileCache, HttpDownloader};
use crate::raster::RasterCache;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    file_cache: FileCache,
    raster_cache: RasterCache,
    artifact_cache: Option<ArtifactCache>,
    annotation_client: Option<AnnotationClient>,
    annotation_font: Option<Arc<FontVec>>,
    http_downloader: Arc<HttpDownloader>,
}

impl AppState {
    pub fn new(
        config: Config,
        file_cache: FileCache,
        raster_cache: RasterCache,
        artifact_cache: Option<ArtifactCache>,
        annotation_client: Option<AnnotationClient>,
        annotation_font: Option<Arc<FontVec>>,
        http_downloader: Arc<HttpDownloader>,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                config,
                file_cache,
                raster_cache,
                artifact_cache,
                annotation_client,
                annotation_font,
                http_downloader,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn file_cache(&self) -> &FileCache {
        &self.inner.file_cache
    }

    pub fn raster_cache(&self) -> &RasterCache {
        &self.inner.raster_cache
    }

    pub fn artifact_cache(&self) -> Option<&ArtifactCache> {
        self.inner.artifact_cache.as_ref()
    }

    pub fn annotation_client(&self) -> Option<&AnnotationClient> {
        self.inner.annotation_client.as_ref()
    }

    pub fn annotation_font(&self) -> Option<&Arc<FontVec>> {
        self.inner.annotation_font.as_ref()
    }

    pub fn http_downloader(&self) -> &HttpDownloader {
        &self.inner.http_downloader
    }
}

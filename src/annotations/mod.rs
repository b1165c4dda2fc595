//! Annotation source client and overlay preparation
//!
//! Annotations live in a remote key/value service keyed by the request
//! token. For the requested page they become render overlays; image
//! annotations are fetched into temp files concurrently, and a cleanup guard
//! deletes those files on every exit path.

use std::path::PathBuf;
use std::sync::Arc;

use ab_glyph::FontVec;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::fetch::HttpDownloader;
use crate::raster::{OverlayKind, PreparedOverlay};

#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("fail to fetch annotations: {0}")]
    Fetch(String),

    #[error("fail to decode annotations: {0}")]
    Decode(String),

    #[error("fail to fetch annotation image '{0}': {1}")]
    Image(String, String),

    #[error("text annotations need a configured font")]
    FontMissing,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Extent {
    pub w: f32,
    pub h: f32,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FontSpec {
    pub family: String,
    /// Size in points.
    pub size: f32,
}

/// Overlay content, page-relative coordinates in [0,1].
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Annotation {
    Checkbox {
        page: usize,
        value: bool,
        location: Point,
        size: Extent,
    },
    Text {
        page: usize,
        value: String,
        location: Point,
        size: Extent,
        font: FontSpec,
    },
    Image {
        page: usize,
        url: String,
        location: Point,
        size: Extent,
    },
}

impl Annotation {
    pub fn page(&self) -> usize {
        match self {
            Annotation::Checkbox { page, .. }
            | Annotation::Text { page, .. }
            | Annotation::Image { page, .. } => *page,
        }
    }

    fn geometry(&self) -> (&Point, &Extent) {
        match self {
            Annotation::Checkbox { location, size, .. }
            | Annotation::Text { location, size, .. }
            | Annotation::Image { location, size, .. } => (location, size),
        }
    }
}

/// Client for the remote annotation source.
#[derive(Clone)]
pub struct AnnotationClient {
    base_url: String,
    http: reqwest::Client,
}

impl AnnotationClient {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        AnnotationClient {
            base_url: base_url.into(),
            http,
        }
    }

    /// Fetch every annotation stored for `token`. An absent key means no
    /// annotations, not an error.
    pub async fn fetch_for_token(&self, token: &str) -> Result<Vec<Annotation>, AnnotationError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), token);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AnnotationError::Fetch(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(AnnotationError::Fetch(format!(
                "annotation source answered HTTP {}",
                response.status()
            )));
        }

        response
            .json::<Vec<Annotation>>()
            .await
            .map_err(|e| AnnotationError::Decode(e.to_string()))
    }
}

/// Deletes tracked temp files when dropped, whichever way the request ends.
#[derive(Debug, Default)]
pub struct TempFileGuard {
    paths: Vec<PathBuf>,
}

impl TempFileGuard {
    pub fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        for path in &self.paths {
            if let Err(err) = std::fs::remove_file(path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %path.display(), "could not remove annotation temp file: {err}");
                }
            }
        }
    }
}

/// Turn the annotations matching `page` (1-based) into render overlays,
/// downloading image payloads concurrently. The returned guard must stay
/// alive until the page has been rendered.
pub async fn prepare_overlays(
    annotations: &[Annotation],
    page: usize,
    http: &HttpDownloader,
    font: Option<&Arc<FontVec>>,
) -> Result<(Vec<PreparedOverlay>, TempFileGuard), AnnotationError> {
    let mut guard = TempFileGuard::default();
    let mut overlays = Vec::new();
    let mut downloads = Vec::new();

    for annotation in annotations.iter().filter(|a| a.page() == page) {
        let (location, size) = annotation.geometry();
        let (x, y, w, h) = (location.x, location.y, size.w, size.h);

        let kind = match annotation {
            Annotation::Checkbox { value, .. } => OverlayKind::Checkbox { checked: *value },
            Annotation::Text { value, font: spec, .. } => {
                let font = font.ok_or(AnnotationError::FontMissing)?;
                OverlayKind::Text {
                    value: value.clone(),
                    font_size: spec.size,
                    font: font.clone(),
                }
            }
            Annotation::Image { url, .. } => {
                let path =
                    std::env::temp_dir().join(format!("raster-annotation-{}.img", Uuid::new_v4()));
                guard.track(path.clone());
                downloads.push((url.clone(), path.clone()));
                OverlayKind::Image { path }
            }
        };

        overlays.push(PreparedOverlay { kind, x, y, w, h });
    }

    // Image payloads fan out in parallel with each other (and, at the call
    // site, with the document fetch).
    let results = futures::future::join_all(
        downloads
            .iter()
            .map(|(url, path)| http.download_url(url, &[], path)),
    )
    .await;
    for (result, (url, _)) in results.into_iter().zip(&downloads) {
        result.map_err(|e| AnnotationError::Image(url.clone(), e.to_string()))?;
    }

    Ok((overlays, guard))
}

//! Rendering layer
//!
//! The external PDF engine sits behind the [`RenderBackend`] seam; the rest
//! of the crate only ever talks to a [`Rasterizer`] handle obtained from the
//! [`RasterCache`]. Handles are long-lived, bound to a local file, and
//! stopped when the file cache evicts that file.

mod cache;
pub mod engine;
mod handle;
mod overlay;

pub use cache::RasterCache;
pub use handle::{HandleState, Rasterizer};
pub use overlay::{apply_overlays, OverlayKind, PreparedOverlay};

use std::path::Path;
use std::time::Duration;

use thiserror::Error;

/// How long a single render job may take before the request gives up.
pub const RENDER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Error)]
pub enum RenderError {
    /// The requested page is not part of the document.
    #[error("page is not part of this document")]
    BadPage,

    #[error("page rendering timed out")]
    Timeout,

    /// The handle's job queue is saturated.
    #[error("render queue is full")]
    Busy,

    /// The handle was stopped underneath the caller.
    #[error("rasterizer is stopped")]
    Stopped,

    #[error("render engine failure: {0}")]
    Engine(String),
}

/// Output encodings a render job can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Png,
    Jpeg,
    Svg,
    Html,
}

impl OutputFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Svg => "image/svg+xml",
            OutputFormat::Html => "text/html",
        }
    }

    /// Vector outputs are worth gzip-wrapping; bitmaps are already
    /// compressed.
    pub fn is_vector(&self) -> bool {
        matches!(self, OutputFormat::Svg | OutputFormat::Html)
    }
}

/// Everything a worker needs to produce one page.
#[derive(Debug, Clone)]
pub struct RenderJobSpec {
    /// Zero-based page index.
    pub page: usize,
    /// Target pixel width; 0 means natural width.
    pub width: u32,
    /// Scale override; 0.0 means none.
    pub scale: f32,
    /// Dots per inch; 0 means the engine default of 72.
    pub dpi: u32,
    /// JPEG quality, 1..=100.
    pub quality: u8,
    pub format: OutputFormat,
    /// Annotation overlays composited before encoding.
    pub overlays: Vec<PreparedOverlay>,
}

impl RenderJobSpec {
    pub fn page_image(page: usize, format: OutputFormat) -> Self {
        RenderJobSpec {
            page,
            width: 0,
            scale: 0.0,
            dpi: 0,
            quality: 100,
            format,
            overlays: Vec::new(),
        }
    }
}

/// Opaque engine seam. Implementations open documents from local paths;
/// the returned document stays on the worker thread that opened it.
pub trait RenderBackend: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn RenderedDocument>, RenderError>;
}

/// An open document, owned by exactly one render worker.
pub trait RenderedDocument {
    fn page_count(&self) -> usize;
    fn render_page(&self, spec: &RenderJobSpec) -> Result<Vec<u8>, RenderError>;
}

//! MuPDF-backed render engine
//!
//! The only module that talks to the PDF library. Documents are opened and
//! rendered on the handle's worker thread; nothing here crosses threads.

use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, RgbaImage};
use mupdf::{Colorspace, Document, Matrix};

use super::{
    apply_overlays, OutputFormat, RenderBackend, RenderError, RenderJobSpec, RenderedDocument,
};

#[derive(Default)]
pub struct MupdfBackend;

impl MupdfBackend {
    pub fn new() -> Self {
        MupdfBackend
    }
}

fn engine_err(err: mupdf::Error) -> RenderError {
    RenderError::Engine(err.to_string())
}

impl RenderBackend for MupdfBackend {
    fn open(&self, path: &Path) -> Result<Box<dyn RenderedDocument>, RenderError> {
        let name = path
            .to_str()
            .ok_or_else(|| RenderError::Engine("non-UTF-8 document path".to_string()))?;
        let doc = Document::open(name).map_err(engine_err)?;
        let page_count = doc.page_count().map_err(engine_err)? as usize;
        Ok(Box::new(OpenDocument { doc, page_count }))
    }
}

struct OpenDocument {
    doc: Document,
    page_count: usize,
}

impl RenderedDocument for OpenDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn render_page(&self, spec: &RenderJobSpec) -> Result<Vec<u8>, RenderError> {
        if spec.page >= self.page_count {
            return Err(RenderError::BadPage);
        }
        let page = self.doc.load_page(spec.page as i32).map_err(engine_err)?;

        let bounds = page.bounds().map_err(engine_err)?;
        let page_width = bounds.x1 - bounds.x0;

        // Width wins over scale; dpi multiplies on top of either.
        let mut scale = if spec.width > 0 && page_width > 0.0 {
            spec.width as f32 / page_width
        } else if spec.scale > 0.0 {
            spec.scale
        } else {
            1.0
        };
        if spec.dpi > 0 {
            scale *= spec.dpi as f32 / 72.0;
        }
        let matrix = Matrix::new_scale(scale, scale);

        match spec.format {
            OutputFormat::Svg => {
                let svg = page.to_svg(&matrix).map_err(engine_err)?;
                Ok(svg.into_bytes())
            }
            OutputFormat::Html => {
                let html = page.to_html().map_err(engine_err)?;
                Ok(html.into_bytes())
            }
            OutputFormat::Png | OutputFormat::Jpeg => {
                let colorspace = Colorspace::device_rgb();
                let pixmap = page
                    .to_pixmap(&matrix, &colorspace, true, true)
                    .map_err(engine_err)?;
                let mut img = pixmap_to_rgba(&pixmap)?;
                if !spec.overlays.is_empty() {
                    apply_overlays(&mut img, &spec.overlays, scale)?;
                }
                encode_image(img, spec.format, spec.quality)
            }
        }
    }
}

fn pixmap_to_rgba(pixmap: &mupdf::Pixmap) -> Result<RgbaImage, RenderError> {
    let width = pixmap.width() as u32;
    let height = pixmap.height() as u32;
    let samples = pixmap.samples();
    let n = pixmap.n() as usize;

    let mut rgba = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height as usize {
        for x in 0..width as usize {
            let offset = (y * width as usize + x) * n;
            let r = samples.get(offset).copied().unwrap_or(0);
            let g = samples.get(offset + 1).copied().unwrap_or(0);
            let b = samples.get(offset + 2).copied().unwrap_or(0);
            let a = if n >= 4 {
                samples.get(offset + 3).copied().unwrap_or(255)
            } else {
                255
            };
            rgba.extend_from_slice(&[r, g, b, a]);
        }
    }

    RgbaImage::from_raw(width, height, rgba)
        .ok_or_else(|| RenderError::Engine("failed to build image buffer".to_string()))
}

fn encode_image(img: RgbaImage, format: OutputFormat, quality: u8) -> Result<Vec<u8>, RenderError> {
    let mut output = Vec::new();
    match format {
        OutputFormat::Png => {
            DynamicImage::ImageRgba8(img)
                .write_to(&mut Cursor::new(&mut output), image::ImageFormat::Png)
                .map_err(|e| RenderError::Engine(e.to_string()))?;
        }
        OutputFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgba8(img).to_rgb8();
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
                &mut Cursor::new(&mut output),
                quality.clamp(1, 100),
            );
            rgb.write_with_encoder(encoder)
                .map_err(|e| RenderError::Engine(e.to_string()))?;
        }
        OutputFormat::Svg | OutputFormat::Html => {
            return Err(RenderError::Engine(
                "vector formats are not bitmap-encoded".to_string(),
            ))
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn encodes_png_and_jpeg() {
        let img = RgbaImage::from_pixel(16, 16, Rgba([120, 10, 200, 255]));
        let png = encode_image(img.clone(), OutputFormat::Png, 100).unwrap();
        assert_eq!(&png[1..4], b"PNG");

        let jpeg = encode_image(img, OutputFormat::Jpeg, 80).unwrap();
        assert_eq!(&jpeg[..2], [0xFF, 0xD8]);
    }

    #[test]
    fn vector_formats_are_rejected_by_the_bitmap_encoder() {
        let img = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 255]));
        assert!(encode_image(img, OutputFormat::Svg, 100).is_err());
    }
}

//! Annotation overlays
//!
//! Overlays arrive with page-relative fractional geometry and are drawn onto
//! the rasterized page before encoding. Vector outputs skip overlays; see
//! DESIGN.md.

use std::path::PathBuf;
use std::sync::Arc;

use ab_glyph::{FontVec, PxScale};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut};
use imageproc::rect::Rect;

use super::RenderError;

const INK: Rgba<u8> = Rgba([0, 0, 0, 255]);

#[derive(Clone)]
pub enum OverlayKind {
    Checkbox {
        checked: bool,
    },
    Text {
        value: String,
        /// Font size in points; converted to pixels with the render scale.
        font_size: f32,
        font: Arc<FontVec>,
    },
    Image {
        /// Temp file fetched by the annotation pipeline; deleted by its
        /// cleanup guard, not by the renderer.
        path: PathBuf,
    },
}

impl std::fmt::Debug for OverlayKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverlayKind::Checkbox { checked } => {
                f.debug_struct("Checkbox").field("checked", checked).finish()
            }
            OverlayKind::Text { value, font_size, .. } => f
                .debug_struct("Text")
                .field("value", value)
                .field("font_size", font_size)
                .finish(),
            OverlayKind::Image { path } => {
                f.debug_struct("Image").field("path", path).finish()
            }
        }
    }
}

/// One overlay, positioned in page-relative [0,1] coordinates.
#[derive(Debug, Clone)]
pub struct PreparedOverlay {
    pub kind: OverlayKind,
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// Draw `overlays` onto the rendered page. `scale` is the effective
/// page-to-pixel scale the engine rendered with, used to size fonts.
pub fn apply_overlays(
    img: &mut RgbaImage,
    overlays: &[PreparedOverlay],
    scale: f32,
) -> Result<(), RenderError> {
    let (page_w, page_h) = (img.width() as f32, img.height() as f32);

    for overlay in overlays {
        let x = (overlay.x * page_w).round();
        let y = (overlay.y * page_h).round();
        let w = (overlay.w * page_w).round().max(1.0);
        let h = (overlay.h * page_h).round().max(1.0);

        match &overlay.kind {
            OverlayKind::Checkbox { checked } => {
                let rect = Rect::at(x as i32, y as i32).of_size(w as u32, h as u32);
                draw_hollow_rect_mut(img, rect, INK);
                if *checked {
                    draw_line_segment_mut(
                        img,
                        (x + 0.15 * w, y + 0.55 * h),
                        (x + 0.40 * w, y + 0.80 * h),
                        INK,
                    );
                    draw_line_segment_mut(
                        img,
                        (x + 0.40 * w, y + 0.80 * h),
                        (x + 0.85 * w, y + 0.20 * h),
                        INK,
                    );
                }
            }
            OverlayKind::Text {
                value,
                font_size,
                font,
            } => {
                let px = PxScale::from((font_size * scale).max(1.0));
                draw_text_mut(img, INK, x as i32, y as i32, px, font.as_ref(), value);
            }
            OverlayKind::Image { path } => {
                let source = image::open(path).map_err(|e| {
                    RenderError::Engine(format!(
                        "failed to read annotation image '{}': {e}",
                        path.display()
                    ))
                })?;
                let resized = source.resize_exact(
                    w as u32,
                    h as u32,
                    image::imageops::FilterType::Triangle,
                );
                image::imageops::overlay(img, &resized.to_rgba8(), x as i64, y as i64);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([255, 255, 255, 255]))
    }

    #[test]
    fn checkbox_marks_pixels() {
        let mut img = blank(100, 100);
        let overlays = vec![PreparedOverlay {
            kind: OverlayKind::Checkbox { checked: true },
            x: 0.1,
            y: 0.1,
            w: 0.2,
            h: 0.2,
        }];
        apply_overlays(&mut img, &overlays, 1.0).unwrap();
        let inked = img.pixels().filter(|p| p.0 != [255, 255, 255, 255]).count();
        assert!(inked > 0);
    }

    #[test]
    fn unchecked_checkbox_draws_only_the_border() {
        let mut checked = blank(100, 100);
        let mut unchecked = blank(100, 100);
        let overlay = |checked| PreparedOverlay {
            kind: OverlayKind::Checkbox { checked },
            x: 0.2,
            y: 0.2,
            w: 0.4,
            h: 0.4,
        };
        apply_overlays(&mut checked, &[overlay(true)], 1.0).unwrap();
        apply_overlays(&mut unchecked, &[overlay(false)], 1.0).unwrap();
        let count = |img: &RgbaImage| img.pixels().filter(|p| p.0 != [255, 255, 255, 255]).count();
        assert!(count(&checked) > count(&unchecked));
    }

    #[test]
    fn image_overlay_copies_source_pixels() {
        let dir = tempfile::TempDir::new().unwrap();
        let stamp_path = dir.path().join("stamp.png");
        let stamp = RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255]));
        stamp.save(&stamp_path).unwrap();

        let mut img = blank(100, 100);
        let overlays = vec![PreparedOverlay {
            kind: OverlayKind::Image { path: stamp_path },
            x: 0.5,
            y: 0.5,
            w: 0.1,
            h: 0.1,
        }];
        apply_overlays(&mut img, &overlays, 1.0).unwrap();
        assert_eq!(img.get_pixel(55, 55).0, [255, 0, 0, 255]);
    }

    #[test]
    fn missing_image_is_an_engine_error() {
        let mut img = blank(10, 10);
        let overlays = vec![PreparedOverlay {
            kind: OverlayKind::Image {
                path: PathBuf::from("/nonexistent/stamp.png"),
            },
            x: 0.0,
            y: 0.0,
            w: 0.5,
            h: 0.5,
        }];
        let err = apply_overlays(&mut img, &overlays, 1.0).unwrap_err();
        assert!(matches!(err, RenderError::Engine(_)));
    }
}

//! Tiled text watermark compositing.
//!
//! The watermark is rendered once into a square transparent tile, rotated
//! to a fixed diagonal, then stamped across the page in a grid whose
//! spacing scales with the page dimensions, so density stays visually
//! consistent from A6 scans to poster-sized pages. The stamped page is
//! flattened to opaque RGB before encoding.

use std::path::{Path, PathBuf};

use ab_glyph::{FontArc, PxScale};
use image::{DynamicImage, Rgba, RgbaImage, imageops};
use imageproc::{
    drawing::{draw_text_mut, text_size},
    geometric_transformations::{Interpolation, rotate_about_center},
};
use thiserror::Error;
use tracing::warn;

use crate::config::WatermarkSettings;

/// Floor for the computed font size on very small pages.
const MIN_FONT_PX: f32 = 18.0;
/// Font size as a fraction of page width.
const FONT_WIDTH_FRACTION: f32 = 0.04;
/// Breathing room around the rotated text inside its tile.
const TILE_PADDING_PX: u32 = 16;

/// Well-known font locations tried when no explicit path is configured.
const FONT_SEARCH_PATHS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
];

#[derive(Debug, Error)]
pub enum WatermarkError {
    #[error("failed to load watermark font from {}: {reason}", .path.display())]
    Font { path: PathBuf, reason: String },
    #[error("failed to read rasterized page {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to write stamped page {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

pub struct WatermarkCompositor {
    font: Option<FontArc>,
    opacity: u8,
    angle_degrees: f32,
    max_chars: usize,
}

impl WatermarkCompositor {
    /// Build the compositor from settings.
    ///
    /// An explicitly configured font must load; without one the well-known
    /// system locations are tried best-effort, and when none is usable the
    /// compositor degrades to pass-through (jobs still succeed, unstamped).
    pub fn from_settings(settings: &WatermarkSettings) -> Result<Self, WatermarkError> {
        let font = match settings.font_path.as_ref() {
            Some(path) => Some(load_font(path)?),
            None => find_system_font(),
        };

        if font.is_none() {
            warn!(
                target = "application::render::watermark",
                "no watermark font found; watermarked renders will pass through unstamped"
            );
        }

        Ok(Self {
            font,
            opacity: settings.opacity,
            angle_degrees: settings.angle_degrees,
            max_chars: settings.max_chars as usize,
        })
    }

    /// Whether a font is loaded and stamping will actually happen.
    pub fn available(&self) -> bool {
        self.font.is_some()
    }

    /// Overlay the repeating diagonal text tile across the page.
    ///
    /// Pass-through when no text is given or no font is loaded.
    pub fn composite(&self, page: RgbaImage, text: Option<&str>) -> RgbaImage {
        let Some(text) = text.map(str::trim).filter(|text| !text.is_empty()) else {
            return page;
        };
        let Some(font) = self.font.as_ref() else {
            return page;
        };

        let text = truncate_chars(text, self.max_chars);
        let (width, height) = page.dimensions();
        let tile = self.build_tile(font, text, width);
        let (step_x, step_y) = tile_spacing(width, height, tile.dimensions());

        let mut canvas = page;
        let mut row: i64 = 0;
        let mut y = -(tile.height() as i64);
        while y < height as i64 {
            let offset = if row % 2 == 1 { step_x / 2 } else { 0 };
            let mut x = -(tile.width() as i64) + offset;
            while x < width as i64 {
                imageops::overlay(&mut canvas, &tile, x, y);
                x += step_x;
            }
            y += step_y;
            row += 1;
        }

        canvas
    }

    /// Stamp a rasterized page file and write the flattened result.
    pub fn stamp_file(&self, input: &Path, output: &Path, text: &str) -> Result<(), WatermarkError> {
        let page = image::open(input)
            .map_err(|source| WatermarkError::Read {
                path: input.to_path_buf(),
                source,
            })?
            .into_rgba8();

        let stamped = self.composite(page, Some(text));

        // Flatten: the stored artifact must carry no residual alpha channel.
        let flattened = DynamicImage::ImageRgba8(stamped).into_rgb8();
        flattened.save(output).map_err(|source| WatermarkError::Write {
            path: output.to_path_buf(),
            source,
        })
    }

    fn build_tile(&self, font: &FontArc, text: &str, page_width: u32) -> RgbaImage {
        let scale = PxScale::from((page_width as f32 * FONT_WIDTH_FRACTION).max(MIN_FONT_PX));
        let (text_w, text_h) = text_size(scale, font, text);
        let text_w = (text_w as u32).max(1);
        let text_h = (text_h as u32).max(1);

        // A square with the text's diagonal as its side never clips the
        // rotated glyphs, whatever the configured angle.
        let diagonal = ((text_w as u64 * text_w as u64 + text_h as u64 * text_h as u64) as f64)
            .sqrt()
            .ceil() as u32;
        let side = diagonal + TILE_PADDING_PX;
        let mut tile = RgbaImage::from_pixel(side, side, Rgba([0, 0, 0, 0]));
        draw_text_mut(
            &mut tile,
            Rgba([255, 255, 255, self.opacity]),
            ((side - text_w) / 2) as i32,
            ((side - text_h) / 2) as i32,
            scale,
            font,
            text,
        );

        rotate_about_center(
            &tile,
            self.angle_degrees.to_radians(),
            Interpolation::Bilinear,
            Rgba([0, 0, 0, 0]),
        )
    }
}

/// Grid steps proportional to the page so watermark density is constant
/// across page sizes.
fn tile_spacing(width: u32, height: u32, (tile_w, tile_h): (u32, u32)) -> (i64, i64) {
    let step_x = (3 * tile_w as i64 / 4 + width as i64 / 8).max(1);
    let step_y = (3 * tile_h as i64 / 4 + height as i64 / 8).max(1);
    (step_x, step_y)
}

/// Cut `text` to at most `max_chars` characters, on a character boundary.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn load_font(path: &Path) -> Result<FontArc, WatermarkError> {
    let data = std::fs::read(path).map_err(|err| WatermarkError::Font {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    FontArc::try_from_vec(data).map_err(|err| WatermarkError::Font {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

fn find_system_font() -> Option<FontArc> {
    FONT_SEARCH_PATHS
        .iter()
        .map(Path::new)
        .filter(|path| path.exists())
        .find_map(|path| load_font(path).ok())
}

#[cfg(test)]
mod tests {
    use crate::config::WatermarkSettings;

    use super::*;

    fn settings() -> WatermarkSettings {
        WatermarkSettings {
            font_path: None,
            max_chars: 200,
            opacity: 64,
            angle_degrees: 30.0,
        }
    }

    fn grey_page(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba([128, 128, 128, 255]))
    }

    #[test]
    fn truncation_cuts_on_character_boundaries() {
        assert_eq!(truncate_chars("watermark", 200), "watermark");
        assert_eq!(truncate_chars("watermark", 5), "water");
        // Multi-byte characters count as one each and never split.
        assert_eq!(truncate_chars("wässerzeichen", 2), "wä");
        assert_eq!(truncate_chars("", 5), "");
    }

    #[test]
    fn absent_or_blank_text_passes_through_unchanged() {
        let compositor = WatermarkCompositor::from_settings(&settings()).expect("compositor");
        let page = grey_page(64, 64);

        let untouched = compositor.composite(page.clone(), None);
        assert_eq!(untouched.as_raw(), page.as_raw());

        let blank = compositor.composite(page.clone(), Some("   "));
        assert_eq!(blank.as_raw(), page.as_raw());
    }

    #[test]
    fn oversized_text_is_truncated_rather_than_rejected() {
        let compositor = WatermarkCompositor::from_settings(&settings()).expect("compositor");
        let long_text = "A".repeat(10_000);
        // Must not panic or fail regardless of font availability.
        let _ = compositor.composite(grey_page(256, 256), Some(&long_text));
    }

    #[test]
    fn stamping_changes_pixels_when_a_font_is_available() {
        let compositor = WatermarkCompositor::from_settings(&settings()).expect("compositor");
        if !compositor.available() {
            // No usable system font on this host; pass-through is the
            // documented degradation.
            return;
        }

        let page = grey_page(400, 300);
        let stamped = compositor.composite(page.clone(), Some("CONFIDENTIAL"));
        assert_ne!(stamped.as_raw(), page.as_raw(), "watermark left no trace");
        assert_eq!(stamped.dimensions(), page.dimensions());
    }

    #[test]
    fn spacing_scales_with_page_dimensions() {
        let small = tile_spacing(400, 300, (100, 100));
        let large = tile_spacing(4000, 3000, (100, 100));
        assert!(large.0 > small.0);
        assert!(large.1 > small.1);
    }
}

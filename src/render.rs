//! Overlay of the latest detection result onto captured frames.

use ab_glyph::{FontVec, PxScale};
use anyhow::{anyhow, Context, Result};
use image::Rgb;
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::{Path, PathBuf};

use crate::detect::DetectionResult;
use crate::frame::{CropRegion, Frame};

/// Box and caption colour.
pub const OVERLAY_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

const CAPTION_SCALE: f32 = 18.0;
/// Pixels between the bottom of a caption and the top edge of its box.
const CAPTION_GAP: i32 = 2;

/// Fonts tried, in order, when no caption font is configured.
const SYSTEM_FONT_PATHS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// Load a TrueType/OpenType font for captions.
pub fn load_font(path: &Path) -> Result<FontVec> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read font file {}", path.display()))?;
    FontVec::try_from_vec(bytes).map_err(|_| anyhow!("invalid font file {}", path.display()))
}

/// First readable font from the usual system locations.
pub fn find_system_font() -> Option<(PathBuf, FontVec)> {
    SYSTEM_FONT_PATHS.iter().find_map(|candidate| {
        let path = PathBuf::from(candidate);
        load_font(&path).ok().map(|font| (path, font))
    })
}

/// Draws boxes and `label confidence` captions.
pub struct Renderer {
    font: Option<FontVec>,
    color: Rgb<u8>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Renderer {
    /// Without a font, only boxes are drawn.
    pub fn new(font: Option<FontVec>) -> Self {
        Self {
            font,
            color: OVERLAY_COLOR,
        }
    }

    /// Use `font_path` when given, else a system font, else no captions.
    pub fn from_font_path(font_path: Option<&Path>) -> Result<Self> {
        let font = match font_path {
            Some(path) => {
                let font = load_font(path)?;
                log::info!("caption font: {}", path.display());
                Some(font)
            }
            None => match find_system_font() {
                Some((path, font)) => {
                    log::info!("caption font: {}", path.display());
                    Some(font)
                }
                None => {
                    log::warn!("no caption font found; drawing boxes without labels");
                    None
                }
            },
        };
        Ok(Self::new(font))
    }

    pub fn has_captions(&self) -> bool {
        self.font.is_some()
    }

    /// Draw `result` onto `frame`. `region` is the square the detector was shown.
    pub fn render(&self, frame: &mut Frame, result: &DetectionResult, region: &CropRegion) {
        let (width, height) = (frame.width(), frame.height());
        let canvas = frame.image_mut();
        for detection in result.iter() {
            if !detection.has_finite_box() {
                log::debug!("skipping detection with non-finite box: {:?}", detection);
                continue;
            }
            let px = detection
                .to_pixels(region)
                .normalized()
                .clamped_to(width, height);
            // Both corners are inclusive.
            let rect = Rect::at(px.left, px.top).of_size(
                px.width().saturating_add(1),
                px.height().saturating_add(1),
            );
            draw_hollow_rect_mut(canvas, rect, self.color);

            if let Some(font) = &self.font {
                let caption_top = px
                    .top
                    .saturating_sub(CAPTION_GAP)
                    .saturating_sub(CAPTION_SCALE as i32);
                draw_text_mut(
                    canvas,
                    self.color,
                    px.left,
                    caption_top,
                    PxScale::from(CAPTION_SCALE),
                    font,
                    &detection.caption(),
                );
            }
        }
    }
}

//! In-memory frames and the square region shown to the detector.
//!
//! - `Frame`: RGB8 raster owned by one loop iteration.
//! - `CropRegion`: square crop used by both the encoder and the renderer, so
//!   normalized detector coordinates map back onto the same pixels.

use anyhow::{anyhow, Result};
use image::RgbImage;

/// Default side of the square region cropped for detection.
pub const DEFAULT_REGION_SIZE: u32 = 1080;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One captured RGB frame.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    /// Capture sequence number assigned by the source (1-based).
    pub sequence: u64,
}

impl Frame {
    /// Wrap packed RGB8 pixels. Fails when the buffer does not match the dimensions.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>, sequence: u64) -> Result<Self> {
        let expected = (width as usize) * (height as usize) * 3;
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame buffer has {} bytes, expected {} for {}x{} rgb",
                pixels.len(),
                expected,
                width,
                height
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("frame buffer does not fit {}x{}", width, height))?;
        Ok(Self { image, sequence })
    }

    pub fn from_image(image: RgbImage, sequence: u64) -> Self {
        Self { image, sequence }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// True when the frame has no pixels (decoders occasionally hand these out).
    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }
}

// ----------------------------------------------------------------------------
// CropRegion
// ----------------------------------------------------------------------------

/// Square region of a frame that the detector is shown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub size: u32,
}

impl CropRegion {
    /// Region anchored at the top-left corner, shrunk to fit the frame.
    pub fn for_frame(width: u32, height: u32, max_size: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            size: max_size.min(width).min(height),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Map a normalized box onto frame pixels. Fractions are truncated toward zero.
    ///
    /// Edges are first clamped to `[-1, 2]` so a box can reach at most one
    /// region-width outside the region on either side.
    pub fn to_pixels(&self, left: f32, top: f32, right: f32, bottom: f32) -> PixelBox {
        let side = self.size as f32;
        let edge = |origin: u32, value: f32| {
            let value = if value.is_nan() {
                0.0
            } else {
                value.clamp(NORMALIZED_MIN, NORMALIZED_MAX)
            };
            origin as i32 + (value * side) as i32
        };
        PixelBox {
            left: edge(self.x, left),
            top: edge(self.y, top),
            right: edge(self.x, right),
            bottom: edge(self.y, bottom),
        }
    }
}

const NORMALIZED_MIN: f32 = -1.0;
const NORMALIZED_MAX: f32 = 2.0;

/// Bounding box in frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelBox {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl PixelBox {
    /// Reorders inverted edges so `left <= right` and `top <= bottom`.
    pub fn normalized(self) -> Self {
        Self {
            left: self.left.min(self.right),
            top: self.top.min(self.bottom),
            right: self.left.max(self.right),
            bottom: self.top.max(self.bottom),
        }
    }

    /// Pull edges in to at most one pixel outside a `width` x `height` frame.
    ///
    /// Edges that lie off the frame stay off the frame, so nothing extra is
    /// drawn, but the box never spans more than the frame plus a border.
    pub fn clamped_to(self, width: u32, height: u32) -> Self {
        let max_x = i32::try_from(width).unwrap_or(i32::MAX);
        let max_y = i32::try_from(height).unwrap_or(i32::MAX);
        Self {
            left: self.left.clamp(-1, max_x),
            top: self.top.clamp(-1, max_y),
            right: self.right.clamp(-1, max_x),
            bottom: self.bottom.clamp(-1, max_y),
        }
    }

    pub fn width(&self) -> u32 {
        self.right.abs_diff(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.abs_diff(self.top)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

//! Detector payload encoding.
//!
//! Crops the square `CropRegion` from the top-left of the frame, resizes it to
//! the detector's input size with nearest-neighbour sampling, and encodes it.

use anyhow::{anyhow, Context, Result};
use image::codecs::bmp::BmpEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::ExtendedColorType;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

use crate::frame::{CropRegion, Frame, DEFAULT_REGION_SIZE};

/// Default side of the square image sent to the detector.
pub const DEFAULT_DETECT_SIZE: u32 = 300;

const PAYLOAD_JPEG_QUALITY: u8 = 90;

/// Image container used for the detector payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// Uncompressed; cheap to encode, larger on the wire.
    #[default]
    Bmp,
    Jpeg,
}

impl FromStr for PayloadFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "bmp" => Ok(Self::Bmp),
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            other => Err(anyhow!(
                "unknown payload format '{}'; expected bmp or jpeg",
                other
            )),
        }
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bmp => write!(f, "bmp"),
            Self::Jpeg => write!(f, "jpeg"),
        }
    }
}

/// Encoded detector input and the region it was cut from.
pub struct EncodedPayload {
    pub data: Vec<u8>,
    pub region: CropRegion,
}

/// Downscaler/encoder for detector payloads.
#[derive(Clone, Debug)]
pub struct DetectEncoder {
    region_size: u32,
    detect_size: u32,
    format: PayloadFormat,
}

impl Default for DetectEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_REGION_SIZE, DEFAULT_DETECT_SIZE, PayloadFormat::Bmp)
    }
}

impl DetectEncoder {
    pub fn new(region_size: u32, detect_size: u32, format: PayloadFormat) -> Self {
        Self {
            region_size,
            detect_size,
            format,
        }
    }

    /// Region of `frame` this encoder would send.
    pub fn region_for(&self, frame: &Frame) -> CropRegion {
        CropRegion::for_frame(frame.width(), frame.height(), self.region_size)
    }

    pub fn encode(&self, frame: &Frame) -> Result<EncodedPayload> {
        let region = self.region_for(frame);
        if region.is_empty() || self.detect_size == 0 {
            return Err(anyhow!(
                "nothing to encode for {}x{} frame",
                frame.width(),
                frame.height()
            ));
        }

        let cropped =
            imageops::crop_imm(frame.image(), region.x, region.y, region.size, region.size)
                .to_image();
        let resized = imageops::resize(
            &cropped,
            self.detect_size,
            self.detect_size,
            FilterType::Nearest,
        );

        let mut data = Vec::new();
        match self.format {
            PayloadFormat::Bmp => BmpEncoder::new(&mut data)
                .encode(
                    resized.as_raw(),
                    resized.width(),
                    resized.height(),
                    ExtendedColorType::Rgb8,
                )
                .context("encode bmp payload")?,
            PayloadFormat::Jpeg => JpegEncoder::new_with_quality(&mut data, PAYLOAD_JPEG_QUALITY)
                .encode_image(&resized)
                .context("encode jpeg payload")?,
        }
        Ok(EncodedPayload { data, region })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb, RgbImage};

    fn frame(width: u32, height: u32) -> Frame {
        let image = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 64])
        });
        Frame::from_image(image, 1)
    }

    #[test]
    fn bmp_payload_is_detect_sized() {
        let encoder = DetectEncoder::default();
        let payload = encoder.encode(&frame(1920, 1080)).unwrap();
        assert_eq!(payload.region, CropRegion { x: 0, y: 0, size: 1080 });
        assert_eq!(&payload.data[..2], b"BM");

        let decoded = image::load_from_memory(&payload.data).unwrap();
        assert_eq!(decoded.dimensions(), (300, 300));
    }

    #[test]
    fn small_frames_shrink_the_region() {
        let encoder = DetectEncoder::new(1080, 128, PayloadFormat::Jpeg);
        let payload = encoder.encode(&frame(320, 240)).unwrap();
        assert_eq!(payload.region.size, 240);
        assert_eq!(&payload.data[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn empty_frame_fails_to_encode() {
        let encoder = DetectEncoder::default();
        let empty = Frame::from_image(RgbImage::new(0, 0), 1);
        assert!(encoder.encode(&empty).is_err());
    }

    #[test]
    fn payload_format_parses() {
        assert_eq!("BMP".parse::<PayloadFormat>().unwrap(), PayloadFormat::Bmp);
        assert_eq!("jpg".parse::<PayloadFormat>().unwrap(), PayloadFormat::Jpeg);
        assert!("webp".parse::<PayloadFormat>().is_err());
    }
}

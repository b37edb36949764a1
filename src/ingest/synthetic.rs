//! Synthetic frame source (`stub://`).
//!
//! `stub://name?frames=N&width=W&height=H&fps=F`. Without `frames` the source
//! never ends. Frames are a moving gradient so the published stream visibly
//! changes.

use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use std::time::Instant;
use url::Url;

use super::{frame_interval, FrameSource, SourceStats};
use crate::frame::Frame;

/// Settings parsed from a `stub://` location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticConfig {
    pub location: String,
    /// Frames to produce before end-of-input; `None` is unbounded.
    pub frames: Option<u64>,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            location: "stub://synthetic".to_string(),
            frames: None,
            width: 1920,
            height: 1080,
            target_fps: 10,
        }
    }
}

impl SyntheticConfig {
    pub fn parse(location: &str) -> Result<Self> {
        let url = Url::parse(location).with_context(|| format!("parse {}", location))?;
        if url.scheme() != "stub" {
            return Err(anyhow!("synthetic source needs a stub:// location"));
        }

        let mut config = Self {
            location: location.to_string(),
            ..Self::default()
        };
        for (key, value) in url.query_pairs() {
            let number = || {
                value
                    .parse::<u64>()
                    .with_context(|| format!("stub parameter {}={} is not a number", key, value))
            };
            match &*key {
                "frames" => config.frames = Some(number()?),
                "width" => config.width = u32::try_from(number()?).context("width too large")?,
                "height" => config.height = u32::try_from(number()?).context("height too large")?,
                "fps" => config.target_fps = u32::try_from(number()?).context("fps too large")?,
                other => log::warn!("ignoring unknown stub parameter '{}'", other),
            }
        }
        Ok(config)
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            last_frame_at: None,
        }
    }

    fn generate(&self) -> RgbImage {
        let shift = self.frame_count as u32;
        RgbImage::from_fn(self.config.width, self.config.height, |x, y| {
            Rgb([
                (x.wrapping_add(shift) % 256) as u8,
                (y.wrapping_add(shift) % 256) as u8,
                ((x ^ y) % 256) as u8,
            ])
        })
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        log::info!(
            "SyntheticSource: {} ({}x{} @ {} fps)",
            self.config.location,
            self.config.width,
            self.config.height,
            self.config.target_fps
        );
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if let Some(limit) = self.config.frames {
            if self.frame_count >= limit {
                return Ok(None);
            }
        }

        if let Some(last) = self.last_frame_at {
            let interval = frame_interval(self.config.target_fps);
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(Some(Frame::from_image(self.generate(), self.frame_count)))
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.config.location.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_query_parameters() -> Result<()> {
        let config = SyntheticConfig::parse("stub://cam?frames=3&width=64&height=48&fps=0")?;
        assert_eq!(config.frames, Some(3));
        assert_eq!((config.width, config.height), (64, 48));
        assert_eq!(config.target_fps, 0);

        let defaults = SyntheticConfig::parse("stub://cam")?;
        assert_eq!(defaults.frames, None);
        assert_eq!((defaults.width, defaults.height), (1920, 1080));
        Ok(())
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(SyntheticConfig::parse("stub://cam?frames=lots").is_err());
        assert!(SyntheticConfig::parse("http://cam").is_err());
    }

    #[test]
    fn ends_after_frame_limit() -> Result<()> {
        let mut source = SyntheticSource::new(SyntheticConfig::parse(
            "stub://cam?frames=2&width=16&height=8&fps=0",
        )?);
        source.connect()?;

        let first = source.read()?.expect("first frame");
        assert_eq!((first.width(), first.height()), (16, 8));
        assert_eq!(first.sequence, 1);
        let second = source.read()?.expect("second frame");
        assert_eq!(second.sequence, 2);
        assert_ne!(first.image().as_raw(), second.image().as_raw());

        assert!(source.read()?.is_none());
        assert_eq!(source.stats().frames_captured, 2);
        Ok(())
    }
}

//! Frame sources.
//!
//! - `stub://` synthetic frames (tests, demos)
//! - local image files or directories of images
//! - HTTP MJPEG streams and JPEG snapshot URLs
//! - RTSP cameras through GStreamer (feature: rtsp-gstreamer)
//!
//! Every source yields owned `Frame`s. `Ok(None)` from `read` means the input
//! is exhausted; the relay treats it as a clean end of the run.

use anyhow::{bail, Result};
use std::time::Duration;

use crate::frame::Frame;

pub mod file;
pub mod mjpeg;
#[cfg(feature = "rtsp-gstreamer")]
pub mod rtsp;
pub mod synthetic;

pub use file::{FileConfig, FileSource};
pub use mjpeg::{HttpConfig, HttpSource};
#[cfg(feature = "rtsp-gstreamer")]
pub use rtsp::{RtspConfig, RtspSource};
pub use synthetic::{SyntheticConfig, SyntheticSource};

/// A producer of captured frames.
pub trait FrameSource: Send {
    /// Open the underlying device or stream. Called once before the first `read`.
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    /// Block until the next frame is available.
    fn read(&mut self) -> Result<Option<Frame>>;

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats;
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        (**self).read()
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }

    fn stats(&self) -> SourceStats {
        (**self).stats()
    }
}

/// Capture counters for health logging.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
}

/// Pick a source implementation from the location string given on the command line.
pub fn open_source(location: &str) -> Result<Box<dyn FrameSource>> {
    let location = location.trim();
    if location.is_empty() {
        bail!("frame source location is empty");
    }

    let scheme = location
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase());
    match scheme.as_deref() {
        Some("stub") => Ok(Box::new(SyntheticSource::new(SyntheticConfig::parse(
            location,
        )?))),
        Some("http") | Some("https") => Ok(Box::new(HttpSource::new(HttpConfig {
            url: location.to_string(),
            ..HttpConfig::default()
        }))),
        Some("rtsp") | Some("rtsps") => open_rtsp(location),
        Some("file") => Ok(Box::new(FileSource::new(FileConfig {
            path: location.trim_start_matches("file://").into(),
            ..FileConfig::default()
        })?)),
        Some(other) => bail!("unsupported frame source scheme '{}'", other),
        None => Ok(Box::new(FileSource::new(FileConfig {
            path: location.into(),
            ..FileConfig::default()
        })?)),
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn open_rtsp(location: &str) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(RtspSource::new(RtspConfig {
        url: location.to_string(),
        ..RtspConfig::default()
    })?))
}

#[cfg(not(feature = "rtsp-gstreamer"))]
fn open_rtsp(_location: &str) -> Result<Box<dyn FrameSource>> {
    bail!("RTSP requires the rtsp-gstreamer feature")
}

/// Minimum spacing between frames for a target rate; zero disables pacing.
pub(crate) fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}

/// How long a live source may go without a frame before it reports unhealthy.
pub(crate) fn health_grace(target_fps: u32) -> Duration {
    let base_ms = if target_fps == 0 {
        2_000
    } else {
        (1000 / target_fps).saturating_mul(6)
    };
    Duration::from_millis(base_ms.max(2_000) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_locations_open_synthetic_sources() -> Result<()> {
        let mut source = open_source("stub://cam?frames=1&width=8&height=8&fps=0")?;
        source.connect()?;
        assert!(source.read()?.is_some());
        assert!(source.read()?.is_none());
        Ok(())
    }

    #[test]
    fn unknown_schemes_are_rejected() {
        assert!(open_source("gopher://camera").is_err());
        assert!(open_source("   ").is_err());
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn rtsp_needs_its_feature() {
        assert!(open_source("rtsp://127.0.0.1:554/stream").is_err());
    }

    #[test]
    fn pacing_helpers() {
        assert_eq!(frame_interval(0), Duration::ZERO);
        assert_eq!(frame_interval(10), Duration::from_millis(100));
        assert_eq!(health_grace(0), Duration::from_secs(2));
        assert_eq!(health_grace(1), Duration::from_secs(6));
    }
}

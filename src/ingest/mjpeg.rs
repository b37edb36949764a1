//! HTTP frame source.
//!
//! Handles `multipart/x-mixed-replace` MJPEG streams (IP cameras, another
//! relay) and plain JPEG snapshot URLs, which are polled at `snapshot_fps`.
//! A multipart stream that closes is end-of-input.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::{Duration, Instant};

use super::{frame_interval, health_grace, FrameSource, SourceStats};
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
/// Give up once this many images in a row fail to decode.
const MAX_UNDECODABLE_IN_A_ROW: u32 = 50;

/// Configuration for an HTTP source.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub url: String,
    /// Poll rate for snapshot URLs. MJPEG streams are read as fast as they arrive.
    pub snapshot_fps: u32,
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:81/stream".to_string(),
            snapshot_fps: 10,
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct HttpSource {
    config: HttpConfig,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    frame_count: u64,
}

enum HttpStream {
    Mjpeg(MjpegReader),
    Snapshot,
}

impl HttpSource {
    pub fn new(config: HttpConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.timeout)
            .timeout_read(config.timeout)
            .build();
        Self {
            config,
            agent,
            stream: None,
            last_frame_at: None,
            connected_at: None,
            frame_count: 0,
        }
    }

    fn fetch_snapshot(&self) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(&self.config.url)
            .call()
            .with_context(|| format!("fetch jpeg snapshot from {}", self.config.url))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES as u64)
            .read_to_end(&mut bytes)
            .context("read jpeg snapshot")?;
        if bytes.is_empty() {
            return Err(anyhow!("empty jpeg snapshot"));
        }
        Ok(bytes)
    }
}

impl FrameSource for HttpSource {
    fn connect(&mut self) -> Result<()> {
        let response = self
            .agent
            .get(&self.config.url)
            .call()
            .with_context(|| format!("connect to http stream {}", self.config.url))?;
        let content_type = response.header("Content-Type").unwrap_or("");
        self.stream = if content_type.to_lowercase().contains("multipart") {
            Some(HttpStream::Mjpeg(MjpegReader::new(response.into_reader())))
        } else {
            Some(HttpStream::Snapshot)
        };
        self.connected_at = Some(Instant::now());
        log::info!("HttpSource: connected to {}", self.config.url);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        let mut undecodable = 0u32;
        loop {
            let jpeg_bytes = match self.stream.as_mut() {
                None => return Err(anyhow!("http source not connected; call connect() first")),
                Some(HttpStream::Mjpeg(reader)) => match reader.read_next_jpeg()? {
                    Some(bytes) => bytes,
                    None => return Ok(None),
                },
                Some(HttpStream::Snapshot) => {
                    if let Some(last) = self.last_frame_at {
                        let interval = frame_interval(self.config.snapshot_fps);
                        let elapsed = last.elapsed();
                        if elapsed < interval {
                            std::thread::sleep(interval - elapsed);
                        }
                    }
                    self.fetch_snapshot()?
                }
            };

            // A corrupt image costs one frame; only transport errors end the source.
            let image = match image::load_from_memory(&jpeg_bytes) {
                Ok(image) => image.into_rgb8(),
                Err(err) => {
                    undecodable += 1;
                    if undecodable >= MAX_UNDECODABLE_IN_A_ROW {
                        return Err(anyhow!(
                            "{} consecutive jpeg frames failed to decode: {}",
                            undecodable,
                            err
                        ));
                    }
                    log::warn!(
                        "HttpSource: skipping undecodable jpeg ({} bytes): {}",
                        jpeg_bytes.len(),
                        err
                    );
                    if matches!(self.stream, Some(HttpStream::Snapshot)) {
                        self.last_frame_at = Some(Instant::now());
                    }
                    continue;
                }
            };
            self.frame_count += 1;
            self.last_frame_at = Some(Instant::now());
            return Ok(Some(Frame::from_image(image, self.frame_count)));
        }
    }

    fn is_healthy(&self) -> bool {
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= Duration::from_secs(5);
        };
        last_frame_at.elapsed() <= health_grace(self.config.snapshot_fps)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.config.url.clone(),
        }
    }
}

/// Splits a multipart MJPEG body into JPEG images by scanning for SOI/EOI markers.
pub(crate) struct MjpegReader {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegReader {
    pub(crate) fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    /// Next complete JPEG, or `None` once the stream has closed.
    pub(crate) fn read_next_jpeg(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let jpeg = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(Some(jpeg));
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

/// Bounds of the first complete JPEG, matching SOI/EOI pairs so an embedded
/// EXIF/JFIF thumbnail does not end the outer image early.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let mut depth = 1usize;
    let mut i = start + 2;
    while i + 1 < buffer.len() {
        match (buffer[i], buffer[i + 1]) {
            (0xFF, 0xD8) => {
                depth += 1;
                i += 2;
            }
            (0xFF, 0xD9) => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return Some((start, i));
                }
            }
            _ => i += 1,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::RgbImage;
    use std::io::Cursor;

    fn tiny_jpeg() -> Vec<u8> {
        let mut out = Vec::new();
        JpegEncoder::new(&mut out)
            .encode_image(&RgbImage::new(8, 8))
            .unwrap();
        out
    }

    /// `outer` with `thumb` embedded in an APP1 segment right after SOI.
    fn with_thumbnail(outer: &[u8], thumb: &[u8]) -> Vec<u8> {
        let mut payload = b"Exif\0\0".to_vec();
        payload.extend_from_slice(thumb);
        let length = u16::try_from(payload.len() + 2).unwrap();

        let mut out = outer[..2].to_vec();
        out.extend_from_slice(&[0xFF, 0xE1]);
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(&payload);
        out.extend_from_slice(&outer[2..]);
        out
    }

    fn multipart(parts: &[&[u8]]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(b"--MJPEGBOUNDARY\r\nContent-Type: image/jpeg\r\n\r\n");
            body.extend_from_slice(part);
            body.extend_from_slice(b"\r\n");
        }
        body
    }

    fn mjpeg_source(body: Vec<u8>) -> HttpSource {
        let mut source = HttpSource::new(HttpConfig::default());
        source.stream = Some(HttpStream::Mjpeg(MjpegReader::new(Box::new(Cursor::new(
            body,
        )))));
        source.connected_at = Some(Instant::now());
        source
    }

    #[test]
    fn finds_marker_bounds() {
        let buffer = [0x00, 0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9, 0x03];
        assert_eq!(find_jpeg_bounds(&buffer), Some((1, 7)));
        assert_eq!(find_jpeg_bounds(&[0xFF, 0xD8, 0x01]), None);
        assert_eq!(find_jpeg_bounds(&[]), None);
    }

    #[test]
    fn nested_markers_extend_to_the_outer_eoi() {
        let buffer = [
            0xFF, 0xD8, 0x01, 0xFF, 0xD8, 0x02, 0xFF, 0xD9, 0x03, 0xFF, 0xD9, 0x04,
        ];
        assert_eq!(find_jpeg_bounds(&buffer), Some((0, 11)));
        assert_eq!(find_jpeg_bounds(&buffer[..9]), None);
    }

    #[test]
    fn embedded_thumbnail_keeps_the_full_frame() -> Result<()> {
        let thumb = {
            let mut out = Vec::new();
            JpegEncoder::new(&mut out).encode_image(&RgbImage::new(4, 4))?;
            out
        };
        let outer = {
            let mut out = Vec::new();
            JpegEncoder::new(&mut out).encode_image(&RgbImage::new(16, 16))?;
            out
        };
        let camera_jpeg = with_thumbnail(&outer, &thumb);

        let mut source = mjpeg_source(multipart(&[&camera_jpeg]));
        let frame = source.read()?.expect("frame with thumbnail");
        assert_eq!((frame.width(), frame.height()), (16, 16));
        assert!(source.read()?.is_none());
        Ok(())
    }

    #[test]
    fn undecodable_part_is_skipped() -> Result<()> {
        let jpeg = tiny_jpeg();
        let corrupt: &[u8] = &[0xFF, 0xD8, 0x00, 0x01, 0xFF, 0xD9];
        let mut source = mjpeg_source(multipart(&[corrupt, &jpeg]));

        let frame = source.read()?.expect("frame after corrupt part");
        assert_eq!(frame.sequence, 1);
        assert_eq!((frame.width(), frame.height()), (8, 8));
        assert!(source.read()?.is_none());
        assert_eq!(source.stats().frames_captured, 1);
        Ok(())
    }

    #[test]
    fn splits_multipart_body_and_reports_end() -> Result<()> {
        let jpeg = tiny_jpeg();
        let mut body = Vec::new();
        for _ in 0..2 {
            body.extend_from_slice(
                b"--MJPEGBOUNDARY\r\nContent-Type: image/jpeg\r\n\r\n",
            );
            body.extend_from_slice(&jpeg);
            body.extend_from_slice(b"\r\n");
        }

        let mut reader = MjpegReader::new(Box::new(Cursor::new(body)));
        assert_eq!(reader.read_next_jpeg()?.as_deref(), Some(jpeg.as_slice()));
        assert_eq!(reader.read_next_jpeg()?.as_deref(), Some(jpeg.as_slice()));
        assert!(reader.read_next_jpeg()?.is_none());
        Ok(())
    }

    #[test]
    fn read_before_connect_fails() {
        let mut source = HttpSource::new(HttpConfig::default());
        assert!(source.read().is_err());
        assert!(!source.is_healthy());
    }
}

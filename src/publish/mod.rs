//! Annotated frame output.
//!
//! `Publisher` is what the relay loop pushes every rendered frame into.
//! `MjpegPublisher` JPEG-encodes frames into an `MjpegStream`, a single
//! latest-frame slot that the HTTP server's viewer threads read from. Viewers
//! that fall behind skip frames; nothing is queued.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::frame::Frame;

pub mod server;

pub use server::{normalize_listen_addr, MjpegServer, MjpegServerHandle, MJPEG_BOUNDARY};

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Sink for rendered frames.
pub trait Publisher: Send {
    fn publish(&mut self, frame: &Frame) -> Result<()>;
}

impl<T: Publisher + ?Sized> Publisher for Box<T> {
    fn publish(&mut self, frame: &Frame) -> Result<()> {
        (**self).publish(frame)
    }
}

/// One published JPEG.
#[derive(Clone, Debug)]
pub struct JpegFrame {
    /// Increases by one per publish; starts at 1.
    pub sequence: u64,
    pub data: Arc<Vec<u8>>,
}

#[derive(Default)]
struct Slot {
    latest: Option<JpegFrame>,
}

/// Latest-frame slot shared between the publisher and viewer threads.
#[derive(Default)]
pub struct MjpegStream {
    slot: Mutex<Slot>,
    updated: Condvar,
}

impl MjpegStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the latest frame and wake waiting viewers.
    pub fn push(&self, jpeg: Vec<u8>) -> u64 {
        let mut slot = self.slot();
        let sequence = slot.latest.as_ref().map_or(1, |f| f.sequence + 1);
        slot.latest = Some(JpegFrame {
            sequence,
            data: Arc::new(jpeg),
        });
        drop(slot);
        self.updated.notify_all();
        sequence
    }

    pub fn latest(&self) -> Option<JpegFrame> {
        self.slot().latest.clone()
    }

    /// Wait up to `timeout` for a frame newer than `after`.
    pub fn wait_newer(&self, after: u64, timeout: Duration) -> Option<JpegFrame> {
        let slot = self.slot();
        let (slot, _) = self
            .updated
            .wait_timeout_while(slot, timeout, |slot| {
                slot.latest.as_ref().map_or(true, |f| f.sequence <= after)
            })
            .unwrap_or_else(PoisonError::into_inner);
        slot.latest.as_ref().filter(|f| f.sequence > after).cloned()
    }
}

/// JPEG-encodes frames into an `MjpegStream`.
pub struct MjpegPublisher {
    stream: Arc<MjpegStream>,
    quality: u8,
}

impl MjpegPublisher {
    pub fn new(stream: Arc<MjpegStream>, quality: u8) -> Self {
        Self { stream, quality }
    }

    pub fn stream(&self) -> &Arc<MjpegStream> {
        &self.stream
    }
}

impl Publisher for MjpegPublisher {
    fn publish(&mut self, frame: &Frame) -> Result<()> {
        let jpeg = encode_jpeg(frame, self.quality)?;
        self.stream.push(jpeg);
        Ok(())
    }
}

pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(frame.image())
        .with_context(|| {
            format!(
                "jpeg encode of {}x{} frame {}",
                frame.width(),
                frame.height(),
                frame.sequence
            )
        })?;
    Ok(out)
}

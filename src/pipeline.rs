//! The relay loop: capture, maybe detect, render, publish.
//!
//! Per frame:
//! 1. read from the source (end-of-input or a read error ends the run);
//! 2. if no request is in flight, encode the detector payload, claim the
//!    gate, send, and hand the response wait to a `detect-recv` thread;
//! 3. render the latest known result and publish, whether or not a request
//!    is outstanding.
//!
//! The loop never waits on the detector. A failed send returns immediately;
//! a failed receive is reported through the fatal channel and returned on the
//! next iteration.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::coordinator::PipelineCoordinator;
use crate::detect::{default_thresholds, DetectionClient, DetectionRequest, LabelThresholds};
use crate::encode::DetectEncoder;
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::publish::Publisher;
use crate::render::Renderer;

pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Detection side of the loop, as seen by the capture thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayState {
    /// No request outstanding; the next frame will be sent.
    Idle,
    /// A request is outstanding; frames are rendered and published only.
    Awaiting,
}

#[derive(Clone, Debug)]
pub struct RelaySettings {
    pub detector_name: String,
    pub thresholds: LabelThresholds,
    pub encoder: DetectEncoder,
    pub health_interval: Duration,
}

impl RelaySettings {
    pub fn new(detector_name: impl Into<String>) -> Self {
        Self {
            detector_name: detector_name.into(),
            thresholds: default_thresholds(),
            encoder: DetectEncoder::default(),
            health_interval: DEFAULT_HEALTH_INTERVAL,
        }
    }
}

/// Counters for one run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub frames_captured: u64,
    pub frames_skipped_empty: u64,
    pub frames_published: u64,
    pub detections_sent: u64,
    /// Frames that skipped detection because a request was in flight.
    pub skipped_busy: u64,
    pub encode_failures: u64,
    pub publish_failures: u64,
}

pub struct Relay<S, C: ?Sized, P> {
    source: S,
    client: Arc<C>,
    publisher: P,
    renderer: Renderer,
    settings: RelaySettings,
    coordinator: Arc<PipelineCoordinator>,
    fatal_tx: Sender<anyhow::Error>,
    fatal_rx: Receiver<anyhow::Error>,
    next_request_id: u64,
    stats: RelayStats,
}

impl<S, C, P> Relay<S, C, P>
where
    S: FrameSource,
    C: DetectionClient + ?Sized + 'static,
    P: Publisher,
{
    pub fn new(
        source: S,
        client: Arc<C>,
        publisher: P,
        renderer: Renderer,
        settings: RelaySettings,
    ) -> Self {
        let (fatal_tx, fatal_rx) = mpsc::channel();
        Self {
            source,
            client,
            publisher,
            renderer,
            settings,
            coordinator: Arc::new(PipelineCoordinator::new()),
            fatal_tx,
            fatal_rx,
            next_request_id: 1,
            stats: RelayStats::default(),
        }
    }

    /// Share an existing coordinator instead of a private one.
    pub fn with_coordinator(mut self, coordinator: Arc<PipelineCoordinator>) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn coordinator(&self) -> &Arc<PipelineCoordinator> {
        &self.coordinator
    }

    pub fn state(&self) -> RelayState {
        if self.coordinator.is_in_flight() {
            RelayState::Awaiting
        } else {
            RelayState::Idle
        }
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Run until end-of-input, a read error, `shutdown`, or a detector
    /// transport failure (returned as `Err`).
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<RelayStats> {
        let mut last_health_log = Instant::now();

        loop {
            if let Ok(err) = self.fatal_rx.try_recv() {
                return Err(err.context("detection stream failed"));
            }
            if shutdown.load(Ordering::SeqCst) {
                log::info!("shutdown requested");
                break;
            }

            let frame = match self.source.read() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    log::info!("frame source exhausted; stopping");
                    break;
                }
                Err(err) => {
                    log::error!("frame source failed: {:#}; stopping", err);
                    break;
                }
            };
            self.process_frame(frame)?;

            if last_health_log.elapsed() >= self.settings.health_interval {
                self.log_health();
                last_health_log = Instant::now();
            }
        }

        if self.state() == RelayState::Awaiting {
            log::debug!("stopping with a detection request still in flight");
        }
        log::info!(
            "relay stopped: captured={} published={} sent={} skipped_busy={}",
            self.stats.frames_captured,
            self.stats.frames_published,
            self.stats.detections_sent,
            self.stats.skipped_busy
        );
        Ok(self.stats)
    }

    fn process_frame(&mut self, mut frame: Frame) -> Result<()> {
        if frame.is_empty() {
            self.stats.frames_skipped_empty += 1;
            log::debug!("skipping empty frame {}", frame.sequence);
            return Ok(());
        }
        self.stats.frames_captured += 1;

        if self.state() == RelayState::Idle {
            self.start_detection(&frame)?;
        } else {
            self.stats.skipped_busy += 1;
        }

        let region = self.settings.encoder.region_for(&frame);
        let result = self.coordinator.snapshot_result();
        self.renderer.render(&mut frame, &result, &region);

        match self.publisher.publish(&frame) {
            Ok(()) => self.stats.frames_published += 1,
            Err(err) => {
                self.stats.publish_failures += 1;
                log::warn!("could not publish frame {}: {:#}", frame.sequence, err);
            }
        }
        Ok(())
    }

    /// Encode, claim the gate, send, and spawn the receive thread.
    fn start_detection(&mut self, frame: &Frame) -> Result<()> {
        let payload = match self.settings.encoder.encode(frame) {
            Ok(payload) => payload,
            Err(err) => {
                self.stats.encode_failures += 1;
                log::warn!("could not encode frame {}: {:#}", frame.sequence, err);
                return Ok(());
            }
        };

        if !self.coordinator.try_begin_detection() {
            self.stats.skipped_busy += 1;
            return Ok(());
        }

        let request = DetectionRequest {
            id: self.next_request_id,
            detector_name: self.settings.detector_name.clone(),
            thresholds: self.settings.thresholds.clone(),
            data: payload.data,
        };
        self.next_request_id += 1;
        self.client
            .send(request)
            .context("could not send detection request")?;
        self.stats.detections_sent += 1;

        let client = self.client.clone();
        let coordinator = self.coordinator.clone();
        let fatal_tx = self.fatal_tx.clone();
        std::thread::Builder::new()
            .name("detect-recv".to_string())
            .spawn(move || match client.receive() {
                Ok(result) => coordinator.complete_detection(result),
                Err(err) => {
                    log::error!("detection receive failed: {:#}", err);
                    // The loop may already be gone; nothing else to tell.
                    let _ = fatal_tx.send(err);
                }
            })
            .context("spawn detection receive thread")?;
        Ok(())
    }

    fn log_health(&self) {
        let source = self.source.stats();
        let gate = self.coordinator.stats();
        log::info!(
            "source health={} frames={} src={} | published={} sent={} completed={} skipped_busy={} detector={}",
            self.source.is_healthy(),
            source.frames_captured,
            source.source,
            self.stats.frames_published,
            gate.begun,
            gate.completed,
            self.stats.skipped_busy,
            self.client.endpoint()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DetectionResult;
    use crate::ingest::SourceStats;
    use std::sync::Mutex;

    struct CountingSource {
        remaining: u32,
        produced: u64,
    }

    impl FrameSource for CountingSource {
        fn read(&mut self) -> Result<Option<Frame>> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            self.produced += 1;
            Ok(Some(Frame::from_image(
                image::RgbImage::new(32, 32),
                self.produced,
            )))
        }

        fn stats(&self) -> SourceStats {
            SourceStats {
                frames_captured: self.produced,
                source: "counting".to_string(),
            }
        }
    }

    /// Never answers.
    struct SilentClient {
        sent: Mutex<Vec<u64>>,
    }

    impl DetectionClient for SilentClient {
        fn endpoint(&self) -> String {
            "silent".to_string()
        }

        fn send(&self, request: DetectionRequest) -> Result<()> {
            self.sent.lock().unwrap().push(request.id);
            Ok(())
        }

        fn receive(&self) -> Result<DetectionResult> {
            loop {
                std::thread::park();
            }
        }
    }

    struct NullPublisher(u64);

    impl Publisher for NullPublisher {
        fn publish(&mut self, _frame: &Frame) -> Result<()> {
            self.0 += 1;
            Ok(())
        }
    }

    #[test]
    fn stays_awaiting_without_a_response() -> Result<()> {
        let client = Arc::new(SilentClient {
            sent: Mutex::new(Vec::new()),
        });
        let mut relay = Relay::new(
            CountingSource {
                remaining: 5,
                produced: 0,
            },
            client.clone(),
            NullPublisher(0),
            Renderer::new(None),
            RelaySettings::new("default"),
        );
        assert_eq!(relay.state(), RelayState::Idle);

        let stats = relay.run(&AtomicBool::new(false))?;
        assert_eq!(relay.state(), RelayState::Awaiting);
        assert_eq!(stats.frames_captured, 5);
        assert_eq!(stats.frames_published, 5);
        assert_eq!(stats.detections_sent, 1);
        assert_eq!(stats.skipped_busy, 4);
        assert_eq!(*client.sent.lock().unwrap(), vec![1]);
        Ok(())
    }

    #[test]
    fn shutdown_flag_stops_before_reading() -> Result<()> {
        let mut relay = Relay::new(
            CountingSource {
                remaining: 5,
                produced: 0,
            },
            Arc::new(SilentClient {
                sent: Mutex::new(Vec::new()),
            }),
            NullPublisher(0),
            Renderer::new(None),
            RelaySettings::new("default"),
        );
        let stats = relay.run(&AtomicBool::new(true))?;
        assert_eq!(stats, RelayStats::default());
        Ok(())
    }
}

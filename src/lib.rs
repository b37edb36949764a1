//! Detection Relay
//!
//! Captures live frames, asks a remote object detector about a downsampled
//! copy of each frame, draws the most recent detections onto the
//! full-resolution frame, and republishes the result as MJPEG.
//!
//! # Architecture
//!
//! The capture loop is never blocked on the detector:
//!
//! 1. **Single in-flight request**: frames arriving while a request is
//!    outstanding skip detection instead of queueing.
//! 2. **Latest result wins**: each completed round-trip replaces the previous
//!    result wholesale; every frame is drawn with whatever is current.
//! 3. **Every frame is published**, whatever the detection latency.
//! 4. **Transport failure is terminal**: no reconnection.
//!
//! # Module Structure
//!
//! - `frame`: `Frame`, `CropRegion`, `PixelBox`
//! - `ingest`: frame sources (synthetic, files, HTTP MJPEG, RTSP)
//! - `encode`: detector payload crop/resize/encode
//! - `detect`: detection types, client trait, gRPC client
//! - `coordinator`: in-flight gate and shared latest result
//! - `render`: box and caption overlay
//! - `publish`: JPEG publisher and HTTP MJPEG server
//! - `pipeline`: the relay loop
//! - `config`: layered configuration

pub mod config;
pub mod coordinator;
pub mod detect;
pub mod encode;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod publish;
pub mod render;

pub use config::{ConfigOverrides, RelayConfig};
pub use coordinator::{CoordinatorStats, PipelineCoordinator};
pub use detect::{
    Detection, DetectionClient, DetectionRequest, DetectionResult, GrpcDetectionClient,
    GrpcSettings, LabelThresholds,
};
pub use encode::{DetectEncoder, EncodedPayload, PayloadFormat};
pub use frame::{CropRegion, Frame, PixelBox};
pub use ingest::{open_source, FrameSource, SourceStats};
pub use pipeline::{Relay, RelaySettings, RelayState, RelayStats};
pub use publish::{MjpegPublisher, MjpegServer, MjpegServerHandle, MjpegStream, Publisher};
pub use render::Renderer;

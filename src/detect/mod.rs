//! Remote object detection.
//!
//! - `result`: requests, detections and results as the relay sees them
//! - `client`: the send/receive contract the pipeline drives
//! - `grpc`: DOODS `odrpc` bidirectional-stream implementation
//! - `wire`: protobuf messages for that service

mod client;
pub mod grpc;
mod result;
pub mod wire;

pub use client::DetectionClient;
pub use grpc::{GrpcDetectionClient, GrpcSettings};
pub use result::{
    default_thresholds, Detection, DetectionRequest, DetectionResult, LabelThresholds,
    DEFAULT_MIN_CONFIDENCE, WILDCARD_LABEL,
};

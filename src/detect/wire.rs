//! Wire messages for the DOODS `odrpc` detection service.
//!
//! Hand-maintained prost definitions mirroring `odrpc.proto`; only the
//! messages used by `DetectStream` are declared.

use std::collections::HashMap;

use crate::detect::result::{Detection, DetectionRequest, DetectionResult};

/// Fully-qualified path of the bidirectional streaming method.
pub const DETECT_STREAM_PATH: &str = "/odrpc.odrpc/DetectStream";

#[derive(Clone, PartialEq, prost::Message)]
pub struct DetectRequest {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub detector_name: String,
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
    #[prost(string, tag = "4")]
    pub file: String,
    #[prost(map = "string, float", tag = "5")]
    pub detect: HashMap<String, f32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireDetection {
    #[prost(float, tag = "1")]
    pub top: f32,
    #[prost(float, tag = "2")]
    pub left: f32,
    #[prost(float, tag = "3")]
    pub bottom: f32,
    #[prost(float, tag = "4")]
    pub right: f32,
    #[prost(string, tag = "5")]
    pub label: String,
    #[prost(float, tag = "6")]
    pub confidence: f32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DetectResponse {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(message, repeated, tag = "2")]
    pub detections: Vec<WireDetection>,
    #[prost(string, tag = "3")]
    pub error: String,
}

impl From<DetectionRequest> for DetectRequest {
    fn from(request: DetectionRequest) -> Self {
        Self {
            id: request.id.to_string(),
            detector_name: request.detector_name,
            data: request.data,
            file: String::new(),
            detect: request.thresholds.into_iter().collect(),
        }
    }
}

impl From<WireDetection> for Detection {
    fn from(wire: WireDetection) -> Self {
        Self {
            label: wire.label,
            confidence: wire.confidence,
            left: wire.left,
            top: wire.top,
            right: wire.right,
            bottom: wire.bottom,
        }
    }
}

impl DetectResponse {
    /// Detections in response order.
    pub fn into_result(self) -> DetectionResult {
        DetectionResult::new(self.detections.into_iter().map(Detection::from).collect())
    }
}

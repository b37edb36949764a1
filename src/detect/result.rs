use std::collections::BTreeMap;

use crate::frame::{CropRegion, PixelBox};

/// Label pattern that matches every label on the detector side.
pub const WILDCARD_LABEL: &str = "*";

/// Default minimum confidence (percent) applied to the wildcard pattern.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 60.0;

/// One object located by the detector.
///
/// Box edges are fractions of the square region the detector was shown.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub label: String,
    /// Confidence on the detector's 0..100 scale.
    pub confidence: f32,
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Detection {
    pub fn to_pixels(&self, region: &CropRegion) -> PixelBox {
        region.to_pixels(self.left, self.top, self.right, self.bottom)
    }

    /// False when any edge is NaN or infinite.
    pub fn has_finite_box(&self) -> bool {
        [self.left, self.top, self.right, self.bottom]
            .iter()
            .all(|edge| edge.is_finite())
    }

    /// Caption drawn next to the box, e.g. `person 87`.
    pub fn caption(&self) -> String {
        format!("{} {:.0}", self.label, self.confidence)
    }
}

/// Detections from one completed round-trip, in response order.
///
/// A new result replaces the previous one wholesale.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Detection> {
        self.detections.iter()
    }
}

/// Per-label minimum confidence percentages sent with every request.
pub type LabelThresholds = BTreeMap<String, f32>;

pub fn default_thresholds() -> LabelThresholds {
    let mut thresholds = LabelThresholds::new();
    thresholds.insert(WILDCARD_LABEL.to_string(), DEFAULT_MIN_CONFIDENCE);
    thresholds
}

/// One request to the detector. Built fresh per accepted send.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionRequest {
    /// Relay-local request id, echoed back by the detector.
    pub id: u64,
    pub detector_name: String,
    pub thresholds: LabelThresholds,
    /// Encoded image payload (BMP or JPEG).
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caption_rounds_confidence() {
        let detection = Detection {
            label: "person".to_string(),
            confidence: 87.6,
            left: 0.0,
            top: 0.0,
            right: 1.0,
            bottom: 1.0,
        };
        assert_eq!(detection.caption(), "person 88");
    }

    #[test]
    fn wildcard_is_the_only_default_threshold() {
        let thresholds = default_thresholds();
        assert_eq!(thresholds.len(), 1);
        assert_eq!(thresholds[WILDCARD_LABEL], DEFAULT_MIN_CONFIDENCE);
    }
}

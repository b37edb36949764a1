use anyhow::Result;

use crate::detect::result::{DetectionRequest, DetectionResult};

/// Long-lived request/response stream to a remote detector.
///
/// The capture loop calls `send`; a separate receive task calls `receive`.
/// Callers keep at most one request outstanding, so responses arrive in send
/// order. Any error from either side is a transport failure and is fatal.
pub trait DetectionClient: Send + Sync {
    /// Human-readable endpoint, for logs.
    fn endpoint(&self) -> String;

    /// Write one request onto the open stream.
    fn send(&self, request: DetectionRequest) -> Result<()>;

    /// Block until the next response arrives or the stream ends.
    fn receive(&self) -> Result<DetectionResult>;
}

//! Detection gate and result hand-off.
//!
//! `PipelineCoordinator` owns the only state shared between the capture loop
//! and the detection receive task:
//!
//! - the in-flight flag, which caps outstanding detection requests at one;
//! - the latest completed `DetectionResult`, read by the render path.
//!
//! Every operation takes the same mutex for its whole body and never blocks
//! while holding it. The flag goes false→true only in `try_begin_detection`
//! and true→false only in `complete_detection`.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::detect::DetectionResult;

#[derive(Debug, Default)]
struct PipelineState {
    in_flight: bool,
    result: DetectionResult,
    stats: CoordinatorStats,
}

/// Gate counters, for health logging.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Requests admitted by `try_begin_detection`.
    pub begun: u64,
    /// Results installed by `complete_detection`.
    pub completed: u64,
    /// Calls to `try_begin_detection` refused because a request was in flight.
    pub rejected: u64,
}

/// Mediates between the capture loop (producer) and the receive task (consumer).
#[derive(Debug, Default)]
pub struct PipelineCoordinator {
    state: Mutex<PipelineState>,
}

impl PipelineCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, PipelineState> {
        // Each critical section writes whole fields; a poisoned guard is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the single detection slot. Non-blocking.
    ///
    /// Returns `false` when a request is already outstanding; the caller must
    /// then skip detection for its frame.
    pub fn try_begin_detection(&self) -> bool {
        let mut state = self.state();
        if state.in_flight {
            state.stats.rejected += 1;
            return false;
        }
        state.in_flight = true;
        state.stats.begun += 1;
        true
    }

    /// Install a completed result and release the slot.
    pub fn complete_detection(&self, result: DetectionResult) {
        let mut state = self.state();
        if !state.in_flight {
            log::warn!("detection result arrived with no request in flight");
        }
        state.result = result;
        state.in_flight = false;
        state.stats.completed += 1;
    }

    /// Copy of the latest completed result.
    pub fn snapshot_result(&self) -> DetectionResult {
        self.state().result.clone()
    }

    /// Read-only peek at the flag, so callers can skip work that only matters
    /// when the slot is free.
    pub fn is_in_flight(&self) -> bool {
        self.state().in_flight
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.state().stats
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Detection;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    fn result_with(labels: &[&str]) -> DetectionResult {
        DetectionResult::new(
            labels
                .iter()
                .map(|label| Detection {
                    label: label.to_string(),
                    confidence: 80.0,
                    left: 0.1,
                    top: 0.1,
                    right: 0.2,
                    bottom: 0.2,
                })
                .collect(),
        )
    }

    #[test]
    fn second_begin_is_refused_until_completion() {
        let coordinator = PipelineCoordinator::new();
        assert!(!coordinator.is_in_flight());

        assert!(coordinator.try_begin_detection());
        assert!(coordinator.is_in_flight());
        assert!(!coordinator.try_begin_detection());
        assert!(!coordinator.try_begin_detection());

        coordinator.complete_detection(DetectionResult::default());
        assert!(!coordinator.is_in_flight());
        assert!(coordinator.try_begin_detection());

        let stats = coordinator.stats();
        assert_eq!(stats.begun, 2);
        assert_eq!(stats.rejected, 2);
        assert_eq!(stats.completed, 1);
    }

    #[test]
    fn completion_replaces_result_wholesale() {
        let coordinator = PipelineCoordinator::new();
        assert!(coordinator.snapshot_result().is_empty());

        assert!(coordinator.try_begin_detection());
        coordinator.complete_detection(result_with(&["person", "dog"]));
        assert_eq!(coordinator.snapshot_result().len(), 2);

        assert!(coordinator.try_begin_detection());
        coordinator.complete_detection(result_with(&["car"]));
        let snapshot = coordinator.snapshot_result();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.detections[0].label, "car");

        assert!(coordinator.try_begin_detection());
        coordinator.complete_detection(DetectionResult::default());
        assert!(coordinator.snapshot_result().is_empty());
    }

    #[test]
    fn snapshot_is_a_copy() {
        let coordinator = PipelineCoordinator::new();
        assert!(coordinator.try_begin_detection());
        coordinator.complete_detection(result_with(&["person"]));

        let mut snapshot = coordinator.snapshot_result();
        snapshot.detections.clear();
        assert_eq!(coordinator.snapshot_result().len(), 1);
    }

    #[test]
    fn concurrent_begins_admit_exactly_one() {
        let coordinator = Arc::new(PipelineCoordinator::new());
        let admitted = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = coordinator.clone();
                let admitted = admitted.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    if coordinator.try_begin_detection() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.stats().rejected, 7);
    }

    #[test]
    fn readers_never_observe_partial_results() {
        let coordinator = Arc::new(PipelineCoordinator::new());
        let writer = {
            let coordinator = coordinator.clone();
            std::thread::spawn(move || {
                for round in 0..500 {
                    assert!(coordinator.try_begin_detection());
                    let labels: Vec<&str> = if round % 2 == 0 {
                        vec!["a"; 16]
                    } else {
                        Vec::new()
                    };
                    coordinator.complete_detection(result_with(&labels));
                }
            })
        };

        for _ in 0..2000 {
            let len = coordinator.snapshot_result().len();
            assert!(len == 0 || len == 16, "observed torn result of {}", len);
        }
        writer.join().unwrap();
    }
}

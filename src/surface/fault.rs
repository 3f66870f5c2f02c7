//! Silent-failure detection.
//!
//! The panel gives no error when a write is dropped; the only symptom is a
//! refresh that returns far sooner than the physics allow.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspectedFault {
    pub expected: Duration,
    pub reason: String,
}

pub trait FaultDetector: Send + Sync {
    /// Inspect a render that reported completion.
    fn assess(&self, elapsed: Duration) -> Option<SuspectedFault>;
}

/// Flags completed renders that finished faster than `threshold`.
#[derive(Debug, Clone, Copy)]
pub struct TimingHeuristic {
    pub threshold: Duration,
}

impl TimingHeuristic {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }
}

impl Default for TimingHeuristic {
    fn default() -> Self {
        Self::new(Duration::from_secs(12))
    }
}

impl FaultDetector for TimingHeuristic {
    fn assess(&self, elapsed: Duration) -> Option<SuspectedFault> {
        (elapsed < self.threshold).then(|| SuspectedFault {
            expected: self.threshold,
            reason: format!(
                "render finished in {:.2}s, expected at least {:.2}s",
                elapsed.as_secs_f64(),
                self.threshold.as_secs_f64()
            ),
        })
    }
}

/// Trusts every completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFaultDetection;

impl FaultDetector for NoFaultDetection {
    fn assess(&self, _elapsed: Duration) -> Option<SuspectedFault> {
        None
    }
}

//! Render health reporting.
//!
//! Every concluded render reports good or bad. `HealthLedger` keeps the most
//! recent report and running counters for the status API; acting on a bad
//! report is left to whatever polls it.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Good,
    Bad,
}

pub trait HealthReporter: Send + Sync {
    fn report(&self, state: HealthState, detail: &str);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    pub state: HealthState,
    pub detail: String,
    /// Seconds since the Unix epoch.
    pub reported_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub last: Option<HealthRecord>,
    pub good: u64,
    pub bad: u64,
}

#[derive(Default)]
pub struct HealthLedger {
    inner: Mutex<HealthSnapshot>,
}

impl HealthLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.inner.lock().clone()
    }
}

impl HealthReporter for HealthLedger {
    fn report(&self, state: HealthState, detail: &str) {
        let reported_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut inner = self.inner.lock();
        match state {
            HealthState::Good => inner.good += 1,
            HealthState::Bad => inner.bad += 1,
        }
        inner.last = Some(HealthRecord {
            state,
            detail: detail.to_string(),
            reported_at,
        });
    }
}

//! Display surfaces.
//!
//! A [`Surface`] accepts composed frames and shows them. The physical panel
//! ([`PanelScheduler`]) keeps its image without power, so re-sending the
//! content already on it is wasted work; a window ([`WindowedSurface`]) does
//! not persist and is repainted freely.

pub mod fault;
pub mod scheduler;
pub mod window;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compose::Frame;
use crate::panel::{BufferError, RenderOutcome};

pub use fault::{FaultDetector, NoFaultDetection, SuspectedFault, TimingHeuristic};
pub use scheduler::PanelScheduler;
pub use window::{PaintError, Painter, SnapshotPainter, WindowedSurface};

#[derive(Error, Debug)]
pub enum SurfaceError {
    #[error("frame rejected: {0}")]
    Buffer(#[from] BufferError),

    #[error("failed to start render worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("panel is unavailable after a worker crash")]
    PanelLost,

    #[error("surface is shut down")]
    ShutDown,
}

/// Whether a surface keeps its content without being redrawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceKind {
    Persistent,
    Volatile,
}

/// How a new submit treats a render already on the panel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    /// Wait for the in-flight render to finish.
    #[default]
    Serialize,
    /// Ask the in-flight render to stop, then wait for it to exit.
    CooperativeCancel,
}

#[derive(Debug, Clone)]
pub struct RenderJob {
    pub content_key: String,
    pub caption: String,
    pub frame: Arc<Frame>,
}

/// How the last render on a surface ended.
#[derive(Debug, Clone, Serialize)]
pub struct RenderReport {
    pub content_key: String,
    #[serde(flatten)]
    pub outcome: RenderOutcome,
    #[serde(serialize_with = "as_secs_f64")]
    pub elapsed: Duration,
    pub suspected_fault: bool,
    #[serde(skip)]
    pub finished_at: SystemTime,
}

fn as_secs_f64<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

pub trait Surface: Send + Sync {
    fn kind(&self) -> SurfaceKind;

    /// Native `(width, height)` in pixels.
    fn dimensions(&self) -> (u32, u32);

    /// Hand a frame to the surface. May block while a previous render
    /// finishes.
    fn submit(&self, job: RenderJob) -> Result<(), SurfaceError>;

    /// Key of the frame being shown right now, if a render is underway.
    fn in_flight_key(&self) -> Option<String>;

    fn last_report(&self) -> Option<RenderReport>;

    /// Block until no render is in flight.
    fn wait_idle(&self);

    fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_default_is_serialize() {
        assert_eq!(SchedulerMode::default(), SchedulerMode::Serialize);
    }

    #[test]
    fn test_mode_serialization() {
        assert_eq!(
            serde_json::to_string(&SchedulerMode::CooperativeCancel).unwrap(),
            "\"cooperative_cancel\""
        );
        let mode: SchedulerMode = serde_json::from_str("\"serialize\"").unwrap();
        assert_eq!(mode, SchedulerMode::Serialize);
    }

    #[test]
    fn test_report_serialization() {
        let report = RenderReport {
            content_key: "album-7".into(),
            outcome: RenderOutcome::Cancelled,
            elapsed: Duration::from_millis(1500),
            suspected_fault: false,
            finished_at: SystemTime::now(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["content_key"], "album-7");
        assert_eq!(json["outcome"], "cancelled");
        assert_eq!(json["elapsed"], 1.5);
    }
}

//! Windowed stand-in for the physical panel.
//!
//! Submits never block: each one replaces a single pending slot and a paint
//! loop drains it every poll interval, so rapid updates collapse to the
//! latest frame.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use image::ImageFormat;
use parking_lot::Mutex;
use thiserror::Error;

use super::{RenderJob, RenderReport, Surface, SurfaceError, SurfaceKind};
use crate::compose::Frame;
use crate::health::{HealthReporter, HealthState};
use crate::panel::RenderOutcome;
use crate::shutdown::ShutdownCoordinator;
use crate::store::KeyStore;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum PaintError {
    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),

    #[error("failed to write frame: {0}")]
    Io(#[from] std::io::Error),
}

pub trait Painter: Send {
    fn paint(&mut self, frame: &Frame, caption: &str) -> Result<(), PaintError>;
}

/// Writes each frame to a PNG file, replacing it atomically.
pub struct SnapshotPainter {
    path: PathBuf,
}

impl SnapshotPainter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Painter for SnapshotPainter {
    fn paint(&mut self, frame: &Frame, caption: &str) -> Result<(), PaintError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("png.tmp");
        frame.save_with_format(&tmp, ImageFormat::Png)?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::debug!(path = %self.path.display(), caption, "snapshot written");
        Ok(())
    }
}

struct Shared {
    pending: Mutex<Option<RenderJob>>,
    in_flight: Mutex<Option<String>>,
    last_report: Mutex<Option<RenderReport>>,
    painter: Mutex<Box<dyn Painter>>,
    store: Arc<dyn KeyStore>,
    health: Arc<dyn HealthReporter>,
}

impl Shared {
    fn paint_pending(&self) {
        let Some(job) = self.pending.lock().take() else {
            return;
        };
        let started = Instant::now();
        let outcome = match self.painter.lock().paint(&job.frame, &job.caption) {
            Ok(()) => {
                if let Err(e) = self.store.record(&job.content_key) {
                    tracing::error!(key = %job.content_key, error = %e, "failed to persist displayed key");
                }
                self.health
                    .report(HealthState::Good, &format!("{} displayed", job.content_key));
                RenderOutcome::Completed
            }
            Err(e) => {
                tracing::error!(key = %job.content_key, error = %e, "paint failed");
                self.health.report(HealthState::Bad, &e.to_string());
                RenderOutcome::Failed(e.to_string())
            }
        };

        *self.last_report.lock() = Some(RenderReport {
            content_key: job.content_key.clone(),
            outcome,
            elapsed: started.elapsed(),
            suspected_fault: false,
            finished_at: SystemTime::now(),
        });

        let mut in_flight = self.in_flight.lock();
        if in_flight.as_deref() == Some(job.content_key.as_str()) && self.pending.lock().is_none() {
            *in_flight = None;
        }
    }
}

pub struct WindowedSurface {
    dimensions: (u32, u32),
    poll_interval: Duration,
    shared: Arc<Shared>,
    shutdown: ShutdownCoordinator,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WindowedSurface {
    /// Start the paint loop.
    pub fn start(
        dimensions: (u32, u32),
        painter: Box<dyn Painter>,
        poll_interval: Duration,
        store: Arc<dyn KeyStore>,
        health: Arc<dyn HealthReporter>,
    ) -> Result<Self, SurfaceError> {
        let shared = Arc::new(Shared {
            pending: Mutex::new(None),
            in_flight: Mutex::new(None),
            last_report: Mutex::new(None),
            painter: Mutex::new(painter),
            store,
            health,
        });
        let shutdown = ShutdownCoordinator::new();

        let guard = shutdown.register();
        let loop_shared = shared.clone();
        let loop_shutdown = shutdown.clone();
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        let handle = thread::Builder::new()
            .name("window-paint".into())
            .spawn(move || {
                let _guard = guard;
                tracing::dispatcher::with_default(&dispatch, || {
                    while !loop_shutdown.is_shutdown() {
                        loop_shared.paint_pending();
                        thread::sleep(poll_interval);
                    }
                    // Last submitted frame still gets shown.
                    loop_shared.paint_pending();
                    tracing::debug!("paint loop exited");
                });
            })
            .map_err(SurfaceError::Spawn)?;

        Ok(Self {
            dimensions,
            poll_interval,
            shared,
            shutdown,
            worker: Mutex::new(Some(handle)),
        })
    }
}

impl Surface for WindowedSurface {
    fn kind(&self) -> SurfaceKind {
        SurfaceKind::Volatile
    }

    fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    fn submit(&self, job: RenderJob) -> Result<(), SurfaceError> {
        if self.shutdown.is_shutdown() {
            return Err(SurfaceError::ShutDown);
        }
        *self.shared.in_flight.lock() = Some(job.content_key.clone());
        if let Some(replaced) = self.shared.pending.lock().replace(job) {
            tracing::debug!(key = %replaced.content_key, "pending frame superseded");
        }
        Ok(())
    }

    fn in_flight_key(&self) -> Option<String> {
        self.shared.in_flight.lock().clone()
    }

    fn last_report(&self) -> Option<RenderReport> {
        self.shared.last_report.lock().clone()
    }

    fn wait_idle(&self) {
        while self.shared.in_flight.lock().is_some() && self.shutdown.active_count() > 0 {
            thread::sleep(self.poll_interval);
        }
    }

    fn shutdown(&self) {
        self.shutdown.shutdown();
        if !self.shutdown.wait_for_all_closed(SHUTDOWN_GRACE) {
            tracing::warn!("paint loop did not exit in time");
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

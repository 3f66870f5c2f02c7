//! Physical panel scheduler.
//!
//! Owns the [`PanelController`] and runs each render on a dedicated worker
//! thread. The controller moves into the worker by value and comes back
//! through its `JoinHandle`, so at most one thread can issue bus commands at
//! any instant.
//!
//! A submit always waits for the previous worker to exit before starting the
//! next. In [`SchedulerMode::CooperativeCancel`] it first asks the running
//! worker to stop at its next checkpoint.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;

use super::fault::FaultDetector;
use super::{RenderJob, RenderReport, SchedulerMode, Surface, SurfaceError, SurfaceKind};
use crate::health::{HealthReporter, HealthState};
use crate::panel::{
    PanelBuffer, PanelController, PanelGeometry, PanelInterface, RenderOutcome, StopFlag,
};
use crate::store::KeyStore;

const WAIT_WARN_AFTER: Duration = Duration::from_secs(30);
const WAIT_WARN_EVERY: Duration = Duration::from_secs(5);

enum Slot<I: PanelInterface> {
    Idle(PanelController<I>),
    Busy(JoinHandle<PanelController<I>>),
    /// Put to sleep by `shutdown`; takes no more work.
    Asleep(PanelController<I>),
    Lost,
}

/// State shared with the worker threads.
struct Shared {
    store: Arc<dyn KeyStore>,
    detector: Box<dyn FaultDetector>,
    health: Arc<dyn HealthReporter>,
    last_report: Mutex<Option<RenderReport>>,
    in_flight: Mutex<Option<String>>,
}

pub struct PanelScheduler<I: PanelInterface> {
    mode: SchedulerMode,
    geometry: PanelGeometry,
    dither: bool,
    wait_poll: Duration,
    stop: StopFlag,
    slot: Mutex<Slot<I>>,
    shared: Arc<Shared>,
    seq: AtomicU64,
}

impl<I: PanelInterface> PanelScheduler<I> {
    pub fn new(
        controller: PanelController<I>,
        mode: SchedulerMode,
        store: Arc<dyn KeyStore>,
        detector: Box<dyn FaultDetector>,
        health: Arc<dyn HealthReporter>,
    ) -> Self {
        Self {
            mode,
            geometry: controller.geometry(),
            dither: true,
            wait_poll: Duration::from_millis(100),
            stop: controller.stop_flag(),
            slot: Mutex::new(Slot::Idle(controller)),
            shared: Arc::new(Shared {
                store,
                detector,
                health,
                last_report: Mutex::new(None),
                in_flight: Mutex::new(None),
            }),
            seq: AtomicU64::new(0),
        }
    }

    pub fn with_dither(mut self, dither: bool) -> Self {
        self.dither = dither;
        self
    }

    /// How often a waiting submit checks whether the previous worker exited.
    pub fn with_wait_poll(mut self, wait_poll: Duration) -> Self {
        self.wait_poll = wait_poll;
        self
    }

    pub fn mode(&self) -> SchedulerMode {
        self.mode
    }

    /// Wait for the worker held in `slot` and take the controller back.
    /// `None` once the panel is lost or asleep.
    fn reclaim(&self, slot: &mut Slot<I>, waiting_for: &str) -> Option<PanelController<I>> {
        match std::mem::replace(slot, Slot::Lost) {
            Slot::Idle(controller) => Some(controller),
            Slot::Asleep(controller) => {
                *slot = Slot::Asleep(controller);
                None
            }
            Slot::Lost => None,
            Slot::Busy(handle) => {
                if self.mode == SchedulerMode::CooperativeCancel && self.stop.request() {
                    tracing::info!(next = waiting_for, "requested stop of in-flight render");
                }
                let started = Instant::now();
                let mut next_warning = WAIT_WARN_AFTER;
                while !handle.is_finished() {
                    thread::sleep(self.wait_poll);
                    let waited = started.elapsed();
                    if waited >= next_warning {
                        tracing::warn!(
                            ?waited,
                            next = waiting_for,
                            "still waiting for previous render to finish"
                        );
                        next_warning += WAIT_WARN_EVERY;
                    }
                }
                match handle.join() {
                    Ok(controller) => Some(controller),
                    Err(_) => {
                        tracing::error!("render worker crashed, panel is no longer usable");
                        None
                    }
                }
            }
        }
    }

    fn spawn_worker(
        &self,
        mut controller: PanelController<I>,
        buffer: PanelBuffer,
        job: RenderJob,
    ) -> Result<JoinHandle<PanelController<I>>, SurfaceError> {
        let shared = self.shared.clone();
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());

        *shared.in_flight.lock() = Some(job.content_key.clone());
        self.stop.arm();

        let worker_shared = shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("panel-render-{id}"))
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    let started = Instant::now();
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        controller.display(&buffer, &job.content_key)
                    }))
                    .unwrap_or_else(|payload| RenderOutcome::Failed(panic_message(payload)));
                    worker_shared.conclude(&job, outcome, started.elapsed());
                });
                controller
            });

        spawned.map_err(|e| {
            shared.in_flight.lock().take();
            tracing::error!(error = %e, "failed to spawn render worker");
            SurfaceError::Spawn(e)
        })
    }
}

impl Shared {
    fn conclude(&self, job: &RenderJob, outcome: RenderOutcome, elapsed: Duration) {
        let key = job.content_key.as_str();
        let worker = thread::current().name().unwrap_or("panel-render").to_string();
        let mut suspected_fault = false;

        match &outcome {
            RenderOutcome::Completed => match self.detector.assess(elapsed) {
                Some(fault) => {
                    suspected_fault = true;
                    tracing::error!(
                        key,
                        ?elapsed,
                        expected = ?fault.expected,
                        worker = %worker,
                        "render completed too quickly, panel likely ignored the write"
                    );
                    self.health.report(HealthState::Bad, &fault.reason);
                }
                None => {
                    if let Err(e) = self.store.record(key) {
                        tracing::error!(key, error = %e, "failed to persist displayed key");
                    }
                    tracing::info!(key, ?elapsed, "render complete");
                    self.health.report(HealthState::Good, &format!("{key} displayed"));
                }
            },
            RenderOutcome::Cancelled => {
                tracing::info!(key, ?elapsed, "render cancelled before completion");
            }
            RenderOutcome::Failed(reason) => {
                tracing::error!(key, reason = %reason, "render failed");
                self.health.report(HealthState::Bad, reason);
            }
        }

        *self.last_report.lock() = Some(RenderReport {
            content_key: key.to_string(),
            outcome,
            elapsed,
            suspected_fault,
            finished_at: SystemTime::now(),
        });

        let mut in_flight = self.in_flight.lock();
        if in_flight.as_deref() == Some(key) {
            *in_flight = None;
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("render worker panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("render worker panicked: {s}")
    } else {
        "render worker panicked".to_string()
    }
}

impl<I: PanelInterface> Surface for PanelScheduler<I> {
    fn kind(&self) -> SurfaceKind {
        SurfaceKind::Persistent
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.geometry.width, self.geometry.height)
    }

    fn submit(&self, job: RenderJob) -> Result<(), SurfaceError> {
        // Pack before waiting so the next frame is ready the moment the
        // panel frees up.
        let buffer = PanelBuffer::from_frame(&job.frame, self.geometry, self.dither)?;

        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Asleep(_)) {
            return Err(SurfaceError::ShutDown);
        }
        let controller = self
            .reclaim(&mut slot, &job.content_key)
            .ok_or(SurfaceError::PanelLost)?;

        tracing::debug!(key = %job.content_key, mode = ?self.mode, "starting render worker");
        *slot = Slot::Busy(self.spawn_worker(controller, buffer, job)?);
        Ok(())
    }

    fn in_flight_key(&self) -> Option<String> {
        self.shared.in_flight.lock().clone()
    }

    fn last_report(&self) -> Option<RenderReport> {
        self.shared.last_report.lock().clone()
    }

    fn wait_idle(&self) {
        let mut slot = self.slot.lock();
        if let Some(controller) = self.reclaim(&mut slot, "idle") {
            *slot = Slot::Idle(controller);
        }
    }

    fn shutdown(&self) {
        let mut slot = self.slot.lock();
        let Some(mut controller) = self.reclaim(&mut slot, "shutdown") else {
            return;
        };
        if let Err(e) = controller.sleep() {
            tracing::warn!(error = %e, "failed to put panel to sleep");
        } else {
            tracing::info!("panel asleep");
        }
        *slot = Slot::Asleep(controller);
    }
}

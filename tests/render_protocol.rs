//! Render protocol tests against the simulated panel.
//!
//! These exercise the scheduler and coordinator end to end with real worker
//! threads: serialized hardware access, cooperative cancellation, dedup,
//! single-flight coalescing and the silent-failure heuristic.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use inkframe::coordinator::{RenderCoordinator, RenderStatus};
use inkframe::health::HealthState;
use inkframe::panel::{command, BusEventKind, RenderOutcome};
use inkframe::store::{KeyStore, MemoryKeyStore};
use inkframe::surface::{
    NoFaultDetection, SchedulerMode, Surface, SurfaceError, TimingHeuristic,
};

/// Counts ERROR events.
struct ErrorCounter(Arc<AtomicUsize>);

impl<S: Subscriber> Layer<S> for ErrorCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::ERROR {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[test]
fn test_serialize_mode_never_interleaves_workers() {
    let h = common::panel(
        SchedulerMode::Serialize,
        Duration::from_millis(150),
        Box::new(NoFaultDetection),
    );
    let main_thread = thread::current().id();

    h.scheduler.submit(common::job("a")).unwrap();
    let started = Instant::now();
    h.scheduler.submit(common::job("b")).unwrap();

    // The second submit waited for the first refresh to run out.
    assert!(started.elapsed() >= Duration::from_millis(100));
    h.scheduler.wait_idle();

    let refreshes = h.log.refresh_threads();
    assert_eq!(refreshes.len(), 2);
    assert_ne!(refreshes[0], refreshes[1]);

    // Every bus event from the first worker precedes every event from the
    // second.
    let mut owners: Vec<_> = h
        .log
        .events()
        .into_iter()
        .map(|e| e.thread)
        .filter(|t| *t != main_thread)
        .collect();
    owners.dedup();
    assert_eq!(owners, refreshes);

    assert_eq!(h.store.recorded(), vec!["a", "b"]);
}

#[test]
fn test_cooperative_cancel_stops_in_flight_render() {
    let h = common::panel(
        SchedulerMode::CooperativeCancel,
        Duration::from_secs(1),
        Box::new(NoFaultDetection),
    );

    h.scheduler.submit(common::job("a")).unwrap();
    assert!(common::wait_for(Duration::from_secs(2), || {
        h.log.command_count(command::DISPLAY_REFRESH) == 1
    }));

    let started = Instant::now();
    h.scheduler.submit(common::job("b")).unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(h.scheduler.in_flight_key().as_deref(), Some("b"));

    h.scheduler.wait_idle();

    // Only the render that ran to completion is recorded.
    assert_eq!(h.store.recorded(), vec!["b"]);
    let report = h.scheduler.last_report().unwrap();
    assert_eq!(report.content_key, "b");
    assert_eq!(report.outcome, RenderOutcome::Completed);
    assert_eq!(h.scheduler.in_flight_key(), None);

    // The cancelled render forced the busy line idle and powered down.
    let events = h.log.events();
    assert_eq!(events.iter().filter(|e| e.kind == BusEventKind::ForceIdle).count(), 1);
    assert_eq!(h.log.command_count(command::POWER_ON), 2);
    assert_eq!(h.log.command_count(command::POWER_OFF), 2);
    assert_eq!(h.log.command_count(command::DISPLAY_REFRESH), 2);
}

#[test]
fn test_serialize_mode_does_not_cancel() {
    let h = common::panel(
        SchedulerMode::Serialize,
        Duration::from_millis(100),
        Box::new(NoFaultDetection),
    );

    h.scheduler.submit(common::job("a")).unwrap();
    h.scheduler.submit(common::job("b")).unwrap();
    h.scheduler.wait_idle();

    assert!(!h.log.events().iter().any(|e| e.kind == BusEventKind::ForceIdle));
    assert_eq!(h.health.snapshot().good, 2);
}

fn run_with_threshold(refresh: Duration) -> (usize, common::PanelHarness) {
    let errors = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(ErrorCounter(errors.clone()));

    let h = tracing::subscriber::with_default(subscriber, || {
        let h = common::panel(
            SchedulerMode::Serialize,
            refresh,
            Box::new(TimingHeuristic::new(Duration::from_millis(500))),
        );
        h.scheduler.submit(common::job("a")).unwrap();
        h.scheduler.wait_idle();
        h
    });

    (errors.load(Ordering::SeqCst), h)
}

#[test]
fn test_fast_completion_is_reported_as_suspected_fault() {
    let (errors, h) = run_with_threshold(Duration::from_millis(100));

    assert_eq!(errors, 1);
    assert!(h.store.recorded().is_empty());
    let report = h.scheduler.last_report().unwrap();
    assert!(report.suspected_fault);
    assert_eq!(report.outcome, RenderOutcome::Completed);
    let health = h.health.snapshot();
    assert_eq!(health.bad, 1);
    assert_eq!(health.last.unwrap().state, HealthState::Bad);

    // Not retried.
    assert_eq!(h.log.command_count(command::DISPLAY_REFRESH), 1);
}

#[test]
fn test_slow_completion_is_trusted() {
    let (errors, h) = run_with_threshold(Duration::from_millis(600));

    assert_eq!(errors, 0);
    assert_eq!(h.store.recorded(), vec!["a"]);
    assert!(!h.scheduler.last_report().unwrap().suspected_fault);
    assert_eq!(h.health.snapshot().good, 1);
}

#[test]
fn test_same_key_twice_writes_once() {
    let h = common::panel(
        SchedulerMode::Serialize,
        Duration::from_millis(50),
        Box::new(NoFaultDetection),
    );
    let coordinator =
        RenderCoordinator::new(h.scheduler.clone(), h.store.clone(), common::composition()).unwrap();

    assert_eq!(coordinator.set_main_content(common::slot("a")), RenderStatus::Submitted);
    // Still in flight.
    assert_eq!(coordinator.set_main_content(common::slot("a")), RenderStatus::Deduplicated);
    h.scheduler.wait_idle();
    // Now persisted.
    assert_eq!(coordinator.set_main_content(common::slot("a")), RenderStatus::Deduplicated);

    assert_eq!(h.log.command_count(command::DISPLAY_REFRESH), 1);
}

#[test]
fn test_key_displayed_before_restart_is_not_redrawn() {
    let h = common::panel_with_store(
        SchedulerMode::Serialize,
        Duration::from_millis(20),
        Box::new(NoFaultDetection),
        MemoryKeyStore::with_current("a"),
    );
    let coordinator =
        RenderCoordinator::new(h.scheduler.clone(), h.store.clone(), common::composition()).unwrap();

    assert_eq!(coordinator.set_main_content(common::slot("a")), RenderStatus::Deduplicated);
    assert_eq!(coordinator.set_main_content(common::slot("b")), RenderStatus::Submitted);
    h.scheduler.wait_idle();

    assert_eq!(h.log.command_count(command::DISPLAY_REFRESH), 1);
    assert_eq!(h.store.current().as_deref(), Some("b"));
}

#[test]
fn test_calls_during_render_coalesce_into_one_write() {
    let h = common::panel(
        SchedulerMode::Serialize,
        Duration::from_millis(300),
        Box::new(NoFaultDetection),
    );
    let coordinator = Arc::new(
        RenderCoordinator::new(h.scheduler.clone(), h.store.clone(), common::composition())
            .unwrap(),
    );

    assert_eq!(coordinator.set_main_content(common::slot("a")), RenderStatus::Submitted);

    // This render blocks behind "a".
    let background = coordinator.clone();
    let t1 = thread::spawn(move || background.set_main_content(common::slot("b")));
    assert!(common::wait_for(Duration::from_secs(1), || coordinator.status().rendering));

    for i in 0..5 {
        let status = coordinator.set_main_content(common::slot(&format!("c{i}")));
        assert_eq!(status, RenderStatus::Coalesced);
    }

    assert_eq!(t1.join().unwrap(), RenderStatus::Submitted);
    h.scheduler.wait_idle();

    assert_eq!(h.log.command_count(command::DISPLAY_REFRESH), 3);
    assert_eq!(h.store.recorded(), vec!["a", "b", "c4"]);
    assert!(!coordinator.status().rendering);
}

#[test]
fn test_switching_back_while_render_is_queued_draws_latest() {
    let h = common::panel(
        SchedulerMode::Serialize,
        Duration::from_millis(300),
        Box::new(NoFaultDetection),
    );
    let coordinator = Arc::new(
        RenderCoordinator::new(h.scheduler.clone(), h.store.clone(), common::composition())
            .unwrap(),
    );

    assert_eq!(coordinator.set_main_content(common::slot("a")), RenderStatus::Submitted);
    let background = coordinator.clone();
    let t1 = thread::spawn(move || background.set_main_content(common::slot("b")));
    assert!(common::wait_for(Duration::from_secs(1), || coordinator.status().rendering));

    // "a" is still in flight, but "b" is queued behind it.
    assert_eq!(coordinator.set_main_content(common::slot("a")), RenderStatus::Coalesced);
    assert_eq!(coordinator.status().main_key.as_deref(), Some("a"));

    assert_eq!(t1.join().unwrap(), RenderStatus::Submitted);
    h.scheduler.wait_idle();

    assert_eq!(h.store.recorded(), vec!["a", "b", "a"]);
    assert_eq!(h.store.current().as_deref(), Some("a"));
    assert_eq!(h.log.command_count(command::DISPLAY_REFRESH), 3);
}

#[test]
fn test_shutdown_waits_then_sleeps_panel() {
    let h = common::panel(
        SchedulerMode::Serialize,
        Duration::from_millis(50),
        Box::new(NoFaultDetection),
    );

    h.scheduler.submit(common::job("a")).unwrap();
    h.scheduler.shutdown();

    assert_eq!(h.store.recorded(), vec!["a"]);
    assert_eq!(h.log.command_count(command::DEEP_SLEEP), 1);
    let events = h.log.events();
    let refresh_at = events
        .iter()
        .position(|e| e.kind == BusEventKind::Command(command::DISPLAY_REFRESH))
        .unwrap();
    let sleep_at = events
        .iter()
        .position(|e| e.kind == BusEventKind::Command(command::DEEP_SLEEP))
        .unwrap();
    assert!(refresh_at < sleep_at);
}

#[test]
fn test_submit_after_shutdown_is_refused() {
    let h = common::panel(
        SchedulerMode::Serialize,
        Duration::from_millis(20),
        Box::new(NoFaultDetection),
    );
    h.scheduler.submit(common::job("a")).unwrap();
    h.scheduler.shutdown();
    let writes = h.log.command_count(command::DATA_START);

    let result = h.scheduler.submit(common::job("b"));

    assert!(matches!(result, Err(SurfaceError::ShutDown)));
    h.scheduler.wait_idle();
    h.scheduler.shutdown();
    assert_eq!(h.log.command_count(command::DATA_START), writes);
    assert_eq!(h.log.command_count(command::DEEP_SLEEP), 1);
    assert_eq!(h.store.recorded(), vec!["a"]);
}

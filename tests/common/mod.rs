#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use image::{ImageFormat, Rgb, RgbImage};

use inkframe::api::AppState;
use inkframe::compose::{CompositionConfig, Frame};
use inkframe::content::{ContentKind, ContentSlot};
use inkframe::coordinator::RenderCoordinator;
use inkframe::health::HealthLedger;
use inkframe::ingest::Ingestor;
use inkframe::panel::{BusLog, PanelController, PanelGeometry, PanelTiming, SimulatedInterface};
use inkframe::store::MemoryKeyStore;
use inkframe::surface::{FaultDetector, NoFaultDetection, PanelScheduler, RenderJob, SchedulerMode};

pub const WIDTH: u32 = 8;
pub const HEIGHT: u32 = 4;

pub fn geometry() -> PanelGeometry {
    PanelGeometry {
        width: WIDTH,
        height: HEIGHT,
    }
}

pub fn fast_timing() -> PanelTiming {
    PanelTiming {
        busy_poll: Duration::from_millis(5),
        power_settle: Duration::ZERO,
        sleep_settle: Duration::ZERO,
    }
}

pub fn composition() -> CompositionConfig {
    CompositionConfig {
        screen_width: WIDTH,
        screen_height: HEIGHT,
        ..CompositionConfig::default()
    }
}

pub fn job(key: &str) -> RenderJob {
    RenderJob {
        content_key: key.to_string(),
        caption: format!("caption for {key}"),
        frame: Arc::new(Frame::from_pixel(WIDTH, HEIGHT, Rgb([209, 0, 0]))),
    }
}

pub fn slot(key: &str) -> ContentSlot {
    ContentSlot::new(
        ContentKind::Art,
        key,
        RgbImage::from_pixel(16, 16, Rgb([35, 35, 255])),
        key,
    )
}

/// A scheduler over a simulated panel, plus handles to everything it writes.
pub struct PanelHarness {
    pub scheduler: Arc<PanelScheduler<SimulatedInterface>>,
    pub log: BusLog,
    pub store: Arc<MemoryKeyStore>,
    pub health: Arc<HealthLedger>,
}

pub fn panel(mode: SchedulerMode, refresh: Duration, detector: Box<dyn FaultDetector>) -> PanelHarness {
    panel_with_store(mode, refresh, detector, MemoryKeyStore::new())
}

pub fn panel_with_store(
    mode: SchedulerMode,
    refresh: Duration,
    detector: Box<dyn FaultDetector>,
    store: MemoryKeyStore,
) -> PanelHarness {
    let interface = SimulatedInterface::new(refresh);
    let log = interface.log();
    let mut controller = PanelController::new(interface, geometry(), fast_timing());
    controller.init().unwrap();

    let store = Arc::new(store);
    let health = Arc::new(HealthLedger::new());
    let scheduler = PanelScheduler::new(controller, mode, store.clone(), detector, health.clone())
        .with_dither(false)
        .with_wait_poll(Duration::from_millis(5));

    PanelHarness {
        scheduler: Arc::new(scheduler),
        log,
        store,
        health,
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

pub fn png_base64(color: [u8; 3]) -> String {
    let image = RgbImage::from_pixel(12, 12, Rgb(color));
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png).unwrap();
    base64::engine::general_purpose::STANDARD.encode(out.into_inner())
}

/// App state over a fast simulated panel.
pub fn create_test_state() -> (AppState, PanelHarness) {
    let harness = panel(
        SchedulerMode::Serialize,
        Duration::from_millis(20),
        Box::new(NoFaultDetection),
    );
    let coordinator = Arc::new(
        RenderCoordinator::new(harness.scheduler.clone(), harness.store.clone(), composition())
            .unwrap(),
    );
    let ingestor = Arc::new(Ingestor::new(coordinator.clone(), None));
    let state = AppState {
        coordinator,
        ingestor,
        health: harness.health.clone(),
        web_image_max_width: 600,
        jpeg_quality: 85,
    };
    (state, harness)
}

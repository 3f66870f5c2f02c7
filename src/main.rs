use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use inkframe::api::{self, AppState};
use inkframe::config::{AppConfig, ConfigError, SurfaceChoice};
use inkframe::coordinator::RenderCoordinator;
use inkframe::health::HealthLedger;
use inkframe::ingest::Ingestor;
use inkframe::panel::{InterfaceError, PanelController, SimulatedInterface};
use inkframe::store::{FileKeyStore, KeyStore, StoreError};
use inkframe::surface::{
    PanelScheduler, SchedulerMode, SnapshotPainter, Surface, SurfaceError, TimingHeuristic,
    WindowedSurface,
};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("panel error: {0}")]
    Interface(#[from] InterfaceError),

    #[error("surface error: {0}")]
    Surface(#[from] SurfaceError),

    #[error("composition error: {0}")]
    Composition(#[from] inkframe::compose::CompositionError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "inkframe", version, about = "Drives an e-paper picture frame")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, env = "INKFRAME_CONFIG")]
    config: Option<PathBuf>,

    /// Display surface to drive
    #[arg(long, value_enum, env = "INKFRAME_SURFACE")]
    surface: Option<SurfaceChoice>,

    /// How a new render treats one already in flight
    #[arg(long, value_enum, env = "INKFRAME_MODE")]
    mode: Option<SchedulerMode>,

    /// Address to bind the status server to
    #[arg(long, env = "INKFRAME_HOST")]
    host: Option<String>,

    /// Port for the status server
    #[arg(long, env = "INKFRAME_PORT")]
    port: Option<u16>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "INKFRAME_LOG_LEVEL")]
    log_level: Option<String>,

    /// Renders completing faster than this many seconds are suspect
    #[arg(long, env = "INKFRAME_SUCCESS_THRESHOLD")]
    success_threshold: Option<f64>,

    /// Simulated panel refresh time in seconds
    #[arg(long, env = "INKFRAME_MOCK_SUCCESS_DELAY")]
    mock_success_delay: Option<f64>,

    /// Simulated refresh time in seconds when simulating failures
    #[arg(long, env = "INKFRAME_MOCK_FAILURE_DELAY")]
    mock_failure_delay: Option<f64>,

    /// Make the simulated panel refresh too quickly
    #[arg(long, env = "INKFRAME_SIMULATE_FAILED_RENDERS")]
    simulate_failed_renders: bool,
}

impl Cli {
    fn apply(self, config: &mut AppConfig) {
        if let Some(surface) = self.surface {
            config.display.surface = surface;
        }
        if let Some(mode) = self.mode {
            config.display.mode = mode;
        }
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(threshold) = self.success_threshold {
            config.timing.success_threshold_secs = threshold;
        }
        if let Some(delay) = self.mock_success_delay {
            config.timing.mock_success_delay_secs = delay;
        }
        if let Some(delay) = self.mock_failure_delay {
            config.timing.mock_failure_delay_secs = delay;
        }
        if self.simulate_failed_renders {
            config.timing.simulate_failed_renders = true;
        }
    }
}

fn build_surface(
    config: &AppConfig,
    store: Arc<dyn KeyStore>,
    health: Arc<HealthLedger>,
) -> Result<Arc<dyn Surface>, AppError> {
    match config.display.surface {
        SurfaceChoice::Panel => {
            let refresh = config.timing.simulated_refresh();
            tracing::info!(?refresh, mode = ?config.display.mode, "using simulated panel");
            let mut controller = PanelController::new(
                SimulatedInterface::new(refresh),
                config.display.geometry(),
                config.timing.panel_timing(),
            );
            controller.init()?;
            let scheduler = PanelScheduler::new(
                controller,
                config.display.mode,
                store,
                Box::new(TimingHeuristic::new(config.timing.success_threshold())),
                health,
            )
            .with_dither(config.display.dither)
            .with_wait_poll(config.timing.wait_poll());
            Ok(Arc::new(scheduler))
        }
        SurfaceChoice::Window => {
            tracing::info!(path = %config.window.snapshot_path.display(), "using window surface");
            let surface = WindowedSurface::start(
                (config.composition.screen_width, config.composition.screen_height),
                Box::new(SnapshotPainter::new(&config.window.snapshot_path)),
                std::time::Duration::from_millis(config.window.poll_interval_ms),
                store,
                health,
            )?;
            Ok(Arc::new(surface))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.filter()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate()?;
    tracing::info!("inkframe starting");

    let store: Arc<dyn KeyStore> = Arc::new(FileKeyStore::open(config.storage.key_path())?);
    let health = Arc::new(HealthLedger::new());
    let surface = build_surface(&config, store.clone(), health.clone())?;

    let coordinator = Arc::new(RenderCoordinator::new(
        surface.clone(),
        store,
        config.composition,
    )?);
    let ingestor = Arc::new(Ingestor::new(coordinator.clone(), config.overlay.default_ttl()));

    let state = AppState {
        coordinator,
        ingestor,
        health,
        web_image_max_width: config.server.web_image_max_width,
        jpeg_quality: config.server.jpeg_quality,
    };

    let addr = config.server.addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "status server listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    // Let an in-flight render finish, then park the hardware.
    let result = tokio::task::spawn_blocking(move || surface.shutdown()).await;
    if let Err(e) = result {
        tracing::error!(error = %e, "surface shutdown failed");
    }
    tracing::info!("inkframe stopped");

    Ok(())
}

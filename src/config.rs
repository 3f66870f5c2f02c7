//! Application configuration.
//!
//! Loaded from a TOML file; every section and field is optional and falls
//! back to its default. Command-line flags override the file afterwards, and
//! [`AppConfig::validate`] runs once everything is merged.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compose::{CompositionConfig, CompositionError};
use crate::panel::{PanelGeometry, PanelTiming};
use crate::surface::SchedulerMode;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid composition settings: {0}")]
    Composition(#[from] CompositionError),

    #[error("panel width {width} must be a positive multiple of 4 and height {height} non-zero")]
    PanelGeometry { width: u32, height: u32 },

    #[error("{name} must be a positive number of seconds, got {value}")]
    Timing { name: &'static str, value: f64 },

    #[error("invalid listen address {0}")]
    Address(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceChoice {
    /// The physical panel.
    #[default]
    Panel,
    /// A desktop stand-in that writes PNG snapshots.
    Window,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub display: DisplayConfig,
    pub composition: CompositionConfig,
    pub timing: TimingConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub window: WindowConfig,
    pub overlay: OverlayConfig,
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let display = DisplayConfig::default();
        // Landscape frames on the portrait panel.
        let composition = CompositionConfig {
            screen_width: display.panel_height,
            screen_height: display.panel_width,
            ..CompositionConfig::default()
        };
        Self {
            display,
            composition,
            timing: TimingConfig::default(),
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            window: WindowConfig::default(),
            overlay: OverlayConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub surface: SurfaceChoice,
    pub mode: SchedulerMode,
    pub dither: bool,
    pub panel_width: u32,
    pub panel_height: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        let geometry = PanelGeometry::default();
        Self {
            surface: SurfaceChoice::Panel,
            mode: SchedulerMode::Serialize,
            dither: true,
            panel_width: geometry.width,
            panel_height: geometry.height,
        }
    }
}

impl DisplayConfig {
    pub fn geometry(&self) -> PanelGeometry {
        PanelGeometry {
            width: self.panel_width,
            height: self.panel_height,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// A completed render faster than this is treated as a silent failure.
    pub success_threshold_secs: f64,
    /// Simulated refresh time of a healthy panel.
    pub mock_success_delay_secs: f64,
    /// Simulated refresh time when failures are simulated.
    pub mock_failure_delay_secs: f64,
    pub simulate_failed_renders: bool,
    pub busy_poll_ms: u64,
    pub wait_poll_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            success_threshold_secs: 12.0,
            mock_success_delay_secs: 25.0,
            mock_failure_delay_secs: 6.0,
            simulate_failed_renders: false,
            busy_poll_ms: 100,
            wait_poll_ms: 100,
        }
    }
}

/// `secs` as a positive duration that can still be added to `Instant::now()`.
fn positive_secs(secs: f64) -> Option<Duration> {
    if secs <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| Instant::now().checked_add(*d).is_some())
}

impl TimingConfig {
    pub fn success_threshold(&self) -> Duration {
        positive_secs(self.success_threshold_secs).unwrap_or_default()
    }

    /// Refresh time the simulated panel should use.
    pub fn simulated_refresh(&self) -> Duration {
        let secs = if self.simulate_failed_renders {
            self.mock_failure_delay_secs
        } else {
            self.mock_success_delay_secs
        };
        positive_secs(secs).unwrap_or_default()
    }

    pub fn wait_poll(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms)
    }

    pub fn panel_timing(&self) -> PanelTiming {
        PanelTiming {
            busy_poll: Duration::from_millis(self.busy_poll_ms),
            ..PanelTiming::default()
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("success_threshold_secs", self.success_threshold_secs),
            ("mock_success_delay_secs", self.mock_success_delay_secs),
            ("mock_failure_delay_secs", self.mock_failure_delay_secs),
        ] {
            if positive_secs(value).is_none() {
                return Err(ConfigError::Timing { name, value });
            }
        }
        for (name, value) in [
            ("busy_poll_ms", self.busy_poll_ms),
            ("wait_poll_ms", self.wait_poll_ms),
        ] {
            if positive_secs(value as f64 / 1000.0).is_none() {
                return Err(ConfigError::Timing {
                    name,
                    value: value as f64 / 1000.0,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Width `/current-image` is downscaled to.
    pub web_image_max_width: u32,
    pub jpeg_quality: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9090,
            web_image_max_width: 600,
            jpeg_quality: 85,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> Result<SocketAddr, ConfigError> {
        let text = format!("{}:{}", self.host, self.port);
        text.parse().map_err(|_| ConfigError::Address(text))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub state_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("state"),
        }
    }
}

impl StorageConfig {
    pub fn key_path(&self) -> PathBuf {
        self.state_dir.join("current_key.json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub snapshot_path: PathBuf,
    pub poll_interval_ms: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from("state/window.png"),
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Lifetime of overlays whose event does not set one. Unset keeps them
    /// until cleared.
    pub default_ttl_secs: Option<f64>,
}

impl OverlayConfig {
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_secs.and_then(positive_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.default_ttl_secs {
            Some(value) if positive_secs(value).is_none() => Err(ConfigError::Timing {
                name: "default_ttl_secs",
                value,
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub fn filter(&self) -> String {
        format!("inkframe={0},tower_http={0}", self.level)
    }
}

impl AppConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Dimensions of the surface the composition must fit.
    pub fn surface_dimensions(&self) -> (u32, u32) {
        match self.display.surface {
            SurfaceChoice::Panel => (self.display.panel_width, self.display.panel_height),
            SurfaceChoice::Window => (self.composition.screen_width, self.composition.screen_height),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let geometry = self.display.geometry();
        if self.display.surface == SurfaceChoice::Panel && !geometry.is_valid() {
            return Err(ConfigError::PanelGeometry {
                width: geometry.width,
                height: geometry.height,
            });
        }
        self.composition
            .validate_for_surface(self.surface_dimensions())?;
        self.timing.validate()?;
        self.overlay.validate()?;
        self.server.addr()?;
        Ok(())
    }
}

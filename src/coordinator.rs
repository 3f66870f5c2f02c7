//! Render coordination.
//!
//! The coordinator owns "what should be on screen": a main content slot and
//! an optional overlay that temporarily replaces it. Any change triggers a
//! render, and renders are single-flight: a call arriving while one is
//! underway only marks the state dirty, and the running render makes one
//! more pass with whatever is latest once its current submit returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::compose::{compose, CompositionConfig, CompositionError, CompositionOverrides, Frame};
use crate::content::{ContentKind, ContentSlot};
use crate::store::KeyStore;
use crate::surface::{RenderJob, Surface, SurfaceKind};

/// What a render request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStatus {
    /// A frame was handed to the surface.
    Submitted,
    /// Another render is underway and will pick this change up.
    Coalesced,
    /// The content is already displayed or being displayed.
    Deduplicated,
    NothingToShow,
    /// The configuration did not change.
    Unchanged,
    /// The surface refused the frame.
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameMeta {
    pub content_key: String,
    pub kind: ContentKind,
    pub caption: String,
    pub overlay: bool,
    #[serde(skip)]
    pub rendered_at: SystemTime,
}

/// The last composed frame and what it shows.
#[derive(Debug, Clone)]
pub struct RenderedFrame {
    pub frame: Arc<Frame>,
    pub meta: FrameMeta,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub main_key: Option<String>,
    pub overlay_key: Option<String>,
    pub overlay_expires_in_secs: Option<f64>,
    pub rendering: bool,
    pub displayed_key: Option<String>,
    pub in_flight_key: Option<String>,
    pub config: CompositionConfig,
}

#[derive(Default)]
struct RenderState {
    main: Option<ContentSlot>,
    overlay: Option<ContentSlot>,
    overlay_expires_at: Option<Instant>,
    rendering: bool,
    rerender_requested: bool,
    force_requested: bool,
}

impl RenderState {
    /// The slot to show now. Drops an expired overlay.
    fn select(&mut self) -> Option<ContentSlot> {
        if let Some(expires_at) = self.overlay_expires_at {
            if self.overlay.is_some() && Instant::now() >= expires_at {
                tracing::info!("overlay expired");
                self.overlay = None;
                self.overlay_expires_at = None;
            }
        }
        self.overlay.clone().or_else(|| self.main.clone())
    }

    /// Like `select` but leaves state untouched.
    fn peek(&self) -> Option<&ContentSlot> {
        let overlay_live = self
            .overlay_expires_at
            .map_or(true, |expires_at| Instant::now() < expires_at);
        self.overlay
            .as_ref()
            .filter(|_| overlay_live)
            .or(self.main.as_ref())
    }
}

/// Clears `rendering` if a render pass unwinds.
struct RenderingGuard<'a> {
    state: &'a Mutex<RenderState>,
    armed: bool,
}

impl Drop for RenderingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.state.lock();
            state.rendering = false;
            state.rerender_requested = false;
        }
    }
}

pub struct RenderCoordinator {
    surface: Arc<dyn Surface>,
    store: Arc<dyn KeyStore>,
    config: RwLock<CompositionConfig>,
    state: Mutex<RenderState>,
    last_frame: RwLock<Option<RenderedFrame>>,
    warned_empty: AtomicBool,
}

impl RenderCoordinator {
    pub fn new(
        surface: Arc<dyn Surface>,
        store: Arc<dyn KeyStore>,
        config: CompositionConfig,
    ) -> Result<Self, CompositionError> {
        config.validate_for_surface(surface.dimensions())?;
        Ok(Self {
            surface,
            store,
            config: RwLock::new(config),
            state: Mutex::new(RenderState::default()),
            last_frame: RwLock::new(None),
            warned_empty: AtomicBool::new(false),
        })
    }

    pub fn surface(&self) -> &Arc<dyn Surface> {
        &self.surface
    }

    pub fn config(&self) -> CompositionConfig {
        *self.config.read()
    }

    /// Replace the main content and render it. The render is skipped when a
    /// persistent surface already shows the key, but `slot` always becomes
    /// the latest state, so a render coalesced behind this call draws it.
    pub fn set_main_content(&self, slot: ContentSlot) -> RenderStatus {
        tracing::info!(key = slot.content_key(), kind = %slot.kind(), "setting main content");
        self.state.lock().main = Some(slot);
        self.render()
    }

    /// Show `slot` in place of the main content until `ttl` passes or the
    /// overlay is cleared. `None` keeps it until cleared.
    pub fn set_overlay(&self, slot: ContentSlot, ttl: Option<Duration>) -> RenderStatus {
        tracing::warn!(key = slot.content_key(), ?ttl, "setting overlay");
        {
            let mut state = self.state.lock();
            state.overlay = Some(slot);
            // An expiry past what `Instant` can hold never arrives.
            state.overlay_expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        }
        self.render()
    }

    pub fn clear_overlay(&self) -> RenderStatus {
        {
            let mut state = self.state.lock();
            if state.overlay.take().is_none() {
                return RenderStatus::Unchanged;
            }
            state.overlay_expires_at = None;
        }
        tracing::info!("overlay cleared");
        self.render()
    }

    /// Render the current state. Returns immediately with `Coalesced` when a
    /// render is already underway.
    pub fn render(&self) -> RenderStatus {
        self.render_with(false)
    }

    fn render_with(&self, force: bool) -> RenderStatus {
        {
            let mut state = self.state.lock();
            state.force_requested |= force;
            if state.rendering {
                state.rerender_requested = true;
                return RenderStatus::Coalesced;
            }
            state.rendering = true;
        }
        let mut guard = RenderingGuard {
            state: &self.state,
            armed: true,
        };

        loop {
            let (selection, force) = {
                let mut state = self.state.lock();
                state.rerender_requested = false;
                let force = std::mem::take(&mut state.force_requested);
                (state.select(), force)
            };

            let status = self.render_pass(selection, force);

            let mut state = self.state.lock();
            if !state.rerender_requested {
                state.rendering = false;
                guard.armed = false;
                return status;
            }
            tracing::debug!("state changed during render, rendering again");
        }
    }

    fn render_pass(&self, selection: Option<ContentSlot>, force: bool) -> RenderStatus {
        let Some(slot) = selection else {
            if !self.warned_empty.swap(true, Ordering::Relaxed) {
                tracing::warn!("no content to render");
            }
            return RenderStatus::NothingToShow;
        };
        self.warned_empty.store(false, Ordering::Relaxed);

        if !force && self.already_shown(slot.content_key()) {
            tracing::info!(key = slot.content_key(), "content already displayed, skipping");
            return RenderStatus::Deduplicated;
        }

        let config = self.config();
        let frame = Arc::new(compose(slot.image(), &config));
        let overlay = matches!(slot.kind(), ContentKind::ErrorOverlay)
            || self.state.lock().overlay.as_ref().map(ContentSlot::content_key)
                == Some(slot.content_key());
        *self.last_frame.write() = Some(RenderedFrame {
            frame: frame.clone(),
            meta: FrameMeta {
                content_key: slot.content_key().to_string(),
                kind: slot.kind(),
                caption: slot.caption().to_string(),
                overlay,
                rendered_at: SystemTime::now(),
            },
        });

        let job = RenderJob {
            content_key: slot.content_key().to_string(),
            caption: slot.caption().to_string(),
            frame,
        };
        match self.surface.submit(job) {
            Ok(()) => RenderStatus::Submitted,
            Err(e) => {
                tracing::error!(key = slot.content_key(), error = %e, "surface rejected frame");
                RenderStatus::Rejected
            }
        }
    }

    /// Whether the panel shows `key`, or will once the in-flight render lands.
    fn already_shown(&self, key: &str) -> bool {
        if self.surface.kind() != SurfaceKind::Persistent {
            return false;
        }
        // The worker records its key before clearing the in-flight slot.
        match self.surface.in_flight_key() {
            Some(in_flight) => in_flight == key,
            None => self.store.current().as_deref() == Some(key),
        }
    }

    /// Compose the current content with `overrides` applied, without
    /// touching the surface or any stored state.
    pub fn render_preview(
        &self,
        overrides: &CompositionOverrides,
    ) -> Result<Option<Frame>, CompositionError> {
        let config = self.config().with_overrides(overrides);
        config.validate()?;
        let slot = self.state.lock().peek().cloned();
        Ok(slot.map(|slot| compose(slot.image(), &config)))
    }

    /// The last composed frame. Never waits for a render.
    pub fn current_rendered_image(&self) -> Option<RenderedFrame> {
        self.last_frame.read().clone()
    }

    /// Merge `overrides` into the live config and re-render.
    pub fn update_config(
        &self,
        overrides: &CompositionOverrides,
    ) -> Result<RenderStatus, CompositionError> {
        let updated = self.config().with_overrides(overrides);
        updated.validate_for_surface(self.surface.dimensions())?;
        {
            let mut config = self.config.write();
            if *config == updated {
                return Ok(RenderStatus::Unchanged);
            }
            *config = updated;
        }
        tracing::info!(config = ?updated, "composition config updated");
        Ok(self.render_with(true))
    }

    pub fn status(&self) -> CoordinatorStatus {
        let state = self.state.lock();
        let now = Instant::now();
        CoordinatorStatus {
            main_key: state.main.as_ref().map(|s| s.content_key().to_string()),
            overlay_key: state.overlay.as_ref().map(|s| s.content_key().to_string()),
            overlay_expires_in_secs: state
                .overlay_expires_at
                .map(|at| at.saturating_duration_since(now).as_secs_f64()),
            rendering: state.rendering,
            displayed_key: self.store.current(),
            in_flight_key: self.surface.in_flight_key(),
            config: self.config(),
        }
    }
}

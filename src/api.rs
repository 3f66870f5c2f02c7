use std::sync::Arc;
use std::time::UNIX_EPOCH;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use bytes::Bytes;
use image::{codecs::jpeg::JpegEncoder, imageops, RgbImage};
use serde::Serialize;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::compose::{CompositionError, CompositionOverrides};
use crate::coordinator::{CoordinatorStatus, RenderCoordinator, RenderStatus};
use crate::health::{HealthLedger, HealthSnapshot};
use crate::ingest::{ContentEvent, IngestError, Ingestor};
use crate::surface::RenderReport;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<RenderCoordinator>,
    pub ingestor: Arc<Ingestor>,
    pub health: Arc<HealthLedger>,
    /// `/current-image` is downscaled to at most this width.
    pub web_image_max_width: u32,
    pub jpeg_quality: u8,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(&'static str),

    #[error("invalid composition settings: {0}")]
    InvalidConfig(#[from] CompositionError),

    #[error("{0}")]
    Ingest(#[from] IngestError),

    #[error("failed to encode image: {0}")]
    Encode(#[from] image::ImageError),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            ApiError::Ingest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Encode(_) | ApiError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, "request rejected");
        }
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    render: HealthSnapshot,
}

#[derive(Serialize)]
struct StatusResponse {
    has_image: bool,
    content_key: Option<String>,
    kind: Option<crate::content::ContentKind>,
    caption: Option<String>,
    has_overlay: bool,
    /// Seconds since the Unix epoch.
    rendered_at: Option<u64>,
    image_size: Option<(u32, u32)>,
    last_render: Option<RenderReport>,
    coordinator: CoordinatorStatus,
}

#[derive(Serialize)]
struct RenderResponse {
    status: RenderStatus,
}

/// Coordinator calls can block for a whole panel refresh in serialize mode.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await?)
}

fn jpeg_response(image: &RgbImage, quality: u8) -> Result<Response, ApiError> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality).encode_image(image)?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], Bytes::from(out)).into_response())
}

fn downscale(image: &RgbImage, max_width: u32) -> Option<RgbImage> {
    if max_width == 0 || image.width() <= max_width {
        return None;
    }
    let height = ((u64::from(image.height()) * u64::from(max_width)) / u64::from(image.width()))
        .max(1) as u32;
    Some(imageops::resize(
        image,
        max_width,
        height,
        imageops::FilterType::Lanczos3,
    ))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        render: state.health.snapshot(),
    })
}

async fn current_image(State(state): State<AppState>) -> Result<Response, ApiError> {
    let rendered = state
        .coordinator
        .current_rendered_image()
        .ok_or(ApiError::NotFound("nothing has been rendered yet"))?;
    let (max_width, quality) = (state.web_image_max_width, state.jpeg_quality);
    blocking(move || match downscale(&rendered.frame, max_width) {
        Some(small) => jpeg_response(&small, quality),
        None => jpeg_response(&rendered.frame, quality),
    })
    .await?
}

async fn current_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let rendered = state.coordinator.current_rendered_image();
    let coordinator = state.coordinator.status();
    let meta = rendered.as_ref().map(|r| &r.meta);
    Json(StatusResponse {
        has_image: rendered.is_some(),
        content_key: meta.map(|m| m.content_key.clone()),
        kind: meta.map(|m| m.kind),
        caption: meta.map(|m| m.caption.clone()),
        has_overlay: coordinator.overlay_key.is_some(),
        rendered_at: meta.and_then(|m| m.rendered_at.duration_since(UNIX_EPOCH).ok()).map(|d| d.as_secs()),
        image_size: rendered.as_ref().map(|r| r.frame.dimensions()),
        last_render: state.coordinator.surface().last_report(),
        coordinator,
    })
}

async fn preview(
    State(state): State<AppState>,
    Json(overrides): Json<CompositionOverrides>,
) -> Result<Response, ApiError> {
    let coordinator = state.coordinator.clone();
    let quality = state.jpeg_quality;
    blocking(move || -> Result<Response, ApiError> {
        let frame = coordinator
            .render_preview(&overrides)?
            .ok_or(ApiError::NotFound("no content to preview"))?;
        jpeg_response(&frame, quality)
    })
    .await?
}

async fn update_config(
    State(state): State<AppState>,
    Json(overrides): Json<CompositionOverrides>,
) -> Result<Json<RenderResponse>, ApiError> {
    let coordinator = state.coordinator.clone();
    let status = blocking(move || coordinator.update_config(&overrides)).await??;
    Ok(Json(RenderResponse { status }))
}

async fn post_content(
    State(state): State<AppState>,
    Json(event): Json<ContentEvent>,
) -> Result<(StatusCode, Json<RenderResponse>), ApiError> {
    let ingestor = state.ingestor.clone();
    let status = blocking(move || ingestor.handle(event)).await??;
    Ok((StatusCode::ACCEPTED, Json(RenderResponse { status })))
}

async fn clear_overlay(State(state): State<AppState>) -> Result<Json<RenderResponse>, ApiError> {
    let coordinator = state.coordinator.clone();
    let status = blocking(move || coordinator.clear_overlay()).await?;
    Ok(Json(RenderResponse { status }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/current-image", get(current_image))
        .route("/current-status", get(current_status))
        .route("/preview", post(preview))
        .route("/config", post(update_config))
        .route("/content", post(post_content))
        .route("/overlay", delete(clear_overlay))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

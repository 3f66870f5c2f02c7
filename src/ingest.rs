//! Inbound content events.
//!
//! Whatever decides what to show (a playback monitor, a calendar) posts a
//! [`ContentEvent`]; the ingestor loads its image and routes it to the main
//! slot or the overlay.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;

use crate::content::{self, ContentError, ContentKind, ContentSlot};
use crate::coordinator::{RenderCoordinator, RenderStatus};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("event for {0} carries neither image_path nor image_base64")]
    MissingImage(String),

    #[error("event for {key}: {source}")]
    Content {
        key: String,
        #[source]
        source: ContentError,
    },

    #[error("invalid overlay ttl {0}")]
    InvalidTtl(f64),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentEvent {
    pub kind: ContentKind,
    pub content_key: String,
    #[serde(default)]
    pub image_path: Option<PathBuf>,
    #[serde(default)]
    pub image_base64: Option<String>,
    #[serde(default)]
    pub caption: String,
    /// Overlay lifetime in seconds.
    #[serde(default)]
    pub ttl_secs: Option<f64>,
    /// Source-specific fields, carried for logging only.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub struct Ingestor {
    coordinator: Arc<RenderCoordinator>,
    default_overlay_ttl: Option<Duration>,
}

impl Ingestor {
    pub fn new(coordinator: Arc<RenderCoordinator>, default_overlay_ttl: Option<Duration>) -> Self {
        Self {
            coordinator,
            default_overlay_ttl,
        }
    }

    /// Load the event's image and hand it to the coordinator. On error the
    /// current content stays as it is.
    pub fn handle(&self, event: ContentEvent) -> Result<RenderStatus, IngestError> {
        let image = match (&event.image_path, &event.image_base64) {
            (Some(path), _) => content::load_image(path),
            (None, Some(data)) => content::decode_base64_image(data),
            (None, None) => return Err(IngestError::MissingImage(event.content_key)),
        }
        .map_err(|source| IngestError::Content {
            key: event.content_key.clone(),
            source,
        })?;

        let ttl = match event.ttl_secs {
            Some(secs) => Some(overlay_ttl(secs)?),
            None => self.default_overlay_ttl,
        };

        if !event.extra.is_empty() {
            tracing::debug!(key = %event.content_key, extra = ?event.extra, "content event extras");
        }
        let slot = ContentSlot::new(event.kind, event.content_key, image, event.caption);
        let status = match slot.kind() {
            ContentKind::ErrorOverlay | ContentKind::Message => {
                self.coordinator.set_overlay(slot, ttl)
            }
            ContentKind::Art | ContentKind::Anniversary => self.coordinator.set_main_content(slot),
        };
        Ok(status)
    }
}

/// A positive lifetime whose expiry instant is representable.
fn overlay_ttl(secs: f64) -> Result<Duration, IngestError> {
    if secs <= 0.0 {
        return Err(IngestError::InvalidTtl(secs));
    }
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|ttl| Instant::now().checked_add(*ttl).is_some())
        .ok_or(IngestError::InvalidTtl(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_deserialization_keeps_extras() {
        let event: ContentEvent = serde_json::from_str(
            r#"{
                "kind": "art",
                "content_key": "album-9",
                "image_path": "/tmp/cover.jpg",
                "caption": "Artist - Album",
                "zone": "Living Room"
            }"#,
        )
        .unwrap();

        assert_eq!(event.kind, ContentKind::Art);
        assert_eq!(event.image_path, Some(PathBuf::from("/tmp/cover.jpg")));
        assert_eq!(event.ttl_secs, None);
        assert_eq!(event.extra["zone"], "Living Room");
    }

    #[test]
    fn test_event_requires_kind() {
        assert!(serde_json::from_str::<ContentEvent>(r#"{"content_key": "x"}"#).is_err());
    }

    #[test]
    fn test_overlay_ttl_bounds() {
        assert_eq!(overlay_ttl(2.5).unwrap(), Duration::from_millis(2500));
        for secs in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e30, f64::MAX] {
            assert!(matches!(overlay_ttl(secs), Err(IngestError::InvalidTtl(_))), "{secs}");
        }
    }
}

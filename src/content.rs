//! Content slots and image loading.

use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContentError {
    #[error("failed to read image {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("invalid base64 image data: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("image has no pixels")]
    Empty,
}

/// What a piece of content represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Art,
    Anniversary,
    Message,
    ErrorOverlay,
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContentKind::Art => "art",
            ContentKind::Anniversary => "anniversary",
            ContentKind::Message => "message",
            ContentKind::ErrorOverlay => "error_overlay",
        };
        f.write_str(name)
    }
}

/// One unit of displayable content. Immutable after construction; a new
/// event replaces the whole slot.
#[derive(Debug, Clone)]
pub struct ContentSlot {
    kind: ContentKind,
    content_key: String,
    image: Arc<RgbImage>,
    caption: String,
    created_at: SystemTime,
}

impl ContentSlot {
    pub fn new(
        kind: ContentKind,
        content_key: impl Into<String>,
        image: RgbImage,
        caption: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            content_key: content_key.into(),
            image: Arc::new(image),
            caption: caption.into(),
            created_at: SystemTime::now(),
        }
    }

    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    pub fn content_key(&self) -> &str {
        &self.content_key
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn caption(&self) -> &str {
        &self.caption
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }
}

/// Load an image from disk, applying its EXIF orientation.
pub fn load_image(path: &Path) -> Result<RgbImage, ContentError> {
    let bytes = std::fs::read(path).map_err(|source| ContentError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    decode_image(&bytes)
}

/// Decode an encoded image (PNG, JPEG) into an owned RGB buffer, applying
/// its EXIF orientation.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, ContentError> {
    let decoded = image::load_from_memory(bytes)?.to_rgb8();
    if decoded.width() == 0 || decoded.height() == 0 {
        return Err(ContentError::Empty);
    }
    Ok(apply_orientation(decoded, exif_orientation(bytes)))
}

/// Decode base64-encoded image bytes.
pub fn decode_base64_image(data: &str) -> Result<RgbImage, ContentError> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD.decode(data.trim())?;
    decode_image(&bytes)
}

fn exif_orientation(bytes: &[u8]) -> u32 {
    let Ok(exif) = exif::Reader::new().read_from_container(&mut Cursor::new(bytes)) else {
        return 1;
    };
    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
        .unwrap_or(1)
}

fn apply_orientation(image: RgbImage, orientation: u32) -> RgbImage {
    match orientation {
        3 => imageops::rotate180(&image),
        6 => imageops::rotate90(&image),
        8 => imageops::rotate270(&image),
        _ => image,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};

    fn png_bytes(image: &RgbImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_decode_png() {
        let image = RgbImage::from_pixel(4, 3, Rgb([10, 20, 30]));
        let decoded = decode_image(&png_bytes(&image)).unwrap();
        assert_eq!(decoded, image);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(decode_image(b"not an image"), Err(ContentError::Decode(_))));
    }

    #[test]
    fn test_decode_base64() {
        use base64::Engine;
        let image = RgbImage::from_pixel(2, 2, Rgb([1, 2, 3]));
        let encoded = base64::engine::general_purpose::STANDARD.encode(png_bytes(&image));
        assert_eq!(decode_base64_image(&encoded).unwrap(), image);
    }

    #[test]
    fn test_decode_base64_rejects_invalid() {
        assert!(matches!(decode_base64_image("@@@"), Err(ContentError::Base64(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_image(Path::new("/nonexistent/cover.png")).unwrap_err();
        assert!(matches!(err, ContentError::Read { .. }));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cover.png");
        let image = RgbImage::from_pixel(5, 7, Rgb([200, 0, 0]));
        std::fs::write(&path, png_bytes(&image)).unwrap();

        assert_eq!(load_image(&path).unwrap().dimensions(), (5, 7));
    }

    #[test]
    fn test_orientation_rotates_dimensions() {
        let image = RgbImage::new(4, 2);
        assert_eq!(apply_orientation(image.clone(), 1).dimensions(), (4, 2));
        assert_eq!(apply_orientation(image.clone(), 3).dimensions(), (4, 2));
        assert_eq!(apply_orientation(image.clone(), 6).dimensions(), (2, 4));
        assert_eq!(apply_orientation(image, 8).dimensions(), (2, 4));
    }

    #[test]
    fn test_content_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&ContentKind::ErrorOverlay).unwrap(),
            "\"error_overlay\""
        );
        let kind: ContentKind = serde_json::from_str("\"anniversary\"").unwrap();
        assert_eq!(kind, ContentKind::Anniversary);
    }

    #[test]
    fn test_slot_clone_shares_pixels() {
        let slot = ContentSlot::new(ContentKind::Art, "album-1", RgbImage::new(3, 3), "Caption");
        let copy = slot.clone();
        assert!(std::ptr::eq(slot.image(), copy.image()));
        assert_eq!(copy.content_key(), "album-1");
        assert_eq!(copy.caption(), "Caption");
    }
}

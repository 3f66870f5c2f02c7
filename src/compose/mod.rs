//! Deterministic frame composition.
//!
//! `compose` turns a decoded source image and a [`CompositionConfig`] into a
//! frame of exactly `screen_width x screen_height` pixels. The pipeline runs
//! in a fixed order:
//!
//! 1. fit into a square of side `min(screen_width, screen_height)`
//! 2. apply `scale_x` / `scale_y`
//! 3. rotate by a multiple of 90 degrees
//! 4. enhance (colour balance, contrast, brightness, sharpness)
//! 5. centre on a white canvas and shift by the configured offset
//!
//! Reordering these steps changes the output bytes, and previews rely on the
//! live device receiving the same bytes for the same input.

mod enhance;

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use enhance::{apply_in_order, Enhancement, ENHANCEMENT_ORDER};

/// A fully composed, screen-sized frame.
pub type Frame = RgbImage;

/// Canvas colour behind the composed image.
pub const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);

const RESAMPLE_FILTER: FilterType = FilterType::Lanczos3;

/// Largest accepted screen edge.
pub const MAX_SCREEN_SIDE: u32 = 4096;

/// Largest accepted `scale_x` / `scale_y`. Together with
/// [`MAX_SCREEN_SIDE`] this bounds the intermediate image size.
pub const MAX_SCALE: f32 = 4.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompositionError {
    #[error("screen dimensions must be non-zero, got {width}x{height}")]
    EmptyScreen { width: u32, height: u32 },

    #[error("screen dimensions may not exceed {max}x{max}, got {width}x{height}", max = MAX_SCREEN_SIDE)]
    ScreenTooLarge { width: u32, height: u32 },

    #[error("{axis} scale must be in (0, {max}], got {value}", max = MAX_SCALE)]
    InvalidScale { axis: &'static str, value: f32 },

    #[error("rotation must be one of 0, 90, 180 or 270 degrees, got {0}")]
    InvalidRotation(u16),

    #[error("{name} factor must be a finite non-negative number, got {value}")]
    InvalidFactor { name: &'static str, value: f32 },

    #[error("screen {width}x{height} does not match the {surface_width}x{surface_height} surface")]
    SurfaceMismatch {
        width: u32,
        height: u32,
        surface_width: u32,
        surface_height: u32,
    },
}

/// Rotation applied after scaling, counter-clockwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    #[default]
    None,
    Quarter,
    Half,
    ThreeQuarter,
}

impl Rotation {
    pub fn degrees(self) -> u16 {
        match self {
            Rotation::None => 0,
            Rotation::Quarter => 90,
            Rotation::Half => 180,
            Rotation::ThreeQuarter => 270,
        }
    }

    fn apply(self, image: RgbImage) -> RgbImage {
        // imageops rotates clockwise; counter-clockwise N == clockwise 360-N.
        match self {
            Rotation::None => image,
            Rotation::Quarter => imageops::rotate270(&image),
            Rotation::Half => imageops::rotate180(&image),
            Rotation::ThreeQuarter => imageops::rotate90(&image),
        }
    }
}

impl TryFrom<u16> for Rotation {
    type Error = CompositionError;

    fn try_from(degrees: u16) -> Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Rotation::None),
            90 => Ok(Rotation::Quarter),
            180 => Ok(Rotation::Half),
            270 => Ok(Rotation::ThreeQuarter),
            other => Err(CompositionError::InvalidRotation(other)),
        }
    }
}

impl From<Rotation> for u16 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees()
    }
}

/// Geometry and enhancement settings for one render.
///
/// A plain value type: each render copies it, so a config update never races
/// a composition already underway.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositionConfig {
    pub screen_width: u32,
    pub screen_height: u32,
    pub scale_x: f32,
    pub scale_y: f32,
    pub rotation: Rotation,
    pub offset_x: i32,
    pub offset_y: i32,
    pub color_balance: f32,
    pub contrast: f32,
    pub brightness: f32,
    pub sharpness: f32,
}

impl Default for CompositionConfig {
    fn default() -> Self {
        Self {
            screen_width: 800,
            screen_height: 600,
            scale_x: 1.0,
            scale_y: 1.0,
            rotation: Rotation::None,
            offset_x: 0,
            offset_y: 0,
            color_balance: 1.0,
            contrast: 1.0,
            brightness: 1.0,
            sharpness: 1.0,
        }
    }
}

impl CompositionConfig {
    /// Reject configurations that could never produce a valid frame.
    pub fn validate(&self) -> Result<(), CompositionError> {
        if self.screen_width == 0 || self.screen_height == 0 {
            return Err(CompositionError::EmptyScreen {
                width: self.screen_width,
                height: self.screen_height,
            });
        }
        if self.screen_width > MAX_SCREEN_SIDE || self.screen_height > MAX_SCREEN_SIDE {
            return Err(CompositionError::ScreenTooLarge {
                width: self.screen_width,
                height: self.screen_height,
            });
        }
        for (axis, value) in [("x", self.scale_x), ("y", self.scale_y)] {
            if !value.is_finite() || value <= 0.0 || value > MAX_SCALE {
                return Err(CompositionError::InvalidScale { axis, value });
            }
        }
        for enhancement in ENHANCEMENT_ORDER {
            let value = enhancement.factor(self);
            if !value.is_finite() || value < 0.0 {
                return Err(CompositionError::InvalidFactor {
                    name: enhancement.name(),
                    value,
                });
            }
        }
        Ok(())
    }

    /// Check that this config produces frames a surface of the given size can
    /// show, either as-is or transposed.
    pub fn validate_for_surface(&self, (width, height): (u32, u32)) -> Result<(), CompositionError> {
        self.validate()?;
        let dims = (self.screen_width, self.screen_height);
        if dims == (width, height) || dims == (height, width) {
            Ok(())
        } else {
            Err(CompositionError::SurfaceMismatch {
                width: self.screen_width,
                height: self.screen_height,
                surface_width: width,
                surface_height: height,
            })
        }
    }

    /// Returns a copy with every field present in `overrides` replaced.
    pub fn with_overrides(&self, overrides: &CompositionOverrides) -> Self {
        Self {
            screen_width: overrides.screen_width.unwrap_or(self.screen_width),
            screen_height: overrides.screen_height.unwrap_or(self.screen_height),
            scale_x: overrides.scale_x.unwrap_or(self.scale_x),
            scale_y: overrides.scale_y.unwrap_or(self.scale_y),
            rotation: overrides.rotation.unwrap_or(self.rotation),
            offset_x: overrides.offset_x.unwrap_or(self.offset_x),
            offset_y: overrides.offset_y.unwrap_or(self.offset_y),
            color_balance: overrides.color_balance.unwrap_or(self.color_balance),
            contrast: overrides.contrast.unwrap_or(self.contrast),
            brightness: overrides.brightness.unwrap_or(self.brightness),
            sharpness: overrides.sharpness.unwrap_or(self.sharpness),
        }
    }
}

/// Field-by-field overrides merged onto a base [`CompositionConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompositionOverrides {
    pub screen_width: Option<u32>,
    pub screen_height: Option<u32>,
    pub scale_x: Option<f32>,
    pub scale_y: Option<f32>,
    pub rotation: Option<Rotation>,
    pub offset_x: Option<i32>,
    pub offset_y: Option<i32>,
    pub color_balance: Option<f32>,
    pub contrast: Option<f32>,
    pub brightness: Option<f32>,
    pub sharpness: Option<f32>,
}

impl CompositionOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Compose `image` into a screen-sized frame. Never mutates `image`.
///
/// The config is expected to have passed [`CompositionConfig::validate`].
pub fn compose(image: &RgbImage, config: &CompositionConfig) -> Frame {
    let side = config.screen_width.min(config.screen_height);
    let fitted = fit_to_square(image, side);
    let scaled = apply_scale(fitted, config.scale_x, config.scale_y);
    let rotated = config.rotation.apply(scaled);
    let enhanced = enhance::apply_all(rotated, config);
    place_on_canvas(&enhanced, config)
}

/// Size of `(width, height)` scaled so its longer edge equals `side`.
pub fn fit_dimensions(width: u32, height: u32, side: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (side, side);
    }
    let (long, short) = if width >= height { (width, height) } else { (height, width) };
    let scaled_short = ((u64::from(short) * u64::from(side) + u64::from(long) / 2) / u64::from(long)) as u32;
    let scaled_short = scaled_short.max(1);
    if width >= height {
        (side, scaled_short)
    } else {
        (scaled_short, side)
    }
}

fn fit_to_square(image: &RgbImage, side: u32) -> RgbImage {
    let (width, height) = fit_dimensions(image.width(), image.height(), side);
    if (width, height) == image.dimensions() {
        return image.clone();
    }
    imageops::resize(image, width, height, RESAMPLE_FILTER)
}

#[allow(clippy::float_cmp)]
fn apply_scale(image: RgbImage, scale_x: f32, scale_y: f32) -> RgbImage {
    if scale_x == 1.0 && scale_y == 1.0 {
        return image;
    }
    let width = ((image.width() as f32 * scale_x) as u32).max(1);
    let height = ((image.height() as f32 * scale_y) as u32).max(1);
    imageops::resize(&image, width, height, RESAMPLE_FILTER)
}

fn place_on_canvas(image: &RgbImage, config: &CompositionConfig) -> Frame {
    let mut canvas = RgbImage::from_pixel(config.screen_width, config.screen_height, BACKGROUND);
    let x = (i64::from(config.screen_width) - i64::from(image.width())).div_euclid(2)
        + i64::from(config.offset_x);
    let y = (i64::from(config.screen_height) - i64::from(image.height())).div_euclid(2)
        + i64::from(config.offset_y);
    imageops::replace(&mut canvas, image, x, y);
    canvas
}

//! Blend-based image enhancements.
//!
//! Each enhancement blends the image against a "degenerate" version of itself:
//! `out = degenerate + factor * (image - degenerate)`. A factor of 1.0 returns
//! the image unchanged, 0.0 returns the degenerate image, and values above 1.0
//! extrapolate away from it.

use image::{Rgb, RgbImage};

use super::CompositionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enhancement {
    /// Degenerate: grayscale copy.
    ColorBalance,
    /// Degenerate: uniform image at the mean luma.
    Contrast,
    /// Degenerate: black.
    Brightness,
    /// Degenerate: 3x3 smoothed copy.
    Sharpness,
}

/// The order enhancements are applied in.
pub const ENHANCEMENT_ORDER: [Enhancement; 4] = [
    Enhancement::ColorBalance,
    Enhancement::Contrast,
    Enhancement::Brightness,
    Enhancement::Sharpness,
];

impl Enhancement {
    pub fn name(self) -> &'static str {
        match self {
            Enhancement::ColorBalance => "color_balance",
            Enhancement::Contrast => "contrast",
            Enhancement::Brightness => "brightness",
            Enhancement::Sharpness => "sharpness",
        }
    }

    pub fn factor(self, config: &CompositionConfig) -> f32 {
        match self {
            Enhancement::ColorBalance => config.color_balance,
            Enhancement::Contrast => config.contrast,
            Enhancement::Brightness => config.brightness,
            Enhancement::Sharpness => config.sharpness,
        }
    }

    pub fn apply(self, image: &RgbImage, factor: f32) -> RgbImage {
        let degenerate = match self {
            Enhancement::ColorBalance => grayscale(image),
            Enhancement::Contrast => {
                let mean = mean_luma(image);
                RgbImage::from_pixel(image.width(), image.height(), Rgb([mean, mean, mean]))
            }
            Enhancement::Brightness => RgbImage::new(image.width(), image.height()),
            Enhancement::Sharpness => smooth(image),
        };
        blend(&degenerate, image, factor)
    }
}

/// Apply every enhancement in [`ENHANCEMENT_ORDER`], skipping factors of
/// exactly 1.0.
pub(super) fn apply_all(image: RgbImage, config: &CompositionConfig) -> RgbImage {
    apply_in_order(image, config, &ENHANCEMENT_ORDER)
}

/// Apply enhancements in an arbitrary order. Exposed so callers can observe
/// that the order matters.
#[allow(clippy::float_cmp)]
pub fn apply_in_order(
    image: RgbImage,
    config: &CompositionConfig,
    order: &[Enhancement],
) -> RgbImage {
    order.iter().fold(image, |current, enhancement| {
        let factor = enhancement.factor(config);
        if factor == 1.0 {
            current
        } else {
            enhancement.apply(&current, factor)
        }
    })
}

fn luma(pixel: &Rgb<u8>) -> u8 {
    let [r, g, b] = pixel.0;
    ((u32::from(r) * 19595 + u32::from(g) * 38470 + u32::from(b) * 7471 + 0x8000) >> 16) as u8
}

fn grayscale(image: &RgbImage) -> RgbImage {
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let l = luma(image.get_pixel(x, y));
        Rgb([l, l, l])
    })
}

fn mean_luma(image: &RgbImage) -> u8 {
    let count = u64::from(image.width()) * u64::from(image.height());
    if count == 0 {
        return 0;
    }
    let sum: u64 = image.pixels().map(|p| u64::from(luma(p))).sum();
    ((sum as f64 / count as f64) + 0.5) as u8
}

const SMOOTH_KERNEL: [u32; 9] = [1, 1, 1, 1, 5, 1, 1, 1, 1];
const SMOOTH_SCALE: u32 = 13;

fn smooth(image: &RgbImage) -> RgbImage {
    let (width, height) = image.dimensions();
    let mut out = image.clone();
    if width < 3 || height < 3 {
        return out;
    }
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let mut acc = [0u32; 3];
            for (i, weight) in SMOOTH_KERNEL.iter().enumerate() {
                let px = image.get_pixel(x + (i as u32 % 3) - 1, y + (i as u32 / 3) - 1);
                for (channel, value) in acc.iter_mut().zip(px.0) {
                    *channel += weight * u32::from(value);
                }
            }
            let pixel = acc.map(|sum| ((sum + SMOOTH_SCALE / 2) / SMOOTH_SCALE).min(255) as u8);
            out.put_pixel(x, y, Rgb(pixel));
        }
    }
    out
}

fn blend(degenerate: &RgbImage, image: &RgbImage, factor: f32) -> RgbImage {
    let mut out = image.clone();
    for (dst, (d, i)) in out
        .pixels_mut()
        .zip(degenerate.pixels().zip(image.pixels()))
    {
        for c in 0..3 {
            let base = f32::from(d.0[c]);
            let value = base + factor * (f32::from(i.0[c]) - base);
            dst.0[c] = value.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RgbImage {
        RgbImage::from_fn(16, 12, |x, y| {
            Rgb([(x * 16) as u8, (y * 20) as u8, ((x * y) % 256) as u8])
        })
    }

    #[test]
    fn test_brightness_zero_is_black() {
        let out = Enhancement::Brightness.apply(&sample(), 0.0);
        assert!(out.pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn test_brightness_half() {
        let image = RgbImage::from_pixel(2, 2, Rgb([100, 201, 40]));
        let out = Enhancement::Brightness.apply(&image, 0.5);
        assert_eq!(*out.get_pixel(0, 0), Rgb([50, 101, 20]));
    }

    #[test]
    fn test_color_balance_zero_is_grayscale() {
        let out = Enhancement::ColorBalance.apply(&sample(), 0.0);
        assert!(out.pixels().all(|p| p.0[0] == p.0[1] && p.0[1] == p.0[2]));
    }

    #[test]
    fn test_contrast_zero_is_uniform() {
        let out = Enhancement::Contrast.apply(&sample(), 0.0);
        let first = *out.get_pixel(0, 0);
        assert!(out.pixels().all(|p| *p == first));
    }

    #[test]
    fn test_contrast_clamps() {
        let image = RgbImage::from_fn(2, 1, |x, _| if x == 0 { Rgb([0, 0, 0]) } else { Rgb([255, 255, 255]) });
        let out = Enhancement::Contrast.apply(&image, 4.0);
        assert_eq!(*out.get_pixel(0, 0), Rgb([0, 0, 0]));
        assert_eq!(*out.get_pixel(1, 0), Rgb([255, 255, 255]));
    }

    #[test]
    fn test_sharpness_keeps_border() {
        let image = sample();
        let out = Enhancement::Sharpness.apply(&image, 2.0);
        assert_eq!(out.get_pixel(0, 0), image.get_pixel(0, 0));
        assert_eq!(out.get_pixel(15, 11), image.get_pixel(15, 11));
    }

    #[test]
    fn test_unit_factors_are_skipped() {
        let image = sample();
        let out = apply_all(image.clone(), &CompositionConfig::default());
        assert_eq!(out, image);
    }

    #[test]
    fn test_enhancement_order_matters() {
        let config = CompositionConfig {
            brightness: 0.5,
            contrast: 1.5,
            ..CompositionConfig::default()
        };
        let image = sample();

        let forward = apply_in_order(image.clone(), &config, &ENHANCEMENT_ORDER);
        let mut reversed_order = ENHANCEMENT_ORDER;
        reversed_order.reverse();
        let reversed = apply_in_order(image, &config, &reversed_order);

        assert_ne!(forward.as_raw(), reversed.as_raw());
    }
}

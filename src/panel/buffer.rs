//! Conversion from RGB frames to the panel's packed 4-bit palette format.

use image::{imageops, Rgb, RgbImage};
use thiserror::Error;

use super::controller::PanelGeometry;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("frame is {width}x{height}, panel expects {expected_width}x{expected_height} or its transpose")]
    Dimensions {
        width: u32,
        height: u32,
        expected_width: u32,
        expected_height: u32,
    },
}

/// The colours the panel can show, at their native palette indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PanelColor {
    Black = 0,
    White = 1,
    Yellow = 2,
    Red = 3,
    Blue = 5,
    Green = 6,
}

impl PanelColor {
    pub const ALL: [PanelColor; 6] = [
        PanelColor::Black,
        PanelColor::White,
        PanelColor::Yellow,
        PanelColor::Red,
        PanelColor::Blue,
        PanelColor::Green,
    ];

    pub fn index(self) -> u8 {
        self as u8
    }

    /// The RGB value the panel actually produces for this colour.
    pub fn rgb(self) -> [u8; 3] {
        match self {
            PanelColor::Black => [0, 0, 0],
            PanelColor::White => [255, 255, 255],
            PanelColor::Yellow => [255, 236, 35],
            PanelColor::Red => [209, 0, 0],
            PanelColor::Blue => [35, 35, 255],
            PanelColor::Green => [0, 208, 65],
        }
    }

    fn nearest(r: f32, g: f32, b: f32) -> PanelColor {
        let mut best = PanelColor::Black;
        let mut best_dist = f32::MAX;
        for color in Self::ALL {
            let [pr, pg, pb] = color.rgb().map(f32::from);
            let dist = (r - pr).powi(2) + (g - pg).powi(2) + (b - pb).powi(2);
            if dist < best_dist {
                best = color;
                best_dist = dist;
            }
        }
        best
    }
}

/// Which half of a row a transfer carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowHalf {
    Left,
    Right,
}

/// Packed frame, two pixels per byte, high nibble first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelBuffer {
    geometry: PanelGeometry,
    data: Vec<u8>,
}

impl PanelBuffer {
    /// Quantise `frame` to the panel palette and pack it. A frame with the
    /// panel's transposed dimensions is turned a quarter counter-clockwise.
    pub fn from_frame(
        frame: &RgbImage,
        geometry: PanelGeometry,
        dither: bool,
    ) -> Result<Self, BufferError> {
        let (width, height) = (geometry.width, geometry.height);
        let rotated;
        let frame = match frame.dimensions() {
            (w, h) if (w, h) == (width, height) => frame,
            (w, h) if (w, h) == (height, width) => {
                rotated = imageops::rotate270(frame);
                &rotated
            }
            (w, h) => {
                return Err(BufferError::Dimensions {
                    width: w,
                    height: h,
                    expected_width: width,
                    expected_height: height,
                })
            }
        };

        let indices = quantize(frame, dither);
        let data = indices
            .chunks_exact(2)
            .map(|pair| (pair[0] << 4) | pair[1])
            .collect();
        Ok(Self { geometry, data })
    }

    /// A buffer of a single colour.
    pub fn filled(geometry: PanelGeometry, color: PanelColor) -> Self {
        let byte = (color.index() << 4) | color.index();
        Self {
            geometry,
            data: vec![byte; geometry.buffer_len()],
        }
    }

    pub fn geometry(&self) -> PanelGeometry {
        self.geometry
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Bytes of one half of `row`.
    pub fn half_row(&self, row: u32, half: RowHalf) -> &[u8] {
        let row_len = self.geometry.row_bytes();
        let half_len = self.geometry.half_row_bytes();
        let start = row as usize * row_len
            + match half {
                RowHalf::Left => 0,
                RowHalf::Right => half_len,
            };
        &self.data[start..start + half_len]
    }

    /// Palette index of the pixel at `(x, y)`.
    pub fn index_at(&self, x: u32, y: u32) -> u8 {
        let offset = (y as usize * self.geometry.width as usize + x as usize) / 2;
        let byte = self.data[offset];
        if x % 2 == 0 {
            byte >> 4
        } else {
            byte & 0x0F
        }
    }
}

fn quantize(frame: &RgbImage, dither: bool) -> Vec<u8> {
    let width = frame.width() as usize;
    let mut out = Vec::with_capacity(width * frame.height() as usize);

    if !dither {
        out.extend(frame.pixels().map(|Rgb([r, g, b])| {
            PanelColor::nearest(f32::from(*r), f32::from(*g), f32::from(*b)).index()
        }));
        return out;
    }

    // Floyd-Steinberg: error carried into the current and next row.
    let mut current = vec![[0f32; 3]; width];
    let mut next = vec![[0f32; 3]; width];
    for row in frame.rows() {
        for (x, pixel) in row.enumerate() {
            let wanted: [f32; 3] =
                std::array::from_fn(|c| (f32::from(pixel.0[c]) + current[x][c]).clamp(0.0, 255.0));
            let color = PanelColor::nearest(wanted[0], wanted[1], wanted[2]);
            out.push(color.index());

            let actual = color.rgb();
            for c in 0..3 {
                let err = wanted[c] - f32::from(actual[c]);
                if x + 1 < width {
                    current[x + 1][c] += err * 7.0 / 16.0;
                    next[x + 1][c] += err * 1.0 / 16.0;
                }
                if x > 0 {
                    next[x - 1][c] += err * 3.0 / 16.0;
                }
                next[x][c] += err * 5.0 / 16.0;
            }
        }
        std::mem::swap(&mut current, &mut next);
        next.iter_mut().for_each(|e| *e = [0.0; 3]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> PanelGeometry {
        PanelGeometry { width: 8, height: 4 }
    }

    #[test]
    fn test_exact_palette_colours_map_to_indices() {
        let frame = RgbImage::from_fn(8, 4, |x, _| match x {
            0 => Rgb([0, 0, 0]),
            1 => Rgb([255, 255, 255]),
            2 => Rgb([255, 236, 35]),
            3 => Rgb([209, 0, 0]),
            4 => Rgb([35, 35, 255]),
            5 => Rgb([0, 208, 65]),
            _ => Rgb([250, 250, 250]),
        });

        let buffer = PanelBuffer::from_frame(&frame, geometry(), false).unwrap();

        let row: Vec<u8> = (0..8).map(|x| buffer.index_at(x, 0)).collect();
        assert_eq!(row, vec![0, 1, 2, 3, 5, 6, 1, 1]);
        assert_eq!(buffer.as_bytes()[0], 0x01);
        assert_eq!(buffer.as_bytes()[1], 0x23);
    }

    #[test]
    fn test_half_rows_split_each_row() {
        let frame = RgbImage::from_fn(8, 4, |x, _| {
            if x < 4 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        let buffer = PanelBuffer::from_frame(&frame, geometry(), false).unwrap();

        assert_eq!(buffer.half_row(2, RowHalf::Left), &[0x00, 0x00]);
        assert_eq!(buffer.half_row(2, RowHalf::Right), &[0x11, 0x11]);
    }

    #[test]
    fn test_transposed_frame_is_rotated() {
        // 4x8 frame, top row red. After a counter-clockwise quarter turn the
        // top row becomes the left column.
        let frame = RgbImage::from_fn(4, 8, |_, y| {
            if y == 0 {
                Rgb([209, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });

        let buffer = PanelBuffer::from_frame(&frame, geometry(), false).unwrap();

        for y in 0..4 {
            assert_eq!(buffer.index_at(0, y), PanelColor::Red.index());
            assert_eq!(buffer.index_at(1, y), PanelColor::White.index());
        }
    }

    #[test]
    fn test_wrong_size_is_rejected() {
        let frame = RgbImage::new(6, 4);
        assert!(matches!(
            PanelBuffer::from_frame(&frame, geometry(), true),
            Err(BufferError::Dimensions { width: 6, height: 4, .. })
        ));
    }

    #[test]
    fn test_dithering_mixes_colours_for_midtones() {
        let frame = RgbImage::from_pixel(8, 4, Rgb([128, 128, 128]));

        let flat = PanelBuffer::from_frame(&frame, geometry(), false).unwrap();
        let dithered = PanelBuffer::from_frame(&frame, geometry(), true).unwrap();

        let distinct = |b: &PanelBuffer| {
            let mut seen: Vec<u8> = (0..4)
                .flat_map(|y| (0..8).map(move |x| (x, y)))
                .map(|(x, y)| b.index_at(x, y))
                .collect();
            seen.sort_unstable();
            seen.dedup();
            seen.len()
        };
        assert_eq!(distinct(&flat), 1);
        assert!(distinct(&dithered) > 1);
    }

    #[test]
    fn test_filled_buffer() {
        let buffer = PanelBuffer::filled(geometry(), PanelColor::White);
        assert_eq!(buffer.as_bytes().len(), 16);
        assert!(buffer.as_bytes().iter().all(|b| *b == 0x11));
    }
}

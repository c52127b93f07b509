//! Local binary pattern (LBP) face encoder.
//!
//! Normalizes a face crop to a fixed grayscale square, codes every pixel by
//! thresholding its 8-neighbourhood against the centre, and concatenates one
//! L1-normalized 256-bin histogram per grid cell into a [`Signature`].
//! Neighbour comparisons make the code insensitive to uniform brightness shifts.

use crate::crop::{self, FaceCrop, PixelLayout};
use crate::types::{Signature, CELL_BINS};
use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_GRID: u32 = 8;
const DEFAULT_CELL_SIZE: u32 = 16;
const DEFAULT_RADIUS: u32 = 1;

/// Neighbour directions (dx, dy) for bits 7 down to 0: clockwise from top-left.
const NEIGHBOR_DIRECTIONS: [(isize, isize); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
];

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("encoding failure: crop {width}x{height} is smaller than one {cell_size}px grid cell")]
    CropTooSmall {
        width: u32,
        height: u32,
        cell_size: u32,
    },
    #[error("encoding failure: {layout:?} buffer has {actual} bytes, expected {expected}")]
    InvalidLength {
        layout: PixelLayout,
        expected: usize,
        actual: usize,
    },
    #[error("encoding failure: face box lies outside the {width}x{height} frame")]
    OutsideFrame { width: u32, height: u32 },
    #[error("encoding failure: invalid encoder parameters: {0}")]
    InvalidParams(String),
}

/// Parameters that determine signature layout. Signatures produced with
/// different parameters are not comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EncoderParams {
    /// Cells per side of the square grid.
    pub grid: u32,
    /// Side of one cell in code-image pixels.
    pub cell_size: u32,
    /// Neighbourhood radius in pixels.
    pub radius: u32,
    /// Apply global histogram equalization before coding.
    pub equalize: bool,
}

impl Default for EncoderParams {
    fn default() -> Self {
        Self {
            grid: DEFAULT_GRID,
            cell_size: DEFAULT_CELL_SIZE,
            radius: DEFAULT_RADIUS,
            equalize: true,
        }
    }
}

impl EncoderParams {
    pub fn validate(&self) -> Result<(), EncodeError> {
        if self.grid == 0 || self.grid > 32 {
            return Err(EncodeError::InvalidParams(format!(
                "grid must be in 1..=32, got {}",
                self.grid
            )));
        }
        if self.cell_size < 2 || self.cell_size > 128 {
            return Err(EncodeError::InvalidParams(format!(
                "cell_size must be in 2..=128, got {}",
                self.cell_size
            )));
        }
        if self.radius == 0 || self.radius > 8 {
            return Err(EncodeError::InvalidParams(format!(
                "radius must be in 1..=8, got {}",
                self.radius
            )));
        }
        Ok(())
    }

    /// Side of the normalized square crop: the code image tiles exactly into cells.
    pub fn normalized_side(&self) -> u32 {
        self.grid * self.cell_size + 2 * self.radius
    }

    pub fn signature_len(&self) -> usize {
        (self.grid * self.grid) as usize * CELL_BINS
    }
}

/// Converts face crops into texture signatures.
#[derive(Debug, Clone)]
pub struct Encoder {
    params: EncoderParams,
}

impl Encoder {
    pub fn new(params: EncoderParams) -> Result<Self, EncodeError> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &EncoderParams {
        &self.params
    }

    pub fn signature_len(&self) -> usize {
        self.params.signature_len()
    }

    /// Encode one crop. Identical crops always yield identical signatures.
    pub fn encode(&self, face: &FaceCrop) -> Result<Signature, EncodeError> {
        let cell = self.params.cell_size;
        if face.width < cell || face.height < cell {
            return Err(EncodeError::CropTooSmall {
                width: face.width,
                height: face.height,
                cell_size: cell,
            });
        }

        let gray = face.to_gray()?;
        let mut normalized = self.normalize(gray, face.width, face.height, face.layout)?;
        if self.params.equalize {
            crop::equalize_histogram(&mut normalized);
        }

        let side = self.params.normalized_side() as usize;
        let radius = self.params.radius as usize;
        let codes = lbp_codes(&normalized, side, side, radius);
        let values = self.cell_histograms(&codes, side - 2 * radius);

        tracing::trace!(len = values.len(), "encoded face crop");
        Ok(Signature::new(values))
    }

    /// Resize to the normalized square. Crops already at size are used as-is.
    fn normalize(
        &self,
        gray: Vec<u8>,
        width: u32,
        height: u32,
        layout: PixelLayout,
    ) -> Result<Vec<u8>, EncodeError> {
        let side = self.params.normalized_side();
        if width == side && height == side {
            return Ok(gray);
        }

        let actual = gray.len();
        let image = GrayImage::from_raw(width, height, gray).ok_or(EncodeError::InvalidLength {
            layout,
            expected: width as usize * height as usize,
            actual,
        })?;

        Ok(imageops::resize(&image, side, side, FilterType::Triangle).into_raw())
    }

    /// One L1-normalized 256-bin histogram per cell, row-major over the grid.
    fn cell_histograms(&self, codes: &[u8], code_side: usize) -> Vec<f32> {
        let grid = self.params.grid as usize;
        let cell = self.params.cell_size as usize;
        let norm = 1.0 / (cell * cell) as f32;

        let mut values = vec![0.0f32; grid * grid * CELL_BINS];
        let mut counts = [0u32; CELL_BINS];

        for cy in 0..grid {
            for cx in 0..grid {
                counts.fill(0);
                for y in cy * cell..(cy + 1) * cell {
                    let row = &codes[y * code_side + cx * cell..][..cell];
                    for &code in row {
                        counts[code as usize] += 1;
                    }
                }

                let out = &mut values[(cy * grid + cx) * CELL_BINS..][..CELL_BINS];
                for (v, &c) in out.iter_mut().zip(counts.iter()) {
                    *v = c as f32 * norm;
                }
            }
        }

        values
    }
}

/// Compute the LBP code image, `(width - 2r) x (height - 2r)`.
///
/// Windowed formulation: for each neighbour direction the shifted window is
/// compared row-slice against the centre window and the result OR-ed into
/// the code buffer. Produces exactly the per-pixel definition.
fn lbp_codes(gray: &[u8], width: usize, height: usize, radius: usize) -> Vec<u8> {
    let out_w = width - 2 * radius;
    let out_h = height - 2 * radius;
    let mut codes = vec![0u8; out_w * out_h];

    for (i, &(dx, dy)) in NEIGHBOR_DIRECTIONS.iter().enumerate() {
        let shift = 7 - i;
        let sx = (radius as isize + dx * radius as isize) as usize;
        let sy = (radius as isize + dy * radius as isize) as usize;

        for y in 0..out_h {
            let center = &gray[(y + radius) * width + radius..][..out_w];
            let neighbor = &gray[(y + sy) * width + sx..][..out_w];
            let out = &mut codes[y * out_w..][..out_w];
            for ((code, &c), &n) in out.iter_mut().zip(center).zip(neighbor) {
                *code |= u8::from(n >= c) << shift;
            }
        }
    }

    codes
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Direct per-pixel definition used to check the windowed pass.
    fn lbp_direct(gray: &[u8], width: usize, height: usize, radius: usize) -> Vec<u8> {
        let r = radius as isize;
        let mut out = Vec::new();
        for y in r..(height as isize - r) {
            for x in r..(width as isize - r) {
                let c = gray[y as usize * width + x as usize];
                let mut code = 0u8;
                for &(dx, dy) in NEIGHBOR_DIRECTIONS.iter() {
                    let n = gray[(y + dy * r) as usize * width + (x + dx * r) as usize];
                    code = (code << 1) | u8::from(n >= c);
                }
                out.push(code);
            }
        }
        out
    }

    fn textured(width: u32, height: u32, seed: u32) -> Vec<u8> {
        (0..width * height)
            .map(|i| {
                let (x, y) = (i % width, i / width);
                ((x * 7 + y * 13 + seed) ^ (x * y / 3)).wrapping_mul(2654435761) as u8 >> 1
            })
            .collect()
    }

    fn encoder() -> Encoder {
        Encoder::new(EncoderParams::default()).unwrap()
    }

    #[test]
    fn test_windowed_matches_direct_radius_1() {
        let gray = textured(40, 30, 1);
        assert_eq!(lbp_codes(&gray, 40, 30, 1), lbp_direct(&gray, 40, 30, 1));
    }

    #[test]
    fn test_windowed_matches_direct_radius_3() {
        let gray = textured(33, 41, 9);
        assert_eq!(lbp_codes(&gray, 33, 41, 3), lbp_direct(&gray, 33, 41, 3));
    }

    #[test]
    fn test_flat_image_codes_all_ones() {
        // Every neighbour equals the centre, so every bit is set.
        let gray = vec![90u8; 10 * 10];
        assert!(lbp_codes(&gray, 10, 10, 1).iter().all(|&c| c == 0xFF));
    }

    #[test]
    fn test_bit_order_top_left_is_msb() {
        // 3x3 with only the top-left neighbour brighter than the centre.
        let gray = vec![
            200, 0, 0, //
            0, 100, 0, //
            0, 0, 0,
        ];
        assert_eq!(lbp_codes(&gray, 3, 3, 1), vec![0b1000_0000]);
    }

    #[test]
    fn test_signature_length() {
        let enc = encoder();
        let crop = FaceCrop::from_gray(100, 120, textured(100, 120, 3));
        let sig = enc.encode(&crop).unwrap();
        assert_eq!(sig.len(), 8 * 8 * 256);
        assert_eq!(sig.len(), enc.signature_len());
    }

    #[test]
    fn test_cell_histograms_sum_to_one() {
        let enc = encoder();
        let crop = FaceCrop::from_gray(150, 150, textured(150, 150, 5));
        let sig = enc.encode(&crop).unwrap();
        for (i, cell) in sig.cells().enumerate() {
            let sum: f32 = cell.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4, "cell {i} sums to {sum}");
            assert!(cell.iter().all(|&v| v >= 0.0));
        }
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let enc = encoder();
        let crop = FaceCrop::from_gray(90, 110, textured(90, 110, 7));
        assert_eq!(enc.encode(&crop).unwrap(), enc.encode(&crop).unwrap());
    }

    #[test]
    fn test_uniform_brightness_shift_invariant() {
        let enc = Encoder::new(EncoderParams {
            equalize: false,
            ..EncoderParams::default()
        })
        .unwrap();
        let side = enc.params().normalized_side();
        let base: Vec<u8> = textured(side, side, 11).iter().map(|&p| p / 2).collect();
        let shifted: Vec<u8> = base.iter().map(|&p| p + 60).collect();

        let a = enc.encode(&FaceCrop::from_gray(side, side, base)).unwrap();
        let b = enc.encode(&FaceCrop::from_gray(side, side, shifted)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_crop_smaller_than_cell_fails() {
        let enc = encoder();
        let crop = FaceCrop::from_gray(10, 40, vec![0; 400]);
        assert!(matches!(
            enc.encode(&crop),
            Err(EncodeError::CropTooSmall { width: 10, height: 40, cell_size: 16 })
        ));
    }

    #[test]
    fn test_malformed_buffer_fails() {
        let enc = encoder();
        let crop = FaceCrop::from_gray(20, 20, vec![0; 100]);
        assert!(matches!(enc.encode(&crop), Err(EncodeError::InvalidLength { .. })));
    }

    #[test]
    fn test_invalid_params_rejected() {
        let params = EncoderParams {
            radius: 0,
            ..EncoderParams::default()
        };
        assert!(matches!(Encoder::new(params), Err(EncodeError::InvalidParams(_))));
    }

    #[test]
    fn test_normalized_side() {
        assert_eq!(EncoderParams::default().normalized_side(), 130);
    }
}

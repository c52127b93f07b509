//! Enrollment sample quality: sharpness, exposure and size of a face crop.

use serde::Serialize;

/// Laplacian variance at which sharpness saturates to 1.0.
const SHARPNESS_SATURATION: f32 = 500.0;
/// Shorter crop side (pixels) at which the size factor saturates to 1.0.
const MIN_FULL_QUALITY_SIDE: f32 = 64.0;
const SHARPNESS_WEIGHT: f32 = 0.6;
const BRIGHTNESS_WEIGHT: f32 = 0.4;

/// Component scores of one crop, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityScore {
    pub sharpness: f32,
    pub brightness: f32,
    pub size: f32,
    /// `(0.6 * sharpness + 0.4 * brightness) * size`.
    pub score: f32,
}

/// Score a grayscale crop of `width * height` bytes.
pub fn assess(gray: &[u8], width: u32, height: u32) -> QualityScore {
    let (w, h) = (width as usize, height as usize);
    if w == 0 || h == 0 || gray.len() < w * h {
        return QualityScore {
            sharpness: 0.0,
            brightness: 0.0,
            size: 0.0,
            score: 0.0,
        };
    }

    let sharpness = (laplacian_variance(gray, w, h) / SHARPNESS_SATURATION).min(1.0);

    let mean = gray[..w * h].iter().map(|&p| p as f32).sum::<f32>() / (w * h) as f32;
    let brightness = (1.0 - ((mean / 255.0) - 0.5).abs() * 2.0).clamp(0.0, 1.0);

    let size = (w.min(h) as f32 / MIN_FULL_QUALITY_SIDE).min(1.0);

    let score = (SHARPNESS_WEIGHT * sharpness + BRIGHTNESS_WEIGHT * brightness) * size;

    QualityScore {
        sharpness,
        brightness,
        size,
        score,
    }
}

/// Variance of the 4-neighbour Laplacian over interior pixels.
fn laplacian_variance(gray: &[u8], w: usize, h: usize) -> f32 {
    if w < 3 || h < 3 {
        return 0.0;
    }

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let n = ((w - 2) * (h - 2)) as f64;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let c = gray[y * w + x] as i32;
            let lap = gray[(y - 1) * w + x] as i32
                + gray[(y + 1) * w + x] as i32
                + gray[y * w + x - 1] as i32
                + gray[y * w + x + 1] as i32
                - 4 * c;
            let v = lap as f64;
            sum += v;
            sum_sq += v * v;
        }
    }

    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0) as f32
}

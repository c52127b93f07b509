//! Face crops handed over by the external detector, grayscale conversion,
//! and global histogram equalization.

use crate::encoder::EncodeError;
use crate::types::BoundingBox;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Memory layout of a crop's pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelLayout {
    /// 8-bit grayscale (1 byte/pixel).
    Gray8,
    /// Packed RGB (3 bytes/pixel).
    Rgb8,
    /// Packed BGR (3 bytes/pixel, common camera/OpenCV order).
    Bgr8,
    /// Packed RGBA (4 bytes/pixel, alpha ignored).
    Rgba8,
    /// YUYV 4:2:2 packed (2 bytes/pixel, Y channel extracted).
    Yuyv,
}

impl PixelLayout {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelLayout::Gray8 => 1,
            PixelLayout::Yuyv => 2,
            PixelLayout::Rgb8 | PixelLayout::Bgr8 => 3,
            PixelLayout::Rgba8 => 4,
        }
    }
}

/// A localized face region and the box it was cut from.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    pub bbox: BoundingBox,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub pixels: Vec<u8>,
}

impl FaceCrop {
    pub fn new(
        bbox: BoundingBox,
        width: u32,
        height: u32,
        layout: PixelLayout,
        pixels: Vec<u8>,
    ) -> Self {
        Self {
            bbox,
            width,
            height,
            layout,
            pixels,
        }
    }

    /// Grayscale crop whose box is its own extent at the origin.
    pub fn from_gray(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        let bbox = BoundingBox::new(0.0, 0.0, width as f32, height as f32);
        Self::new(bbox, width, height, PixelLayout::Gray8, pixels)
    }

    /// Whole decoded image as a crop, e.g. a pre-cropped enrollment photo.
    pub fn from_image(image: &DynamicImage) -> Self {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        let bbox = BoundingBox::new(0.0, 0.0, width as f32, height as f32);
        Self::new(bbox, width, height, PixelLayout::Rgb8, rgb.into_raw())
    }

    /// Cut the region under `bbox` out of a full frame.
    ///
    /// The box is grown by `padding` (fraction of its width/height on each
    /// side) and clamped to the frame. The returned crop keeps the original,
    /// unpadded box so tracking sees the detector's geometry.
    pub fn from_frame(
        frame: &DynamicImage,
        bbox: BoundingBox,
        padding: f32,
    ) -> Result<Self, EncodeError> {
        let (frame_w, frame_h) = (frame.width(), frame.height());
        let pad_w = bbox.width * padding;
        let pad_h = bbox.height * padding;

        let x1 = (bbox.x - pad_w).floor().max(0.0);
        let y1 = (bbox.y - pad_h).floor().max(0.0);
        let x2 = (bbox.x + bbox.width + pad_w).ceil().min(frame_w as f32);
        let y2 = (bbox.y + bbox.height + pad_h).ceil().min(frame_h as f32);

        if x2 <= x1 || y2 <= y1 {
            return Err(EncodeError::OutsideFrame {
                width: frame_w,
                height: frame_h,
            });
        }

        let (x, y) = (x1 as u32, y1 as u32);
        let (w, h) = ((x2 - x1) as u32, (y2 - y1) as u32);
        let rgb = frame.crop_imm(x, y, w, h).to_rgb8();

        Ok(Self::new(bbox, w, h, PixelLayout::Rgb8, rgb.into_raw()))
    }

    /// Convert the pixel buffer to 8-bit grayscale (`width * height` bytes).
    pub fn to_gray(&self) -> Result<Vec<u8>, EncodeError> {
        let pixels = self.width as usize * self.height as usize;
        let expected = pixels * self.layout.bytes_per_pixel();
        if self.pixels.len() != expected {
            return Err(EncodeError::InvalidLength {
                layout: self.layout,
                expected,
                actual: self.pixels.len(),
            });
        }

        let gray = match self.layout {
            PixelLayout::Gray8 => self.pixels.clone(),
            PixelLayout::Yuyv => self.pixels.iter().step_by(2).copied().collect(),
            PixelLayout::Rgb8 => self
                .pixels
                .chunks_exact(3)
                .map(|p| luma(p[0], p[1], p[2]))
                .collect(),
            PixelLayout::Bgr8 => self
                .pixels
                .chunks_exact(3)
                .map(|p| luma(p[2], p[1], p[0]))
                .collect(),
            PixelLayout::Rgba8 => self
                .pixels
                .chunks_exact(4)
                .map(|p| luma(p[0], p[1], p[2]))
                .collect(),
        };

        Ok(gray)
    }
}

/// ITU-R BT.601 luma with integer rounding.
fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((299 * r as u32 + 587 * g as u32 + 114 * b as u32 + 500) / 1000) as u8
}

/// Global histogram equalization in-place.
///
/// Maps each level through the normalized cumulative histogram so the output
/// spans 0–255. Single-level images are left untouched.
pub fn equalize_histogram(gray: &mut [u8]) {
    if gray.is_empty() {
        return;
    }

    let mut hist = [0u32; 256];
    for &p in gray.iter() {
        hist[p as usize] += 1;
    }

    let total = gray.len() as u32;
    let cdf_min = hist.iter().copied().find(|&c| c > 0).unwrap_or(0);
    let denom = total - cdf_min;
    if denom == 0 {
        return;
    }

    let mut lut = [0u8; 256];
    let mut cdf = 0u32;
    for (level, &count) in hist.iter().enumerate() {
        cdf += count;
        let scaled = (cdf.saturating_sub(cdf_min) as f32) * 255.0 / denom as f32;
        lut[level] = scaled.round().clamp(0.0, 255.0) as u8;
    }

    for p in gray.iter_mut() {
        *p = lut[*p as usize];
    }
}

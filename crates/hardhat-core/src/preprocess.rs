//! Shared image preprocessing: letterbox resize, NCHW tensors, downscaling.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::Array4;

/// Metadata for mapping model-space coordinates back to the source frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    /// Map a point from letterboxed model input space to source frame space.
    pub fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Fit `frame` inside a `size`×`size` canvas, centered, padded with `fill`.
pub fn letterbox(frame: &RgbImage, size: u32, fill: u8) -> (RgbImage, Letterbox) {
    let (width, height) = frame.dimensions();
    let scale = (size as f32 / width.max(1) as f32).min(size as f32 / height.max(1) as f32);

    let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
    let pad_x = (size - new_w) / 2;
    let pad_y = (size - new_h) / 2;

    let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([fill, fill, fill]));
    imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    (
        canvas,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

/// Convert an RGB image to a 1×3×H×W tensor: `(pixel - mean) / std` per channel.
pub fn to_nchw(image: &RgbImage, mean: f32, std: f32) -> Array4<f32> {
    let (w, h) = image.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - mean) / std;
        }
    }
    tensor
}

/// Resize both axes by `factor` (e.g. 0.25), keeping at least one pixel.
pub fn downscale(frame: &RgbImage, factor: f32) -> RgbImage {
    let (w, h) = frame.dimensions();
    let new_w = ((w as f32 * factor).round() as u32).max(1);
    let new_h = ((h as f32 * factor).round() as u32).max(1);
    imageops::resize(frame, new_w, new_h, FilterType::Triangle)
}

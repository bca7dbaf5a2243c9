//! Face alignment via a 4-DOF similarity transform.
//!
//! Maps the five detected landmarks onto the InsightFace reference
//! positions of a 112×112 crop, then resamples the RGB frame.

use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

const ALIGNED_SIZE: u32 = 112;

/// Similarity transform `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Closed-form least-squares fit of `src` onto `dst`.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
            (sx / 5.0, sy / 5.0)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let (mut num_a, mut num_b, mut denom) = (0.0f32, 0.0f32, 0.0f32);
        for (s, d) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (s.0 - msx, s.1 - msy);
            let (dx, dy) = (d.0 - mdx, d.1 - mdy);
            num_a += sx * dx + sy * dy;
            num_b += sx * dy - sy * dx;
            denom += sx * sx + sy * sy;
        }
        if denom <= f32::EPSILON {
            return None;
        }

        let a = num_a / denom;
        let b = num_b / denom;
        Some(Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        })
    }

    /// Map an output (aligned) point back to the source frame.
    fn invert_point(&self, x: f32, y: f32) -> (f32, f32) {
        let det = self.a * self.a + self.b * self.b;
        let (px, py) = (x - self.tx, y - self.ty);
        ((self.a * px + self.b * py) / det, (-self.b * px + self.a * py) / det)
    }
}

/// Produce the 112×112 aligned RGB crop for a face.
///
/// Degenerate landmarks (all coincident) yield a black crop.
pub fn align_face(frame: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let mut out = RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
    let Some(transform) = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS_112) else {
        tracing::debug!("degenerate landmarks, returning empty crop");
        return out;
    };

    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let (sx, sy) = transform.invert_point(x as f32, y as f32);
        *pixel = sample_bilinear(frame, sx, sy);
    }
    out
}

/// Bilinear sample; points outside the frame read as black.
fn sample_bilinear(frame: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = frame.dimensions();
    if w == 0 || h == 0 || x < 0.0 || y < 0.0 || x > (w - 1) as f32 || y > (h - 1) as f32 {
        return Rgb([0, 0, 0]);
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let (tl, tr) = (frame.get_pixel(x0, y0), frame.get_pixel(x1, y0));
    let (bl, br) = (frame.get_pixel(x0, y1), frame.get_pixel(x1, y1));

    Rgb(std::array::from_fn(|c| {
        let top = tl[c] as f32 * (1.0 - fx) + tr[c] as f32 * fx;
        let bottom = bl[c] as f32 * (1.0 - fx) + br[c] as f32 * fx;
        (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
    }))
}

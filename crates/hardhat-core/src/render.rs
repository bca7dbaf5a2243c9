//! Frame annotation and the presentation sink capability.

use crate::types::Rect;
use ab_glyph::{FontRef, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect as PixelRect;
use serde::Serialize;
use std::sync::OnceLock;

pub const VERIFIED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const REJECTED_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const HELMET_COLOR: Rgb<u8> = Rgb([0, 255, 255]);

const BOX_THICKNESS: u32 = 2;
const LABEL_SCALE: f32 = 16.0;
const LABEL_GAP: i32 = 2;

static LABEL_FONT_DATA: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    Verified,
    NoHelmet,
    Unrecognized,
    Helmet,
}

impl AnnotationKind {
    pub fn color(self) -> Rgb<u8> {
        match self {
            AnnotationKind::Verified => VERIFIED_COLOR,
            AnnotationKind::NoHelmet | AnnotationKind::Unrecognized => REJECTED_COLOR,
            AnnotationKind::Helmet => HELMET_COLOR,
        }
    }
}

/// A labeled box drawn onto a rendered frame.
#[derive(Debug, Clone, Serialize)]
pub struct Annotation {
    pub kind: AnnotationKind,
    pub rect: Rect,
    pub label: String,
}

/// What the loop hands to the sink with every rendered frame.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameSummary {
    pub sequence: u64,
    pub recognized_count: u32,
    pub annotations: Vec<Annotation>,
    /// Identities that got a new attendance record on this frame.
    pub newly_marked: Vec<String>,
}

/// Receives every rendered frame for display.
pub trait PresentationSink: Send {
    fn present(&mut self, frame: &RgbImage, summary: &FrameSummary);
}

/// The embedded label font, parsed once. `None` if the font data is unusable,
/// in which case boxes are drawn without labels.
fn label_font() -> Option<&'static FontRef<'static>> {
    static FONT: OnceLock<Option<FontRef<'static>>> = OnceLock::new();
    FONT.get_or_init(|| match FontRef::try_from_slice(LABEL_FONT_DATA) {
        Ok(font) => Some(font),
        Err(e) => {
            tracing::warn!(error = %e, "label font unusable; drawing boxes without labels");
            None
        }
    })
    .as_ref()
}

/// Draw every annotation's outline and label onto `frame`.
pub fn draw_annotations(frame: &mut RgbImage, annotations: &[Annotation]) {
    for a in annotations {
        let color = a.kind.color();
        let Some(bounds) = clip_to_frame(frame, &a.rect) else {
            continue;
        };
        draw_box(frame, bounds, color, BOX_THICKNESS);
        if let Some(font) = label_font() {
            draw_label(frame, font, bounds, &a.label, color);
        }
    }
}

/// Inclusive pixel bounds `(x0, y0, x1, y1)` of `rect` clamped into the frame.
fn clip_to_frame(frame: &RgbImage, rect: &Rect) -> Option<(i32, i32, i32, i32)> {
    let (w, h) = frame.dimensions();
    if w == 0 || h == 0 {
        return None;
    }
    let clamp = |v: f32, max: u32| (v.round().max(0.0) as i32).min(max as i32 - 1);
    let (x0, x1) = (clamp(rect.left, w), clamp(rect.right, w));
    let (y0, y1) = (clamp(rect.top, h), clamp(rect.bottom, h));
    (x0 <= x1 && y0 <= y1).then_some((x0, y0, x1, y1))
}

/// Nested one-pixel outlines, shrinking inward.
fn draw_box(frame: &mut RgbImage, (x0, y0, x1, y1): (i32, i32, i32, i32), color: Rgb<u8>, thickness: u32) {
    for t in 0..thickness as i32 {
        let w = x1 - x0 + 1 - 2 * t;
        let h = y1 - y0 + 1 - 2 * t;
        if w <= 0 || h <= 0 {
            break;
        }
        draw_hollow_rect_mut(frame, PixelRect::at(x0 + t, y0 + t).of_size(w as u32, h as u32), color);
    }
}

/// Label sits just above the box, or inside its top edge when there is no
/// room above.
fn draw_label(frame: &mut RgbImage, font: &FontRef<'_>, (x0, y0, _, _): (i32, i32, i32, i32), text: &str, color: Rgb<u8>) {
    if text.is_empty() {
        return;
    }
    let scale = PxScale::from(LABEL_SCALE);
    let (_, text_h) = text_size(scale, font, text);
    let above = y0 - LABEL_GAP - text_h as i32;
    let y = if above >= 0 {
        above
    } else {
        y0 + BOX_THICKNESS as i32 + LABEL_GAP
    };
    draw_text_mut(frame, color, x0, y, scale, font, text);
}

//! Frame source capability consumed by the recognition loop.

use image::RgbImage;
use thiserror::Error;

/// A captured RGB frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub sequence: u64,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self { image, sequence }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

#[derive(Error, Debug)]
pub enum CaptureError {
    /// No frame this tick; the loop retries on the next one.
    #[error("frame unavailable: {0}")]
    Unavailable(String),
    /// The source will never produce another frame.
    #[error("frame source exhausted")]
    Exhausted,
}

/// Lazy, non-restartable sequence of frames.
pub trait FrameSource: Send {
    fn capture(&mut self) -> Result<Frame, CaptureError>;
}

//! Face analysis capability: detection followed by per-face embedding.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::FaceRecognizer;
use crate::types::DetectedFace;
use image::RgbImage;

/// Locates faces in an RGB frame and computes one embedding per face.
///
/// Returned faces are sorted by detection confidence, highest first, with
/// boxes in the coordinates of the frame that was passed in.
pub trait FaceAnalyzer: Send {
    fn analyze(&mut self, frame: &RgbImage) -> Result<Vec<DetectedFace>, DetectorError>;
}

/// SCRFD detection + ArcFace embedding over ONNX Runtime.
pub struct OnnxFaceAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceAnalyzer {
    pub fn new(detector: FaceDetector, recognizer: FaceRecognizer) -> Self {
        Self { detector, recognizer }
    }

    /// Load both models; a missing file is reported as `ModelNotFound`.
    pub fn load(scrfd_path: &str, arcface_path: &str) -> Result<Self, DetectorError> {
        let detector = FaceDetector::load(scrfd_path)?;
        let recognizer = FaceRecognizer::load(arcface_path)?;
        Ok(Self::new(detector, recognizer))
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn analyze(&mut self, frame: &RgbImage) -> Result<Vec<DetectedFace>, DetectorError> {
        let candidates = self.detector.detect(frame)?;
        let mut faces = Vec::with_capacity(candidates.len());

        for candidate in &candidates {
            // Faces without landmarks cannot be aligned; drop them rather than the frame.
            if candidate.landmarks.is_none() {
                tracing::debug!(confidence = candidate.confidence, "face without landmarks skipped");
                continue;
            }
            let embedding = self.recognizer.extract(frame, candidate)?;
            faces.push(DetectedFace {
                rect: candidate.rect,
                confidence: candidate.confidence,
                embedding,
            });
        }

        Ok(faces)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Test analyzer keyed on the red channel of the top-left pixel.
    ///
    /// Frames whose tag is unknown yield no faces; a tag of 255 yields an error.
    pub(crate) struct ScriptedAnalyzer {
        faces: HashMap<u8, Vec<DetectedFace>>,
        pub(crate) calls: usize,
    }

    impl ScriptedAnalyzer {
        pub(crate) fn by_tag(entries: Vec<(u8, Vec<DetectedFace>)>) -> Self {
            Self {
                faces: entries.into_iter().collect(),
                calls: 0,
            }
        }
    }

    impl FaceAnalyzer for ScriptedAnalyzer {
        fn analyze(&mut self, frame: &RgbImage) -> Result<Vec<DetectedFace>, DetectorError> {
            self.calls += 1;
            let tag = frame.get_pixel(0, 0)[0];
            if tag == 255 {
                return Err(DetectorError::InferenceFailed("scripted failure".into()));
            }
            Ok(self.faces.get(&tag).cloned().unwrap_or_default())
        }
    }
}

//! hardhat-core — face identity, helmet verification and the attendance loop.
//!
//! Face detection (SCRFD), face embedding (ArcFace) and helmet detection
//! (YOLOv8 export) run on ONNX Runtime behind capability traits, so the
//! recognition loop never depends on a concrete model family.

pub mod alignment;
pub mod analyzer;
pub mod correlator;
pub mod detector;
pub mod gallery;
pub mod helmet;
pub mod matcher;
pub mod pipeline;
pub mod preprocess;
pub mod recognizer;
pub mod render;
pub mod source;
pub mod store;
pub mod types;

use std::path::PathBuf;

pub use analyzer::{FaceAnalyzer, OnnxFaceAnalyzer};
pub use detector::{DetectorError, FaceDetector};
pub use gallery::{Gallery, GalleryError, GalleryLoad};
pub use helmet::{ClassFallback, HelmetDetector, YoloHelmetDetector};
pub use matcher::{CosineMatcher, EuclideanMatcher, IdentityMatch, Matcher};
pub use pipeline::{LoopParts, LoopSettings, RecognitionLoop, SessionStats, TickOutcome};
pub use recognizer::{FaceRecognizer, RecognizerError};
pub use render::{FrameSummary, PresentationSink};
pub use source::{CaptureError, Frame, FrameSource};
pub use store::{AttendanceStore, PersistenceError};
pub use types::{DetectedFace, Embedding, HelmetRegion, Identity, Rect};

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";
pub const HELMET_MODEL_FILE: &str = "helmet_yolov8.onnx";

/// Default model directory: `$XDG_DATA_HOME/hardhat/models`.
pub fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}

/// Per-user data directory: `$XDG_DATA_HOME/hardhat`, falling back to
/// `~/.local/share/hardhat`.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("hardhat")
}

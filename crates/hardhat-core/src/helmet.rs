//! Helmet detection: YOLOv8-style ONNX export with helmet class selection.
//!
//! Helmet classes are the model classes whose name contains "helmet"
//! (case-insensitive). When no class name matches, [`ClassFallback`]
//! decides between detecting nothing and accepting every class.

use crate::detector::{nms, DetectorError};
use crate::preprocess::{self, Letterbox};
use crate::types::{HelmetRegion, Rect};
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

const YOLO_INPUT_SIZE: u32 = 640;
const YOLO_PAD_VALUE: u8 = 114;
const YOLO_NMS_THRESHOLD: f32 = 0.45;

/// Confidence floor used by the recognition loop.
pub const DEFAULT_HELMET_CONFIDENCE: f32 = 0.5;

/// Finds helmet regions in a full-resolution frame.
pub trait HelmetDetector: Send {
    fn detect(&mut self, frame: &RgbImage, confidence: f32) -> Result<Vec<HelmetRegion>, DetectorError>;
}

/// Policy when no model class name contains "helmet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClassFallback {
    /// Detect no helmets at all.
    #[default]
    FailClosed,
    /// Treat every class as a helmet.
    AllClasses,
}

impl FromStr for ClassFallback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail-closed" | "closed" | "none" => Ok(Self::FailClosed),
            "all-classes" | "all" | "open" => Ok(Self::AllClasses),
            other => Err(format!("unknown helmet class fallback {other:?} (expected fail-closed or all-classes)")),
        }
    }
}

/// Class ids accepted as helmets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelmetClasses {
    Ids(Vec<usize>),
    Any,
}

impl HelmetClasses {
    pub fn accepts(&self, class_id: usize) -> bool {
        match self {
            HelmetClasses::Ids(ids) => ids.contains(&class_id),
            HelmetClasses::Any => true,
        }
    }

    /// Select helmet classes by name, applying `fallback` when none match.
    pub fn resolve(names: &[(usize, String)], fallback: ClassFallback) -> Self {
        let ids: Vec<usize> = names
            .iter()
            .filter(|(_, name)| name.to_lowercase().contains("helmet"))
            .map(|(id, _)| *id)
            .collect();

        if !ids.is_empty() {
            return HelmetClasses::Ids(ids);
        }
        match fallback {
            ClassFallback::FailClosed => {
                tracing::warn!(?names, "no helmet class in model; helmet detection will find nothing");
                HelmetClasses::Ids(Vec::new())
            }
            ClassFallback::AllClasses => {
                tracing::warn!(?names, "no helmet class in model; treating every class as helmet");
                HelmetClasses::Any
            }
        }
    }
}

/// Parse the Ultralytics `names` metadata, e.g. `{0: 'helmet', 1: 'head'}`.
pub fn parse_class_names(raw: &str) -> Vec<(usize, String)> {
    raw.trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .split(',')
        .filter_map(|entry| {
            let (id, name) = entry.split_once(':')?;
            let id = id.trim().trim_matches(|c| c == '\'' || c == '"').parse().ok()?;
            let name = name.trim().trim_matches(|c| c == '\'' || c == '"').to_string();
            Some((id, name))
        })
        .collect()
}

/// YOLOv8 helmet detector over ONNX Runtime.
pub struct YoloHelmetDetector {
    session: Session,
    classes: HelmetClasses,
}

impl YoloHelmetDetector {
    /// Load the model; class names come from the export's `names` metadata.
    pub fn load(model_path: &str, fallback: ClassFallback) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names = session
            .metadata()
            .ok()
            .and_then(|meta| meta.custom("names"))
            .map(|raw| parse_class_names(&raw))
            .unwrap_or_default();

        let classes = HelmetClasses::resolve(&names, fallback);
        tracing::info!(path = model_path, ?names, ?classes, "loaded helmet model");

        Ok(Self { session, classes })
    }
}

impl HelmetDetector for YoloHelmetDetector {
    fn detect(&mut self, frame: &RgbImage, confidence: f32) -> Result<Vec<HelmetRegion>, DetectorError> {
        let (canvas, letterbox) = preprocess::letterbox(frame, YOLO_INPUT_SIZE, YOLO_PAD_VALUE);
        let input = preprocess::to_nchw(&canvas, 0.0, 255.0);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("helmet output: {e}")))?;

        if shape.len() != 3 || shape[1] < 5 {
            return Err(DetectorError::InferenceFailed(format!(
                "expected [1, 4 + classes, anchors] output, got {shape:?}"
            )));
        }
        let channels = shape[1] as usize;
        let anchors = shape[2] as usize;

        let regions = decode_yolo(data, channels, anchors, &letterbox, confidence, &self.classes);
        Ok(nms(regions, |r| r.rect, |r| r.confidence, YOLO_NMS_THRESHOLD))
    }
}

/// Decode a channels-first `[4 + classes, anchors]` YOLOv8 head.
///
/// Each anchor takes its best-scoring class; it is kept when that class is
/// a helmet class and its score reaches `confidence`.
fn decode_yolo(
    data: &[f32],
    channels: usize,
    anchors: usize,
    letterbox: &Letterbox,
    confidence: f32,
    classes: &HelmetClasses,
) -> Vec<HelmetRegion> {
    if data.len() < channels * anchors {
        return Vec::new();
    }
    let at = |c: usize, i: usize| data[c * anchors + i];

    (0..anchors)
        .filter_map(|i| {
            let (class_id, score) = (4..channels)
                .map(|c| (c - 4, at(c, i)))
                .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
            if score < confidence || !classes.accepts(class_id) {
                return None;
            }

            let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
            let (left, top) = letterbox.unmap(cx - w / 2.0, cy - h / 2.0);
            let (right, bottom) = letterbox.unmap(cx + w / 2.0, cy + h / 2.0);
            Some(HelmetRegion {
                rect: Rect::new(left, top, right, bottom),
                class_id,
                confidence: score,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<(usize, String)> {
        list.iter().enumerate().map(|(i, n)| (i, n.to_string())).collect()
    }

    #[test]
    fn test_parse_ultralytics_names() {
        let parsed = parse_class_names("{0: 'Hardhat', 1: 'NO-Hardhat', 2: \"helmet\"}");
        assert_eq!(parsed, names(&["Hardhat", "NO-Hardhat", "helmet"]));
    }

    #[test]
    fn test_parse_garbage_yields_nothing() {
        assert!(parse_class_names("").is_empty());
        assert!(parse_class_names("not metadata").is_empty());
    }

    #[test]
    fn test_resolve_by_substring_case_insensitive() {
        let classes = HelmetClasses::resolve(&names(&["head", "Helmet", "person", "safety-helmet"]), ClassFallback::FailClosed);
        assert_eq!(classes, HelmetClasses::Ids(vec![1, 3]));
    }

    #[test]
    fn test_resolve_fallback_fail_closed() {
        let classes = HelmetClasses::resolve(&names(&["head", "person"]), ClassFallback::FailClosed);
        assert!(!classes.accepts(0));
        assert!(!classes.accepts(1));
    }

    #[test]
    fn test_resolve_fallback_all_classes() {
        let classes = HelmetClasses::resolve(&names(&["head", "person"]), ClassFallback::AllClasses);
        assert_eq!(classes, HelmetClasses::Any);
        assert!(classes.accepts(7));
    }

    #[test]
    fn test_class_fallback_from_str() {
        assert_eq!("fail-closed".parse::<ClassFallback>().unwrap(), ClassFallback::FailClosed);
        assert_eq!("ALL-CLASSES".parse::<ClassFallback>().unwrap(), ClassFallback::AllClasses);
        assert!("maybe".parse::<ClassFallback>().is_err());
    }

    #[test]
    fn test_decode_yolo_filters_class_and_confidence() {
        // 3 anchors, 2 classes (0 = helmet, 1 = head); layout [6, 3].
        let anchors = 3;
        #[rustfmt::skip]
        let data = vec![
            // cx
            100.0, 300.0, 500.0,
            // cy
            100.0, 300.0, 500.0,
            // w
            40.0, 40.0, 40.0,
            // h
            20.0, 20.0, 20.0,
            // class 0 (helmet)
            0.9, 0.3, 0.2,
            // class 1 (head)
            0.1, 0.2, 0.95,
        ];
        let identity = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let regions = decode_yolo(&data, 6, anchors, &identity, 0.5, &HelmetClasses::Ids(vec![0]));

        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].class_id, 0);
        assert_eq!(regions[0].rect, Rect::new(80.0, 90.0, 120.0, 110.0));
    }

    #[test]
    fn test_decode_yolo_short_buffer() {
        let identity = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        assert!(decode_yolo(&[0.0; 5], 6, 3, &identity, 0.5, &HelmetClasses::Any).is_empty());
    }
}

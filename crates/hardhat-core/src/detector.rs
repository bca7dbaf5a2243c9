//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over three strides (8, 16, 32) with five-point
//! landmarks, followed by NMS. Input frames are RGB.

use crate::preprocess::{self, Letterbox};
use crate::recognizer::RecognizerError;
use crate::types::{FaceCandidate, Rect};
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("embedding failed: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    /// Per-stride output indices for strides [8, 16, 32].
    stride_outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_outputs = map_stride_outputs(&output_names);
        tracing::info!(path = model_path, outputs = ?output_names, ?stride_outputs, "loaded SCRFD model");

        Ok(Self { session, stride_outputs })
    }

    /// Detect faces in an RGB frame, sorted by confidence (highest first).
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<FaceCandidate>, DetectorError> {
        // Pad with the mean so padding normalizes to 0.0.
        let (canvas, letterbox) = preprocess::letterbox(frame, SCRFD_INPUT_SIZE, SCRFD_MEAN as u8);
        let input = preprocess::to_nchw(&canvas, SCRFD_MEAN, SCRFD_STD);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_outputs[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let tensors = StrideTensors {
                scores: extract(score_idx, "scores")?,
                bboxes: extract(bbox_idx, "bboxes")?,
                kps: extract(kps_idx, "kps")?,
            };
            candidates.extend(decode_stride(&tensors, stride, &letterbox, SCRFD_CONFIDENCE_THRESHOLD));
        }

        Ok(nms(candidates, |c| c.rect, |c| c.confidence, SCRFD_NMS_THRESHOLD))
    }
}

/// Map output names to stride slots.
///
/// Exports named "score_8", "bbox_16", "kps_32", ... are mapped by name;
/// anything else falls back to positional order
/// [scores 8/16/32, bboxes 8/16/32, kps 8/16/32].
fn map_stride_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let by_name: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match by_name {
        Some(v) => [v[0], v[1], v[2]],
        None => {
            tracing::info!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

struct StrideTensors<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// Decode the anchors of one stride into frame-space candidates.
fn decode_stride(t: &StrideTensors<'_>, stride: usize, letterbox: &Letterbox, threshold: f32) -> Vec<FaceCandidate> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    (0..anchors)
        .filter_map(|idx| {
            let score = *t.scores.get(idx)?;
            if score <= threshold {
                return None;
            }
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid) as f32 * s;
            let ay = (cell / grid) as f32 * s;

            let d = t.bboxes.get(idx * 4..idx * 4 + 4)?;
            let (left, top) = letterbox.unmap(ax - d[0] * s, ay - d[1] * s);
            let (right, bottom) = letterbox.unmap(ax + d[2] * s, ay + d[3] * s);

            let landmarks = t.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| letterbox.unmap(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s))
            });

            Some(FaceCandidate {
                rect: Rect::new(left, top, right, bottom),
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; output is sorted by score, highest first.
pub(crate) fn nms<T>(mut items: Vec<T>, rect: impl Fn(&T) -> Rect, score: impl Fn(&T) -> f32, iou_threshold: f32) -> Vec<T> {
    items.sort_by(|a, b| score(b).partial_cmp(&score(a)).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        let r = rect(&item);
        if keep.iter().all(|k| rect(k).iou(&r) <= iou_threshold) {
            keep.push(item);
        }
    }
    keep
}

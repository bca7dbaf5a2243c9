//! Recognition loop: one frame at a time through
//! capture → helmets → faces → match/correlate → commit → render.
//!
//! Every per-frame failure is absorbed at its stage boundary. A detector
//! error means "nothing detected this frame", a ledger error defers the
//! commit to a later frame, and an unavailable frame skips the tick. Only
//! an exhausted frame source ends the loop.

use crate::analyzer::FaceAnalyzer;
use crate::correlator;
use crate::gallery::Gallery;
use crate::helmet::{HelmetDetector, DEFAULT_HELMET_CONFIDENCE};
use crate::matcher::Matcher;
use crate::preprocess;
use crate::render::{self, Annotation, AnnotationKind, FrameSummary, PresentationSink};
use crate::source::{CaptureError, FrameSource};
use crate::store::AttendanceStore;
use crate::types::{DetectedFace, HelmetRegion, Rect};
use image::RgbImage;
use std::collections::HashSet;

/// Downscale applied before face detection.
pub const DEFAULT_FACE_SCALE: f32 = 0.25;

/// Euclidean tolerance for L2-normalized ArcFace embeddings
/// (≈ cosine similarity 0.40).
pub const DEFAULT_TOLERANCE: f32 = 1.1;

pub const UNRECOGNIZED_LABEL: &str = "Unrecognized";
pub const NO_HELMET_LABEL: &str = "NO HELMET";

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    /// Maximum embedding distance for a positive identity.
    pub tolerance: f32,
    /// Confidence floor passed to the helmet detector.
    pub helmet_confidence: f32,
    /// Linear downscale for face detection, in (0, 1].
    pub face_scale: f32,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            helmet_confidence: DEFAULT_HELMET_CONFIDENCE,
            face_scale: DEFAULT_FACE_SCALE,
        }
    }
}

/// Identities already committed during this session.
///
/// Only suppresses redundant ledger calls; the ledger stays authoritative.
#[derive(Debug, Default)]
struct SessionMatchCache {
    marked: HashSet<String>,
}

impl SessionMatchCache {
    fn contains(&self, identity: &str) -> bool {
        self.marked.contains(identity)
    }

    fn insert(&mut self, identity: &str) {
        self.marked.insert(identity.to_string());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// A new attendance record was written.
    Inserted,
    /// The ledger already had a record for today.
    AlreadyRecorded,
    /// Committed earlier in this session; ledger not called.
    CachedThisSession,
    /// Ledger failed; a later frame retries.
    Deferred,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FaceVerdict {
    Unrecognized,
    NoHelmet { identity: String, distance: f32 },
    Verified { identity: String, distance: f32, commit: CommitOutcome },
}

#[derive(Debug, Clone)]
pub struct FaceReport {
    /// Face box in full-resolution frame coordinates.
    pub rect: Rect,
    pub verdict: FaceVerdict,
}

#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    pub sequence: u64,
    pub helmets: Vec<HelmetRegion>,
    pub faces: Vec<FaceReport>,
}

#[derive(Debug)]
pub enum TickOutcome {
    Rendered(FrameReport),
    /// No frame this tick.
    Skipped,
    /// Frame source is finished; stop ticking.
    Exhausted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_rendered: u64,
    pub frames_skipped: u64,
    pub recognized_count: u32,
}

/// Capabilities the loop drives. All are owned by the loop for its lifetime.
pub struct LoopParts {
    pub source: Box<dyn FrameSource>,
    pub faces: Box<dyn FaceAnalyzer>,
    pub helmets: Box<dyn HelmetDetector>,
    pub matcher: Box<dyn Matcher>,
    pub store: Box<dyn AttendanceStore>,
    pub sink: Box<dyn PresentationSink>,
}

pub struct RecognitionLoop {
    parts: LoopParts,
    gallery: Gallery,
    settings: LoopSettings,
    cache: SessionMatchCache,
    stats: SessionStats,
}

impl RecognitionLoop {
    pub fn new(parts: LoopParts, gallery: Gallery, settings: LoopSettings) -> Self {
        Self {
            parts,
            gallery,
            settings,
            cache: SessionMatchCache::default(),
            stats: SessionStats::default(),
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    /// Run one full frame through the state machine.
    pub fn tick(&mut self) -> TickOutcome {
        let frame = match self.parts.source.capture() {
            Ok(frame) => frame,
            Err(CaptureError::Unavailable(reason)) => {
                tracing::debug!(%reason, "frame unavailable, skipping tick");
                self.stats.frames_skipped += 1;
                return TickOutcome::Skipped;
            }
            Err(CaptureError::Exhausted) => {
                tracing::info!("frame source exhausted");
                return TickOutcome::Exhausted;
            }
        };

        let helmets = self.detect_helmets(&frame.image);
        let faces = self.detect_faces(&frame.image);

        let mut report = FrameReport {
            sequence: frame.sequence,
            faces: Vec::with_capacity(faces.len()),
            helmets,
        };
        let mut newly_marked = Vec::new();

        for face in faces {
            let verdict = self.evaluate(&face, &report.helmets);
            if let FaceVerdict::Verified { identity, commit: CommitOutcome::Inserted, .. } = &verdict {
                newly_marked.push(identity.clone());
            }
            report.faces.push(FaceReport { rect: face.rect, verdict });
        }

        self.render(frame.image, &report, newly_marked);
        self.stats.frames_rendered += 1;
        TickOutcome::Rendered(report)
    }

    /// DETECT_HELMETS: full frame; failure means zero helmets.
    fn detect_helmets(&mut self, image: &RgbImage) -> Vec<HelmetRegion> {
        match self.parts.helmets.detect(image, self.settings.helmet_confidence) {
            Ok(helmets) => helmets,
            Err(e) => {
                tracing::warn!(error = %e, "helmet detection failed; treating frame as helmet-free");
                Vec::new()
            }
        }
    }

    /// DETECT_FACES: downscaled frame, boxes mapped back to full resolution.
    fn detect_faces(&mut self, image: &RgbImage) -> Vec<DetectedFace> {
        let scale = self.settings.face_scale;
        let small = preprocess::downscale(image, scale);
        match self.parts.faces.analyze(&small) {
            Ok(faces) => faces
                .into_iter()
                .map(|f| DetectedFace {
                    rect: f.rect.scaled(1.0 / scale),
                    ..f
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed; no faces this frame");
                Vec::new()
            }
        }
    }

    /// MATCH_AND_CORRELATE, then COMMIT when identity and helmet agree.
    fn evaluate(&mut self, face: &DetectedFace, helmets: &[HelmetRegion]) -> FaceVerdict {
        let Some(found) = self
            .parts
            .matcher
            .find_match(&face.embedding, &self.gallery, self.settings.tolerance)
        else {
            return FaceVerdict::Unrecognized;
        };

        if !correlator::helmet_covers(&face.rect, helmets.iter().map(|h| &h.rect)) {
            tracing::debug!(identity = %found.name, distance = found.distance, "recognized without helmet");
            return FaceVerdict::NoHelmet {
                identity: found.name,
                distance: found.distance,
            };
        }

        let commit = self.commit(&found.name);
        FaceVerdict::Verified {
            identity: found.name,
            distance: found.distance,
            commit,
        }
    }

    fn commit(&mut self, identity: &str) -> CommitOutcome {
        if self.cache.contains(identity) {
            return CommitOutcome::CachedThisSession;
        }

        match self.parts.store.mark_if_absent_today(identity) {
            Ok(true) => {
                self.cache.insert(identity);
                self.stats.recognized_count += 1;
                tracing::info!(identity, recognized = self.stats.recognized_count, "attendance marked");
                CommitOutcome::Inserted
            }
            Ok(false) => {
                self.cache.insert(identity);
                tracing::info!(identity, "attendance already recorded today");
                CommitOutcome::AlreadyRecorded
            }
            Err(e) => {
                tracing::warn!(identity, error = %e, "attendance commit deferred");
                CommitOutcome::Deferred
            }
        }
    }

    /// RENDER: annotate and hand off to the sink.
    fn render(&mut self, mut image: RgbImage, report: &FrameReport, newly_marked: Vec<String>) {
        let mut annotations: Vec<Annotation> = report
            .faces
            .iter()
            .map(|f| {
                let (kind, label) = match &f.verdict {
                    FaceVerdict::Verified { identity, .. } => (AnnotationKind::Verified, identity.to_uppercase()),
                    FaceVerdict::NoHelmet { .. } => (AnnotationKind::NoHelmet, NO_HELMET_LABEL.to_string()),
                    FaceVerdict::Unrecognized => (AnnotationKind::Unrecognized, UNRECOGNIZED_LABEL.to_string()),
                };
                Annotation { kind, rect: f.rect, label }
            })
            .collect();
        annotations.extend(report.helmets.iter().map(|h| Annotation {
            kind: AnnotationKind::Helmet,
            rect: h.rect,
            label: "Helmet".to_string(),
        }));

        render::draw_annotations(&mut image, &annotations);

        let summary = FrameSummary {
            sequence: report.sequence,
            recognized_count: self.stats.recognized_count,
            annotations,
            newly_marked,
        };
        self.parts.sink.present(&image, &summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::tests::ScriptedAnalyzer;
    use crate::detector::DetectorError;
    use crate::matcher::EuclideanMatcher;
    use crate::source::Frame;
    use crate::store::PersistenceError;
    use crate::types::Embedding;
    use image::Rgb;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    const FRAME_W: u32 = 640;
    const FRAME_H: u32 = 480;

    /// Yields scripted capture results, then `Exhausted` forever.
    struct ScriptedSource(VecDeque<Result<Frame, CaptureError>>);

    impl ScriptedSource {
        fn tagged(tags: &[u8]) -> Self {
            Self(tags.iter().enumerate().map(|(i, &t)| Ok(tagged_frame(t, i as u64))).collect())
        }
    }

    impl FrameSource for ScriptedSource {
        fn capture(&mut self) -> Result<Frame, CaptureError> {
            self.0.pop_front().unwrap_or(Err(CaptureError::Exhausted))
        }
    }

    fn tagged_frame(tag: u8, sequence: u64) -> Frame {
        Frame::new(RgbImage::from_pixel(FRAME_W, FRAME_H, Rgb([tag, 0, 0])), sequence)
    }

    struct FixedHelmets(Result<Vec<HelmetRegion>, ()>);

    impl HelmetDetector for FixedHelmets {
        fn detect(&mut self, _frame: &RgbImage, _confidence: f32) -> Result<Vec<HelmetRegion>, DetectorError> {
            self.0
                .clone()
                .map_err(|_| DetectorError::InferenceFailed("scripted helmet failure".into()))
        }
    }

    #[derive(Default)]
    struct StoreState {
        calls: usize,
        recorded: HashSet<String>,
        failures_left: usize,
    }

    #[derive(Clone, Default)]
    struct SharedStore(Arc<Mutex<StoreState>>);

    impl SharedStore {
        fn failing(times: usize) -> Self {
            let s = Self::default();
            s.0.lock().unwrap().failures_left = times;
            s
        }

        fn calls(&self) -> usize {
            self.0.lock().unwrap().calls
        }
    }

    impl AttendanceStore for SharedStore {
        fn mark_if_absent_today(&mut self, identity: &str) -> Result<bool, PersistenceError> {
            let mut state = self.0.lock().unwrap();
            state.calls += 1;
            if state.failures_left > 0 {
                state.failures_left -= 1;
                return Err(PersistenceError::Unavailable("scripted outage".into()));
            }
            Ok(state.recorded.insert(identity.to_string()))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<FrameSummary>>>);

    impl PresentationSink for RecordingSink {
        fn present(&mut self, frame: &RgbImage, summary: &FrameSummary) {
            assert_eq!(frame.dimensions(), (FRAME_W, FRAME_H));
            self.0.lock().unwrap().push(summary.clone());
        }
    }

    /// Face at (25,25)-(50,50) on the quarter-scale frame → (100,100)-(200,200) full size.
    fn small_face(values: Vec<f32>) -> DetectedFace {
        DetectedFace {
            rect: Rect::new(25.0, 25.0, 50.0, 50.0),
            confidence: 0.9,
            embedding: Embedding::new(values),
        }
    }

    fn helmet_over_face() -> HelmetRegion {
        HelmetRegion {
            rect: Rect::new(90.0, 50.0, 210.0, 110.0),
            class_id: 0,
            confidence: 0.8,
        }
    }

    fn gallery() -> Gallery {
        let mut g = Gallery::default();
        g.insert("alice", Embedding::new(vec![1.0, 0.0])).unwrap();
        g.insert("bob", Embedding::new(vec![0.0, 1.0])).unwrap();
        g
    }

    struct Harness {
        station: RecognitionLoop,
        store: SharedStore,
        sink: RecordingSink,
    }

    /// Tag 1 = alice, 2 = bob, 3 = stranger, 255 = analyzer failure.
    fn harness(tags: &[u8], helmets: Result<Vec<HelmetRegion>, ()>, store: SharedStore) -> Harness {
        let analyzer = ScriptedAnalyzer::by_tag(vec![
            (1, vec![small_face(vec![1.0, 0.0])]),
            (2, vec![small_face(vec![0.0, 1.0])]),
            (3, vec![small_face(vec![-1.0, -1.0])]),
        ]);
        let sink = RecordingSink::default();
        let parts = LoopParts {
            source: Box::new(ScriptedSource::tagged(tags)),
            faces: Box::new(analyzer),
            helmets: Box::new(FixedHelmets(helmets)),
            matcher: Box::new(EuclideanMatcher),
            store: Box::new(store.clone()),
            sink: Box::new(sink.clone()),
        };
        let settings = LoopSettings {
            tolerance: 0.5,
            ..LoopSettings::default()
        };
        Harness {
            station: RecognitionLoop::new(parts, gallery(), settings),
            store,
            sink,
        }
    }

    fn rendered(outcome: TickOutcome) -> FrameReport {
        match outcome {
            TickOutcome::Rendered(report) => report,
            other => panic!("expected a rendered frame, got {other:?}"),
        }
    }

    #[test]
    fn test_verified_face_commits_and_maps_box_to_full_resolution() {
        let mut h = harness(&[1], Ok(vec![helmet_over_face()]), SharedStore::default());
        let report = rendered(h.station.tick());

        assert_eq!(report.faces.len(), 1);
        assert_eq!(report.faces[0].rect, Rect::new(100.0, 100.0, 200.0, 200.0));
        assert_eq!(
            report.faces[0].verdict,
            FaceVerdict::Verified {
                identity: "alice".into(),
                distance: 0.0,
                commit: CommitOutcome::Inserted
            }
        );
        assert_eq!(h.store.calls(), 1);
        assert_eq!(h.station.stats().recognized_count, 1);
    }

    #[test]
    fn test_repeated_identity_hits_ledger_once() {
        let mut h = harness(&[1; 10], Ok(vec![helmet_over_face()]), SharedStore::default());
        for _ in 0..10 {
            rendered(h.station.tick());
        }
        assert_eq!(h.store.calls(), 1);
        assert_eq!(h.station.stats().recognized_count, 1);
        assert_eq!(h.station.stats().frames_rendered, 10);
    }

    #[test]
    fn test_already_recorded_identity_is_cached_without_counting() {
        let store = SharedStore::default();
        store.0.lock().unwrap().recorded.insert("alice".into());
        let mut h = harness(&[1, 1, 1], Ok(vec![helmet_over_face()]), store);

        let first = rendered(h.station.tick());
        assert!(matches!(
            first.faces[0].verdict,
            FaceVerdict::Verified { commit: CommitOutcome::AlreadyRecorded, .. }
        ));
        let second = rendered(h.station.tick());
        assert!(matches!(
            second.faces[0].verdict,
            FaceVerdict::Verified { commit: CommitOutcome::CachedThisSession, .. }
        ));
        rendered(h.station.tick());

        assert_eq!(h.store.calls(), 1);
        assert_eq!(h.station.stats().recognized_count, 0);
    }

    #[test]
    fn test_unrecognized_face_never_commits() {
        let mut h = harness(&[3, 3], Ok(vec![helmet_over_face()]), SharedStore::default());
        let report = rendered(h.station.tick());
        assert_eq!(report.faces[0].verdict, FaceVerdict::Unrecognized);
        rendered(h.station.tick());
        assert_eq!(h.store.calls(), 0);
    }

    #[test]
    fn test_known_face_without_helmet_is_not_committed() {
        let elsewhere = HelmetRegion {
            rect: Rect::new(300.0, 50.0, 400.0, 110.0),
            class_id: 0,
            confidence: 0.9,
        };
        let mut h = harness(&[2], Ok(vec![elsewhere]), SharedStore::default());
        let report = rendered(h.station.tick());
        assert!(matches!(
            &report.faces[0].verdict,
            FaceVerdict::NoHelmet { identity, .. } if identity == "bob"
        ));
        assert_eq!(h.store.calls(), 0);
    }

    #[test]
    fn test_ledger_failure_is_retried_on_next_frame() {
        let mut h = harness(&[1, 1, 1], Ok(vec![helmet_over_face()]), SharedStore::failing(1));

        let first = rendered(h.station.tick());
        assert!(matches!(
            first.faces[0].verdict,
            FaceVerdict::Verified { commit: CommitOutcome::Deferred, .. }
        ));
        assert_eq!(h.station.stats().recognized_count, 0);

        let second = rendered(h.station.tick());
        assert!(matches!(
            second.faces[0].verdict,
            FaceVerdict::Verified { commit: CommitOutcome::Inserted, .. }
        ));
        rendered(h.station.tick());

        assert_eq!(h.store.calls(), 2);
        assert_eq!(h.station.stats().recognized_count, 1);
    }

    #[test]
    fn test_helmet_detector_failure_degrades_to_no_helmets() {
        let mut h = harness(&[1], Err(()), SharedStore::default());
        let report = rendered(h.station.tick());
        assert!(report.helmets.is_empty());
        assert!(matches!(report.faces[0].verdict, FaceVerdict::NoHelmet { .. }));
        assert_eq!(h.store.calls(), 0);
    }

    #[test]
    fn test_face_detector_failure_still_renders() {
        let mut h = harness(&[255, 1], Ok(vec![helmet_over_face()]), SharedStore::default());
        let report = rendered(h.station.tick());
        assert!(report.faces.is_empty());
        assert_eq!(report.helmets.len(), 1);
        // The next frame is processed normally.
        let report = rendered(h.station.tick());
        assert_eq!(report.faces.len(), 1);
        assert_eq!(h.sink.0.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_unavailable_frame_skipped_then_exhaustion() {
        let mut h = harness(&[], Ok(vec![]), SharedStore::default());
        h.station.parts.source = Box::new(ScriptedSource(VecDeque::from(vec![
            Err(CaptureError::Unavailable("camera busy".into())),
            Ok(tagged_frame(1, 7)),
        ])));

        assert!(matches!(h.station.tick(), TickOutcome::Skipped));
        assert_eq!(rendered(h.station.tick()).sequence, 7);
        assert!(matches!(h.station.tick(), TickOutcome::Exhausted));
        assert_eq!(h.station.stats().frames_skipped, 1);
        assert_eq!(h.station.stats().frames_rendered, 1);
    }

    #[test]
    fn test_sink_receives_labels_and_newly_marked() {
        let mut h = harness(&[1, 3, 1], Ok(vec![helmet_over_face()]), SharedStore::default());
        for _ in 0..3 {
            rendered(h.station.tick());
        }

        let frames = h.sink.0.lock().unwrap();
        assert_eq!(frames[0].newly_marked, vec!["alice".to_string()]);
        assert_eq!(frames[0].recognized_count, 1);
        let face = &frames[0].annotations[0];
        assert_eq!(face.kind, AnnotationKind::Verified);
        assert_eq!(face.label, "ALICE");
        assert_eq!(frames[0].annotations[1].kind, AnnotationKind::Helmet);

        assert_eq!(frames[1].annotations[0].label, UNRECOGNIZED_LABEL);
        assert!(frames[2].newly_marked.is_empty());
    }

    #[test]
    fn test_no_helmet_label() {
        let mut h = harness(&[2], Ok(vec![]), SharedStore::default());
        rendered(h.station.tick());
        let frames = h.sink.0.lock().unwrap();
        assert_eq!(frames[0].annotations[0].kind, AnnotationKind::NoHelmet);
        assert_eq!(frames[0].annotations[0].label, NO_HELMET_LABEL);
    }

    #[test]
    fn test_downscaled_box_roundtrip_matches_full_resolution() {
        // A bright face-sized block on a dark frame, located directly at full
        // resolution and again on the quarter-scale copy.
        let full_box = (148u32, 96u32, 268u32, 236u32);
        let mut frame = RgbImage::new(FRAME_W, FRAME_H);
        for y in full_box.1..full_box.3 {
            for x in full_box.0..full_box.2 {
                frame.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }

        fn bright_bounds(img: &RgbImage) -> Rect {
            let (mut l, mut t, mut r, mut b) = (u32::MAX, u32::MAX, 0, 0);
            for (x, y, p) in img.enumerate_pixels() {
                if p[0] > 127 {
                    l = l.min(x);
                    t = t.min(y);
                    r = r.max(x + 1);
                    b = b.max(y + 1);
                }
            }
            Rect::new(l as f32, t as f32, r as f32, b as f32)
        }

        let direct = bright_bounds(&frame);
        let small = preprocess::downscale(&frame, DEFAULT_FACE_SCALE);
        let restored = bright_bounds(&small).scaled(1.0 / DEFAULT_FACE_SCALE);

        let tolerance = 1.0 / DEFAULT_FACE_SCALE;
        for (a, b) in [
            (direct.left, restored.left),
            (direct.top, restored.top),
            (direct.right, restored.right),
            (direct.bottom, restored.bottom),
        ] {
            assert!((a - b).abs() <= tolerance, "{a} vs {b}");
        }
    }

    #[test]
    fn test_session_cache() {
        let mut cache = SessionMatchCache::default();
        assert!(!cache.contains("alice"));
        cache.insert("alice");
        cache.insert("alice");
        assert!(cache.contains("alice"));
        assert!(!cache.contains("ALICE"));
        assert_eq!(cache.marked.len(), 1);
    }
}

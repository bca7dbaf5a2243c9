use crate::status::StationStatus;
use hardhat_core::render::{FrameSummary, PresentationSink};
use image::{ImageFormat, RgbImage};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

/// Presentation sink for the headless daemon: publishes each frame summary
/// to the status channel and optionally keeps a JPEG of the latest frame.
pub struct StatusSink {
    status: Arc<watch::Sender<StationStatus>>,
    snapshot_path: Option<PathBuf>,
}

impl StatusSink {
    pub fn new(status: Arc<watch::Sender<StationStatus>>, snapshot_path: Option<PathBuf>) -> Self {
        Self { status, snapshot_path }
    }

    fn write_snapshot(&self, frame: &RgbImage) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        // Write beside the target and rename so readers never see a partial file.
        let tmp = path.with_extension("jpg.tmp");
        let result = frame
            .save_with_format(&tmp, ImageFormat::Jpeg)
            .map_err(|e| e.to_string())
            .and_then(|_| std::fs::rename(&tmp, path).map_err(|e| e.to_string()));
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "snapshot write failed");
        }
    }
}

impl PresentationSink for StatusSink {
    fn present(&mut self, frame: &RgbImage, summary: &FrameSummary) {
        self.status.send_modify(|s| s.record_frame(summary));
        self.write_snapshot(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_present_updates_status_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("latest.jpg");
        let (tx, rx) = watch::channel(StationStatus::new("replay".into()));
        let mut sink = StatusSink::new(Arc::new(tx), Some(snapshot.clone()));

        let frame = RgbImage::from_pixel(8, 6, Rgb([40, 80, 120]));
        sink.present(
            &frame,
            &FrameSummary {
                sequence: 3,
                recognized_count: 1,
                annotations: Vec::new(),
                newly_marked: vec!["alice".into()],
            },
        );

        let status = rx.borrow();
        assert_eq!(status.recognized_count, 1);
        assert_eq!(status.recently_marked[0].identity, "alice");
        drop(status);

        let written = image::open(&snapshot).unwrap();
        assert_eq!((written.width(), written.height()), (8, 6));
        assert!(!dir.path().join("latest.jpg.tmp").exists());
    }

    #[test]
    fn test_present_without_snapshot() {
        let (tx, rx) = watch::channel(StationStatus::new("replay".into()));
        let mut sink = StatusSink::new(Arc::new(tx), None);
        sink.present(&RgbImage::new(2, 2), &FrameSummary::default());
        assert!(rx.borrow().last_frame.is_some());
    }
}

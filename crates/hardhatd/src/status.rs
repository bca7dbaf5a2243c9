use chrono::{DateTime, Local};
use hardhat_core::pipeline::SessionStats;
use hardhat_core::render::FrameSummary;
use serde::Serialize;
use uuid::Uuid;

/// How many recent commits the status keeps.
const RECENT_MARKS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StationState {
    Starting,
    Running,
    /// Frame source finished on its own.
    Exhausted,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarkedEntry {
    pub identity: String,
    pub at: DateTime<Local>,
}

/// Live station state published to the status interface.
#[derive(Debug, Clone, Serialize)]
pub struct StationStatus {
    pub version: &'static str,
    pub session_id: Uuid,
    pub started_at: DateTime<Local>,
    pub state: StationState,
    pub source: String,
    pub gallery: Vec<String>,
    pub frames_rendered: u64,
    pub frames_skipped: u64,
    pub recognized_count: u32,
    pub recently_marked: Vec<MarkedEntry>,
    pub last_frame: Option<FrameSummary>,
}

impl StationStatus {
    pub fn new(source: String) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            session_id: Uuid::new_v4(),
            started_at: Local::now(),
            state: StationState::Starting,
            source,
            gallery: Vec::new(),
            frames_rendered: 0,
            frames_skipped: 0,
            recognized_count: 0,
            recently_marked: Vec::new(),
            last_frame: None,
        }
    }

    pub fn apply_stats(&mut self, stats: SessionStats) {
        self.frames_rendered = stats.frames_rendered;
        self.frames_skipped = stats.frames_skipped;
        self.recognized_count = stats.recognized_count;
    }

    pub fn record_frame(&mut self, summary: &FrameSummary) {
        let now = Local::now();
        for identity in &summary.newly_marked {
            self.recently_marked.push(MarkedEntry {
                identity: identity.clone(),
                at: now,
            });
        }
        if self.recently_marked.len() > RECENT_MARKS {
            let excess = self.recently_marked.len() - RECENT_MARKS;
            self.recently_marked.drain(..excess);
        }
        self.recognized_count = summary.recognized_count;
        self.last_frame = Some(summary.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_frame_keeps_recent_marks_bounded() {
        let mut status = StationStatus::new("replay".into());
        for i in 0..40u32 {
            status.record_frame(&FrameSummary {
                sequence: i as u64,
                recognized_count: i + 1,
                annotations: Vec::new(),
                newly_marked: vec![format!("worker-{i}")],
            });
        }
        assert_eq!(status.recently_marked.len(), RECENT_MARKS);
        assert_eq!(status.recently_marked[0].identity, "worker-8");
        assert_eq!(status.recognized_count, 40);
        assert_eq!(status.last_frame.as_ref().map(|f| f.sequence), Some(39));
    }

    #[test]
    fn test_serializes_to_json() {
        let mut status = StationStatus::new("/dev/video0".into());
        status.state = StationState::Running;
        status.apply_stats(SessionStats {
            frames_rendered: 10,
            frames_skipped: 2,
            recognized_count: 1,
        });
        let json: serde_json::Value = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["frames_rendered"], 10);
        assert_eq!(json["source"], "/dev/video0");
        assert!(json["last_frame"].is_null());
    }
}

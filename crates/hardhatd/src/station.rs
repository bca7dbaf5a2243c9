use crate::config::Config;
use crate::sink::StatusSink;
use crate::status::{StationState, StationStatus};
use hardhat_core::{
    DetectorError, EuclideanMatcher, FrameSource, Gallery, GalleryError, GalleryLoad, LoopParts,
    OnnxFaceAnalyzer, RecognitionLoop, SessionStats, TickOutcome, YoloHelmetDetector,
};
use hardhat_hw::{Camera, CameraError, ImageDirSource, ReplayError};
use hardhat_ledger::{AttendanceLedger, LedgerError};
use std::future::Future;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{oneshot, watch};

/// Anything that stops the station from starting. Never raised once the
/// loop is running.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("replay source error: {0}")]
    Replay(#[from] ReplayError),
    #[error("model error: {0}")]
    Model(#[from] DetectorError),
    #[error("gallery error: {0}")]
    Gallery(#[from] GalleryError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("failed to spawn station thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Owner's handle to the station thread.
pub struct StationHandle {
    stop: mpsc::Sender<()>,
    thread: JoinHandle<SessionStats>,
    finished: Option<oneshot::Receiver<()>>,
    status: Arc<watch::Sender<StationStatus>>,
}

impl StationHandle {
    pub fn subscribe(&self) -> watch::Receiver<StationStatus> {
        self.status.subscribe()
    }

    /// Resolves when the loop ends on its own (source exhausted or panic).
    pub async fn finished(&mut self) {
        if let Some(rx) = self.finished.as_mut() {
            let _ = rx.await;
            self.finished = None;
        }
    }

    /// Ask the loop to stop after its current frame and wait for teardown.
    pub fn shutdown(self) -> SessionStats {
        let _ = self.stop.send(());
        match self.thread.join() {
            Ok(stats) => stats,
            Err(_) => {
                tracing::error!("station thread panicked");
                SessionStats::default()
            }
        }
    }
}

/// Drive a running station until `until` resolves or the loop ends by itself,
/// then stop it and join the thread.
///
/// The station is shut down on every path, including when `until` fails, so
/// the camera and ledger are released before the error reaches the caller.
pub async fn supervise<F, E>(mut station: StationHandle, until: F) -> (SessionStats, Result<(), E>)
where
    F: Future<Output = Result<(), E>>,
{
    let outcome = tokio::select! {
        result = until => result,
        _ = station.finished() => {
            tracing::info!("frame source finished");
            Ok(())
        }
    };

    let stats = match tokio::task::spawn_blocking(move || station.shutdown()).await {
        Ok(stats) => stats,
        Err(e) => {
            tracing::error!(error = %e, "station shutdown task failed");
            SessionStats::default()
        }
    };
    (stats, outcome)
}

/// Build the station from configuration and start the recognition loop.
///
/// Opens the frame source, loads all three models, builds the gallery and
/// opens the ledger synchronously, so any missing resource fails startup.
pub fn spawn_station(config: &Config) -> Result<StationHandle, StartupError> {
    let (source, source_label) = open_source(config)?;

    let scrfd_path = config.scrfd_model_path();
    let arcface_path = config.arcface_model_path();
    let mut analyzer = OnnxFaceAnalyzer::load(&scrfd_path, &arcface_path)?;
    tracing::info!(scrfd = %scrfd_path, arcface = %arcface_path, "face models loaded");

    let helmet_path = config.helmet_model_path();
    let helmets = YoloHelmetDetector::load(&helmet_path, config.helmet_class_fallback)?;
    tracing::info!(path = %helmet_path, "helmet model loaded");

    let GalleryLoad { gallery, skipped } = Gallery::load_dir(&config.reference_dir, &mut analyzer)?;
    for s in &skipped {
        tracing::warn!(label = %s.label, reason = %s.reason, "reference skipped");
    }
    if gallery.is_empty() {
        tracing::warn!(dir = %config.reference_dir.display(), "gallery is empty; nobody will be recognized");
    }

    let ledger = AttendanceLedger::open(&config.db_path)?;

    let mut status = StationStatus::new(source_label);
    status.gallery = gallery.names().map(str::to_string).collect();
    let (status_tx, _) = watch::channel(status);
    let status_tx = Arc::new(status_tx);

    let parts = LoopParts {
        source,
        faces: Box::new(analyzer),
        helmets: Box::new(helmets),
        matcher: Box::new(EuclideanMatcher),
        store: Box::new(ledger),
        sink: Box::new(StatusSink::new(Arc::clone(&status_tx), config.snapshot_path.clone())),
    };
    let station = RecognitionLoop::new(parts, gallery, config.loop_settings());

    spawn_loop(station, config.tick_interval(), status_tx)
}

fn open_source(config: &Config) -> Result<(Box<dyn FrameSource>, String), StartupError> {
    if let Some(dir) = &config.replay_dir {
        let source = ImageDirSource::open(dir)?;
        if source.is_empty() {
            tracing::warn!(dir = %dir.display(), "replay directory has no images; the station will stop at once");
        } else {
            tracing::info!(frames = source.len(), "replaying recorded frames");
        }
        return Ok((Box::new(source), format!("replay:{}", dir.display())));
    }

    let mut camera = Camera::open(&config.camera_device)?;
    tracing::info!(
        device = %config.camera_device,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );
    camera.discard_warmup(config.warmup_frames);
    Ok((Box::new(camera), config.camera_device.clone()))
}

/// Time left in the current period after a tick that took `elapsed`. A tick
/// that overruns the period is followed immediately by the next one.
fn next_wait(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

/// Run `station` on a dedicated OS thread, one tick per `interval`.
///
/// The loop owns every capability; they are released when the thread
/// returns or unwinds.
pub fn spawn_loop(
    mut station: RecognitionLoop,
    interval: Duration,
    status: Arc<watch::Sender<StationStatus>>,
) -> Result<StationHandle, StartupError> {
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let thread_status = Arc::clone(&status);

    let thread = std::thread::Builder::new()
        .name("hardhat-station".into())
        .spawn(move || {
            tracing::info!("station thread started");
            thread_status.send_modify(|s| s.state = StationState::Running);

            let final_state = loop {
                let started = Instant::now();
                let outcome = station.tick();
                let stats = station.stats();
                thread_status.send_modify(|s| s.apply_stats(stats));

                if let TickOutcome::Exhausted = outcome {
                    break StationState::Exhausted;
                }
                match stop_rx.recv_timeout(next_wait(interval, started.elapsed())) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break StationState::Stopped,
                }
            };

            let stats = station.stats();
            drop(station);
            thread_status.send_modify(|s| s.state = final_state);
            tracing::info!(
                state = ?final_state,
                frames = stats.frames_rendered,
                skipped = stats.frames_skipped,
                recognized = stats.recognized_count,
                "station thread exiting"
            );
            let _ = done_tx.send(());
            stats
        })
        .map_err(StartupError::Spawn)?;

    Ok(StationHandle {
        stop: stop_tx,
        thread,
        finished: Some(done_rx),
        status,
    })
}

use hardhat_core::helmet::{ClassFallback, DEFAULT_HELMET_CONFIDENCE};
use hardhat_core::pipeline::{LoopSettings, DEFAULT_FACE_SCALE, DEFAULT_TOLERANCE};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Station configuration.
///
/// Defaults, optionally overlaid by the TOML file named in `HARDHAT_CONFIG`,
/// then by `HARDHAT_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Replay still images from this directory instead of opening the camera.
    pub replay_dir: Option<PathBuf>,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// One reference image per known person; the file stem is the label.
    pub reference_dir: PathBuf,
    /// Path to the SQLite attendance database.
    pub db_path: PathBuf,
    /// Maximum embedding distance for a positive identity.
    pub tolerance: f32,
    /// Confidence floor for helmet detections.
    pub helmet_confidence: f32,
    /// Linear downscale applied before face detection.
    pub face_scale: f32,
    /// Delay between recognition ticks.
    pub tick_interval_ms: u64,
    /// Frames discarded at startup while exposure settles.
    pub warmup_frames: usize,
    /// Behavior when the helmet model has no class named "helmet".
    pub helmet_class_fallback: ClassFallback,
    /// Write the latest annotated frame here as a JPEG.
    pub snapshot_path: Option<PathBuf>,
    /// Serve the status interface on the session bus.
    pub dbus_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            replay_dir: None,
            model_dir: hardhat_core::default_model_dir(),
            reference_dir: hardhat_core::data_dir().join("references"),
            db_path: hardhat_ledger::default_db_path(),
            tolerance: DEFAULT_TOLERANCE,
            helmet_confidence: DEFAULT_HELMET_CONFIDENCE,
            face_scale: DEFAULT_FACE_SCALE,
            tick_interval_ms: 30,
            warmup_frames: 4,
            helmet_class_fallback: ClassFallback::default(),
            snapshot_path: None,
            dbus_enabled: true,
        }
    }
}

impl Config {
    /// Load configuration from the optional `HARDHAT_CONFIG` file and
    /// `HARDHAT_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup("HARDHAT_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("HARDHAT_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("HARDHAT_REPLAY_DIR") {
            self.replay_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("HARDHAT_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("HARDHAT_REFERENCE_DIR") {
            self.reference_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("HARDHAT_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("HARDHAT_SNAPSHOT_PATH") {
            self.snapshot_path = Some(PathBuf::from(v));
        }
        self.tolerance = env_parse(lookup, "HARDHAT_TOLERANCE", self.tolerance);
        self.helmet_confidence = env_parse(lookup, "HARDHAT_HELMET_CONFIDENCE", self.helmet_confidence);
        self.face_scale = env_parse(lookup, "HARDHAT_FACE_SCALE", self.face_scale);
        self.tick_interval_ms = env_parse(lookup, "HARDHAT_TICK_INTERVAL_MS", self.tick_interval_ms);
        self.warmup_frames = env_parse(lookup, "HARDHAT_WARMUP_FRAMES", self.warmup_frames);
        if let Some(v) = lookup("HARDHAT_HELMET_CLASS_FALLBACK") {
            self.helmet_class_fallback = v.parse().map_err(|reason| ConfigError::Invalid {
                key: "HARDHAT_HELMET_CLASS_FALLBACK",
                reason,
            })?;
        }
        if let Some(v) = lookup("HARDHAT_DBUS") {
            self.dbus_enabled = v != "0";
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.tolerance > 0.0) {
            return Err(ConfigError::Invalid {
                key: "tolerance",
                reason: format!("{} must be positive", self.tolerance),
            });
        }
        if !(self.face_scale > 0.0 && self.face_scale <= 1.0) {
            return Err(ConfigError::Invalid {
                key: "face_scale",
                reason: format!("{} must be in (0, 1]", self.face_scale),
            });
        }
        if !(0.0..=1.0).contains(&self.helmet_confidence) {
            return Err(ConfigError::Invalid {
                key: "helmet_confidence",
                reason: format!("{} must be in [0, 1]", self.helmet_confidence),
            });
        }
        Ok(())
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            tolerance: self.tolerance,
            helmet_confidence: self.helmet_confidence,
            face_scale: self.face_scale,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_path(hardhat_core::SCRFD_MODEL_FILE)
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_path(hardhat_core::ARCFACE_MODEL_FILE)
    }

    /// Path to the YOLO helmet model.
    pub fn helmet_model_path(&self) -> String {
        self.model_path(hardhat_core::HELMET_MODEL_FILE)
    }

    fn model_path(&self, file: &str) -> String {
        self.model_dir.join(file).to_string_lossy().into_owned()
    }
}

fn env_parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "unparseable value, keeping default");
            default
        }),
        None => default,
    }
}

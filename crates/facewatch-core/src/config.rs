//! Runtime configuration, loaded from `FACEWATCH_*` environment variables.
//!
//! [`Settings`] is the raw, unvalidated view of the environment. The engine
//! only ever sees a [`RecognitionConfig`], produced by
//! [`Settings::recognition`] after validation.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("match threshold must be finite and non-negative, got {0}")]
    InvalidThreshold(f32),
    #[error("detection confidence must be within 0..=1, got {0}")]
    InvalidConfidence(f32),
    #[error("unknown-event cool-down must be a positive number of seconds within range, got {0}")]
    InvalidCooldown(f64),
    #[error("consecutive frame failure budget must be at least 1")]
    ZeroFailureBudget,
}

/// Everything the binaries read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Enrollment root: one subdirectory per identity.
    pub known_faces_dir: PathBuf,
    /// Camera device path, or a directory of still images.
    pub source: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Maximum cosine distance accepted as a match.
    pub threshold: f32,
    pub detection_confidence: f32,
    pub unknown_log_dir: PathBuf,
    pub unknown_cooldown_secs: f64,
    pub max_frame_failures: usize,
    /// `None` when disabled with `FACEWATCH_GALLERY_CACHE=off`.
    pub gallery_cache: Option<PathBuf>,
    /// Where the daemon writes the latest annotated frame, if anywhere.
    pub preview_path: Option<PathBuf>,
    pub dbus_enabled: bool,
}

impl Settings {
    /// Load settings from `FACEWATCH_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FACEWATCH_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_model_dir());

        let gallery_cache = match std::env::var("FACEWATCH_GALLERY_CACHE") {
            Ok(v) if v.eq_ignore_ascii_case("off") || v.is_empty() => None,
            Ok(v) => Some(PathBuf::from(v)),
            Err(_) => Some(data_dir().join("gallery_cache.json")),
        };

        Self {
            known_faces_dir: env_path("FACEWATCH_KNOWN_FACES_DIR", "dataset/known_faces"),
            source: std::env::var("FACEWATCH_SOURCE").unwrap_or_else(|_| "/dev/video0".to_string()),
            model_dir,
            threshold: env_f32("FACEWATCH_THRESHOLD", 0.55),
            detection_confidence: env_f32("FACEWATCH_DETECTION_CONFIDENCE", 0.5),
            unknown_log_dir: env_path("FACEWATCH_UNKNOWN_LOG_DIR", "unknown_logs"),
            unknown_cooldown_secs: env_f64("FACEWATCH_UNKNOWN_COOLDOWN_SECS", 3.0),
            max_frame_failures: env_usize("FACEWATCH_MAX_FRAME_FAILURES", 30),
            gallery_cache,
            preview_path: std::env::var("FACEWATCH_PREVIEW_PATH")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            dbus_enabled: std::env::var("FACEWATCH_DBUS")
                .map(|v| v != "0")
                .unwrap_or(true),
        }
    }

    /// Validate into the immutable configuration the engine runs with.
    pub fn recognition(&self) -> Result<RecognitionConfig, ConfigError> {
        let secs = self.unknown_cooldown_secs;
        if !secs.is_finite() || secs <= 0.0 {
            return Err(ConfigError::InvalidCooldown(secs));
        }
        let unknown_cooldown = Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidCooldown(secs))?;

        let config = RecognitionConfig {
            known_faces_dir: self.known_faces_dir.clone(),
            source: self.source.clone(),
            model_dir: self.model_dir.clone(),
            threshold: self.threshold,
            detection_confidence: self.detection_confidence,
            unknown_log_dir: self.unknown_log_dir.clone(),
            unknown_cooldown,
            max_consecutive_failures: self.max_frame_failures,
            gallery_cache: self.gallery_cache.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Validated, immutable configuration for one recognition session.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionConfig {
    pub known_faces_dir: PathBuf,
    pub source: String,
    pub model_dir: PathBuf,
    pub threshold: f32,
    pub detection_confidence: f32,
    pub unknown_log_dir: PathBuf,
    /// Minimum spacing between unknown events, global for the session.
    /// A frame with several unknown faces produces one event.
    pub unknown_cooldown: Duration,
    pub max_consecutive_failures: usize,
    pub gallery_cache: Option<PathBuf>,
}

impl RecognitionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(ConfigError::InvalidThreshold(self.threshold));
        }
        if !(0.0..=1.0).contains(&self.detection_confidence) {
            return Err(ConfigError::InvalidConfidence(self.detection_confidence));
        }
        if self.unknown_cooldown.is_zero() {
            return Err(ConfigError::InvalidCooldown(0.0));
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::ZeroFailureBudget);
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(SCRFD_MODEL_FILE)
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join(ARCFACE_MODEL_FILE)
    }

    pub fn gallery_cache_path(&self) -> Option<&Path> {
        self.gallery_cache.as_deref()
    }
}

/// `$XDG_DATA_HOME/facewatch/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facewatch")
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

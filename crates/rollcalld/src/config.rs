use std::path::PathBuf;
use std::time::Duration;

use rollcall_vision::DetectorConfig;

/// Daemon configuration, loaded from `ROLLCALL_*` environment variables.
///
/// Every tunable the scan loop depends on lives here rather than as a
/// literal buried in logic: the match threshold, both cadences, the
/// association radius, the detection plausibility bounds, the per-call
/// timeout, and the error escalation bound.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing the two ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Euclidean distance bound for a positive gallery match (inclusive).
    pub match_threshold: f32,
    /// Scan loop tick interval.
    pub frame_interval: Duration,
    /// Run detection every Nth loop tick.
    pub detect_every: u64,
    /// Run recognition every Nth detection pass. Recognition never runs
    /// more often than detection; clamped to >= 1 at load.
    pub recognize_every: u64,
    /// Track association radius as a fraction of a detection's smaller
    /// dimension.
    pub association_radius_factor: f32,
    /// Plausibility bounds applied to raw detector output.
    pub detector: DetectorConfig,
    /// Timeout for one detection or snapshot call into the engine.
    pub call_timeout: Duration,
    /// Consecutive detection failures before the scan goes fatal.
    pub max_consecutive_errors: u32,
    /// How long the "newly recognized" banner stays up.
    pub banner_duration: Duration,
    /// Cadence of the enrollment position check (slower than the scan loop;
    /// no matching happens there).
    pub position_interval: Duration,
    /// Consecutive successful detections before Position auto-advances.
    pub position_stable_count: u32,
}

impl Config {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| rollcall_vision::default_model_dir());

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        Self {
            camera_device: std::env::var("ROLLCALL_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            model_dir,
            db_path,
            match_threshold: env_f32("ROLLCALL_MATCH_THRESHOLD", 0.45),
            frame_interval: Duration::from_millis(env_u64("ROLLCALL_FRAME_INTERVAL_MS", 100)),
            detect_every: env_u64("ROLLCALL_DETECT_EVERY", 2).max(1),
            recognize_every: env_u64("ROLLCALL_RECOGNIZE_EVERY", 4).max(1),
            association_radius_factor: env_f32("ROLLCALL_ASSOCIATION_RADIUS", 0.5),
            detector: DetectorConfig {
                min_confidence: env_f32("ROLLCALL_MIN_CONFIDENCE", 0.3),
                min_aspect_ratio: env_f32("ROLLCALL_MIN_ASPECT", 0.25),
                max_aspect_ratio: env_f32("ROLLCALL_MAX_ASPECT", 4.0),
                min_area_fraction: env_f32("ROLLCALL_MIN_AREA_FRACTION", 0.0001),
                max_area_fraction: env_f32("ROLLCALL_MAX_AREA_FRACTION", 0.9),
            },
            call_timeout: Duration::from_secs(env_u64("ROLLCALL_CALL_TIMEOUT_SECS", 3)),
            max_consecutive_errors: env_u64("ROLLCALL_MAX_CONSECUTIVE_ERRORS", 5) as u32,
            banner_duration: Duration::from_millis(env_u64("ROLLCALL_BANNER_MS", 2500)),
            position_interval: Duration::from_millis(env_u64("ROLLCALL_POSITION_INTERVAL_MS", 500)),
            position_stable_count: env_u64("ROLLCALL_POSITION_STABLE_COUNT", 3) as u32,
        }
    }

    /// Locations of the ONNX model files.
    pub fn model_paths(&self) -> rollcall_vision::ModelPaths {
        rollcall_vision::ModelPaths::in_dir(&self.model_dir)
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

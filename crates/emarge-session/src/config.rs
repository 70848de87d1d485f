use emarge_core::{DetectorConfig, MatchPolicy};
use std::path::PathBuf;

/// Pipeline configuration, loaded from environment variables.
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Directory holding enrolled face samples.
    pub samples_dir: PathBuf,
    /// Path to the trained gallery artifact.
    pub artifact_path: PathBuf,
    /// Path to the attendance ledger database.
    pub db_path: PathBuf,
    /// Detector knobs (minimum face size, score threshold, NMS IoU).
    pub detector: DetectorConfig,
    /// Acceptance policy for recognition sessions.
    pub policy: MatchPolicy,
    /// Enrollment stops after storing this many samples.
    pub sample_cap: u32,
    /// JPEG quality for the annotated stream.
    pub jpeg_quality: u8,
    /// Recognition sessions are stopped by the caller after this long.
    pub recognition_timeout_secs: u64,
}

impl Config {
    /// Load configuration from `EMARGE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("emarge");

        let model_dir = std::env::var("EMARGE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        let samples_dir = std::env::var("EMARGE_SAMPLES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("samples"));

        let artifact_path = std::env::var("EMARGE_ARTIFACT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("gallery.json"));

        let db_path = std::env::var("EMARGE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let detector = DetectorConfig {
            min_size: env_u32("EMARGE_MIN_FACE_SIZE", 60),
            score_threshold: env_f32("EMARGE_SCORE_THRESHOLD", 0.5),
            nms_iou: env_f32("EMARGE_NMS_IOU", 0.4),
        };

        let policy = MatchPolicy {
            accept_threshold: env_i32("EMARGE_ACCEPT_THRESHOLD", 62),
            ..MatchPolicy::default()
        };

        Self {
            camera_device: std::env::var("EMARGE_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            model_dir,
            samples_dir,
            artifact_path,
            db_path,
            detector,
            policy,
            sample_cap: env_u32("EMARGE_SAMPLE_CAP", 20),
            jpeg_quality: env_u32("EMARGE_JPEG_QUALITY", 80).clamp(1, 100) as u8,
            recognition_timeout_secs: env_u64("EMARGE_RECOGNITION_TIMEOUT_SECS", 30),
        }
    }

    /// Path to the face detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir.join("det_10g.onnx").to_string_lossy().into_owned()
    }

    /// Path to the face embedding model.
    pub fn embedder_model_path(&self) -> String {
        self.model_dir.join("w600k_r50.onnx").to_string_lossy().into_owned()
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_i32(key: &str, default: i32) -> i32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

use crate::session::SessionSettings;
use crate::store::DEFAULT_BUFFER_SECS;
use crate::types::EuclideanMatcher;
use std::path::PathBuf;

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capture device index; opens `/dev/video<N>` (default: 0).
    pub camera_index: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Maximum Euclidean distance for a match. Lower is stricter.
    pub tolerance: f64,
    /// Minimum seconds between two logged events for one identity.
    pub buffer_secs: i64,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Append-only text log of recognitions.
    pub log_path: PathBuf,
    /// Where enrollment snapshots are saved.
    pub faces_dir: PathBuf,
    /// Face analyzer helper command line.
    pub analyzer_cmd: String,
    /// Maximum frames per second forwarded to the frame sink.
    pub sink_fps: u32,
}

impl Config {
    /// Load configuration from `FACELOG_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facelog");

        Self {
            camera_index: env_parse("FACELOG_CAMERA_INDEX", 0),
            frame_width: env_parse("FACELOG_FRAME_WIDTH", 640),
            frame_height: env_parse("FACELOG_FRAME_HEIGHT", 480),
            tolerance: env_parse("FACELOG_TOLERANCE", EuclideanMatcher::DEFAULT_TOLERANCE),
            buffer_secs: env_parse("FACELOG_BUFFER_SECS", DEFAULT_BUFFER_SECS),
            db_path: env_path("FACELOG_DB_PATH").unwrap_or_else(|| data_dir.join("faces.db")),
            log_path: env_path("FACELOG_LOG_PATH").unwrap_or_else(|| data_dir.join("logs.txt")),
            faces_dir: env_path("FACELOG_FACES_DIR").unwrap_or_else(|| data_dir.join("faces")),
            analyzer_cmd: std::env::var("FACELOG_ANALYZER_CMD")
                .unwrap_or_else(|_| "facelog-encoder".to_string()),
            sink_fps: env_parse("FACELOG_SINK_FPS", 15),
        }
    }

    /// V4L2 device path for the configured index.
    pub fn camera_device(&self) -> String {
        format!("/dev/video{}", self.camera_index)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            db_path: self.db_path.clone(),
            log_path: self.log_path.clone(),
            faces_dir: self.faces_dir.clone(),
            tolerance: self.tolerance,
            buffer_secs: self.buffer_secs,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

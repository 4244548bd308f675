use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read camera file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid camera file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("camera #{index}: {reason}")]
    InvalidCamera { index: usize, reason: String },
    #[error("no cameras configured")]
    NoCameras,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// TOML file listing the cameras.
    pub cameras_path: PathBuf,
    /// Address the HTTP API binds to.
    pub listen_addr: SocketAddr,
    /// Minimum gap between two attendance events at the same location.
    pub rebind_window: Duration,
    /// How often the ledger cache is cleared.
    pub cache_reset_interval: Duration,
    /// LBPH distance below which a face counts as recognised.
    pub match_threshold: f64,
    pub gesture_debounce: Duration,
    /// Monitor loop period.
    pub tick: Duration,
    /// Upper bound on one camera read.
    pub read_timeout: Duration,
    /// Delay before retrying a camera that failed to open.
    pub reopen_after: Duration,
    /// Upper bound on one attendance or presence write.
    pub write_timeout: Duration,
    /// Canonical frame size every camera is normalised to.
    pub frame_width: u32,
    pub frame_height: u32,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`], reading variables through `var`.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_home = rollcall_core::data_home(&var);
        let config_dir = var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".config")
            })
            .join("rollcall");

        Self {
            db_path: var("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| rollcall_store::db_path_in(&data_home)),
            model_dir: var("ROLLCALL_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| rollcall_core::model_dir_in(&data_home)),
            cameras_path: var("ROLLCALL_CAMERAS")
                .map(PathBuf::from)
                .unwrap_or_else(|| config_dir.join("cameras.toml")),
            listen_addr: parse_or(&var, "ROLLCALL_LISTEN_ADDR", SocketAddr::from(([127, 0, 0, 1], 5000))),
            rebind_window: Duration::from_secs(parse_or(&var, "ROLLCALL_REBIND_WINDOW_SECS", 7200)),
            cache_reset_interval: Duration::from_secs(parse_or(&var, "ROLLCALL_CACHE_RESET_SECS", 7200).max(1)),
            match_threshold: parse_or(&var, "ROLLCALL_MATCH_THRESHOLD", rollcall_core::recognizer::DEFAULT_MATCH_THRESHOLD),
            gesture_debounce: Duration::from_millis(parse_or(&var, "ROLLCALL_GESTURE_DEBOUNCE_MS", 500)),
            tick: Duration::from_millis(parse_or(&var, "ROLLCALL_TICK_MS", 100).max(1)),
            read_timeout: Duration::from_millis(parse_or(&var, "ROLLCALL_READ_TIMEOUT_MS", 2000).max(1)),
            reopen_after: Duration::from_secs(parse_or(&var, "ROLLCALL_REOPEN_SECS", 10)),
            write_timeout: Duration::from_millis(parse_or(&var, "ROLLCALL_WRITE_TIMEOUT_MS", 250).max(1)),
            frame_width: parse_or(&var, "ROLLCALL_FRAME_WIDTH", 640u32).max(1),
            frame_height: parse_or(&var, "ROLLCALL_FRAME_HEIGHT", 480u32).max(1),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Cameras from [`Config::cameras_path`]. A missing file yields the single
    /// default camera.
    pub fn load_cameras(&self) -> Result<Vec<CameraConfig>, ConfigError> {
        load_cameras(&self.cameras_path)
    }
}

/// One `[[camera]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CameraConfig {
    pub name: String,
    /// Device index, `/dev/videoN`, or snapshot URL.
    pub source: String,
    /// Location label written with each attendance event.
    pub location: String,
    #[serde(default = "default_zoom")]
    pub zoom: f32,
}

impl CameraConfig {
    pub fn default_camera() -> Self {
        Self {
            name: "default".to_string(),
            source: "0".to_string(),
            location: "Default".to_string(),
            zoom: 1.0,
        }
    }
}

fn default_zoom() -> f32 {
    1.0
}

#[derive(Deserialize)]
struct CameraFile {
    #[serde(default)]
    camera: Vec<CameraConfig>,
}

pub fn load_cameras(path: &Path) -> Result<Vec<CameraConfig>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_cameras(&text),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no camera file; using default camera 0");
            Ok(vec![CameraConfig::default_camera()])
        }
        Err(source) => Err(ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub fn parse_cameras(text: &str) -> Result<Vec<CameraConfig>, ConfigError> {
    let file: CameraFile = toml::from_str(text)?;
    if file.camera.is_empty() {
        return Err(ConfigError::NoCameras);
    }
    for (index, camera) in file.camera.iter().enumerate() {
        let invalid = |reason: &str| ConfigError::InvalidCamera {
            index,
            reason: reason.to_string(),
        };
        if camera.name.trim().is_empty() {
            return Err(invalid("name is empty"));
        }
        if camera.location.trim().is_empty() {
            return Err(invalid("location is empty"));
        }
        if camera.source.trim().is_empty() {
            return Err(invalid("source is empty"));
        }
        if !(camera.zoom >= 1.0) {
            return Err(invalid("zoom must be at least 1.0"));
        }
    }
    Ok(file.camera)
}

fn parse_or<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match var(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            default
        }),
        None => default,
    }
}

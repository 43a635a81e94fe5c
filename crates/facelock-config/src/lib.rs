use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const PRIMARY_CONFIG_PATH: &str = "/etc/facelock/config.toml";
pub const SECONDARY_CONFIG_PATH: &str = "/usr/local/etc/facelock/config.toml";
pub const TEMPLATE_PATH_ENV: &str = "FACELOCK_TEMPLATE_PATH";
pub const DEFAULT_TEMPLATE_FILE: &str = ".local/share/facelock/face_templates.dat";
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.7;
pub const DEFAULT_MATCHES_REQUIRED: u32 = 3;
pub const DEFAULT_WINDOW_SECS: f64 = 5.0;
pub const DEFAULT_FRAME_SKIP: u32 = 2;
pub const DEFAULT_CROP_SIZE: u32 = 64;
pub const DEFAULT_MIN_FACE_SIZE: u32 = 50;
pub const DEFAULT_RETRY_INTERVAL_MILLIS: u64 = 1000;
pub const DEFAULT_VIDEO_DEVICE: &str = "/dev/video0";
pub const DEFAULT_PIXEL_FORMAT: &str = "YUYV";
pub const DEFAULT_FRAME_TIMEOUT_MILLIS: u64 = 2000;
pub const DEFAULT_WARMUP_FRAMES: u32 = 0;
pub const DEFAULT_ENROLLMENT_DIR: &str = "face_model";

/// How template payloads are protected at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionMode {
    /// Use the OS keyring when it answers, otherwise store plain payloads.
    #[default]
    Auto,
    Keyring,
    None,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub similarity_threshold: Option<f64>,
    pub matches_required: Option<u32>,
    pub window_secs: Option<f64>,
    pub frame_skip: Option<u32>,
    pub crop_width: Option<u32>,
    pub crop_height: Option<u32>,
    pub min_face_size: Option<u32>,
    pub retry_interval_millis: Option<u64>,
    pub template_path: Option<PathBuf>,
    pub video_device: Option<String>,
    pub pixel_format: Option<String>,
    pub frame_timeout_millis: Option<u64>,
    pub warmup_frames: Option<u32>,
    pub protection: Option<ProtectionMode>,
    pub enrollment_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub similarity_threshold: f64,
    pub matches_required: u32,
    pub window: Duration,
    pub frame_skip: u32,
    pub crop_size: (u32, u32),
    pub min_face_size: u32,
    pub retry_interval: Duration,
    pub template_path: Option<PathBuf>,
    pub video_device: String,
    pub pixel_format: String,
    pub frame_timeout: Duration,
    pub warmup_frames: u32,
    pub protection: ProtectionMode,
    pub enrollment_dir: PathBuf,
}

impl ResolvedConfig {
    pub fn from_raw(raw: ConfigFile) -> Self {
        // Values too large for a Duration fall back like non-positive ones.
        let window = raw
            .window_secs
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or_else(|| Duration::from_secs_f64(DEFAULT_WINDOW_SECS));
        let threshold = raw
            .similarity_threshold
            .filter(|value| value.is_finite())
            .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD)
            .clamp(0.0, 1.0);

        Self {
            similarity_threshold: threshold,
            matches_required: raw
                .matches_required
                .unwrap_or(DEFAULT_MATCHES_REQUIRED)
                .max(1),
            window,
            frame_skip: raw.frame_skip.unwrap_or(DEFAULT_FRAME_SKIP).max(1),
            crop_size: (
                raw.crop_width.unwrap_or(DEFAULT_CROP_SIZE).max(1),
                raw.crop_height.unwrap_or(DEFAULT_CROP_SIZE).max(1),
            ),
            min_face_size: raw.min_face_size.unwrap_or(DEFAULT_MIN_FACE_SIZE),
            retry_interval: Duration::from_millis(
                raw.retry_interval_millis
                    .unwrap_or(DEFAULT_RETRY_INTERVAL_MILLIS),
            ),
            template_path: raw.template_path,
            video_device: raw
                .video_device
                .unwrap_or_else(|| DEFAULT_VIDEO_DEVICE.to_string()),
            pixel_format: raw
                .pixel_format
                .unwrap_or_else(|| DEFAULT_PIXEL_FORMAT.to_string()),
            frame_timeout: Duration::from_millis(
                raw.frame_timeout_millis
                    .unwrap_or(DEFAULT_FRAME_TIMEOUT_MILLIS)
                    .max(1),
            ),
            warmup_frames: raw.warmup_frames.unwrap_or(DEFAULT_WARMUP_FRAMES),
            protection: raw.protection.unwrap_or_default(),
            enrollment_dir: raw
                .enrollment_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ENROLLMENT_DIR)),
        }
    }

    /// Template file location: explicit override, then config, then
    /// `$FACELOCK_TEMPLATE_PATH`, then a file under `$HOME`.
    pub fn resolve_template_path(&self, override_path: Option<&Path>) -> PathBuf {
        if let Some(path) = override_path {
            return path.to_path_buf();
        }
        if let Some(path) = &self.template_path {
            return path.clone();
        }
        default_template_path(env::var_os(TEMPLATE_PATH_ENV), env::var_os("HOME"))
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self::from_raw(ConfigFile::default())
    }
}

fn default_template_path(
    env_value: Option<std::ffi::OsString>,
    home: Option<std::ffi::OsString>,
) -> PathBuf {
    if let Some(value) = env_value.filter(|value| !value.is_empty()) {
        return PathBuf::from(value);
    }
    match home.filter(|value| !value.is_empty()) {
        Some(home) => PathBuf::from(home).join(DEFAULT_TEMPLATE_FILE),
        None => PathBuf::from("face_templates.dat"),
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub contents: ConfigFile,
    pub source: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfigWithSource {
    pub resolved: ResolvedConfig,
    pub source: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

pub fn default_config_paths() -> [PathBuf; 2] {
    [
        PathBuf::from(PRIMARY_CONFIG_PATH),
        PathBuf::from(SECONDARY_CONFIG_PATH),
    ]
}

pub fn load_resolved_config() -> Result<ResolvedConfigWithSource, ConfigError> {
    load_resolved_from_paths(&default_config_paths())
}

pub fn load_from_paths(paths: &[PathBuf]) -> Result<Option<LoadedConfig>, ConfigError> {
    for path in paths {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let parsed =
                    toml::from_str::<ConfigFile>(&contents).map_err(|err| ConfigError::Parse {
                        path: path.clone(),
                        message: err.to_string(),
                    })?;
                return Ok(Some(LoadedConfig {
                    contents: parsed,
                    source: path.clone(),
                }));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(ConfigError::Read {
                    path: path.clone(),
                    source: err,
                })
            }
        }
    }

    Ok(None)
}

pub fn load_resolved_from_paths(
    paths: &[PathBuf],
) -> Result<ResolvedConfigWithSource, ConfigError> {
    match load_from_paths(paths)? {
        Some(entry) => Ok(ResolvedConfigWithSource {
            resolved: ResolvedConfig::from_raw(entry.contents),
            source: Some(entry.source),
        }),
        None => Ok(ResolvedConfigWithSource {
            resolved: ResolvedConfig::default(),
            source: None,
        }),
    }
}

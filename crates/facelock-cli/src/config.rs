use std::env;
use std::path::{Path, PathBuf};

use facelock_config::{ConfigError, ProtectionMode, ResolvedConfig, ResolvedConfigWithSource};
use facelock_core::capture::{CaptureConfig, DeviceLocator};
use facelock_core::errors::{AppError, AppResult};
use facelock_core::faces::{EnrollmentConfig, FileTemplateStore, LivenessConfig};
use facelock_core::protect::{select_protector, Protector, ProtectorSelection};
use facelock_core::unlock::UnlockConfig;
use tracing::{debug, info};

pub type ProtectedStore = FileTemplateStore<Box<dyn Protector>>;

pub fn load_settings() -> AppResult<ResolvedConfig> {
    let ResolvedConfigWithSource { resolved, source } =
        facelock_config::load_resolved_config().map_err(map_config_error)?;
    match source {
        Some(path) => info!(path = %path.display(), "loaded configuration"),
        None => debug!("no configuration file found; using built-in defaults"),
    }
    Ok(resolved)
}

pub fn map_config_error(err: ConfigError) -> AppError {
    match err {
        ConfigError::Read { path, source } => AppError::ConfigRead { path, source },
        ConfigError::Parse { path, message } => AppError::ConfigParse { path, message },
    }
}

pub fn liveness_config(config: &ResolvedConfig) -> LivenessConfig {
    LivenessConfig {
        tolerance: config.similarity_threshold,
        matches_required: config.matches_required,
        window: config.window,
        frame_skip: config.frame_skip,
        canonical_crop_size: config.crop_size,
    }
}

pub fn enrollment_config(config: &ResolvedConfig) -> EnrollmentConfig {
    EnrollmentConfig {
        canonical_crop_size: config.crop_size,
    }
}

pub fn unlock_config(config: &ResolvedConfig, max_attempts: Option<u32>) -> UnlockConfig {
    UnlockConfig {
        liveness: liveness_config(config),
        retry_interval: config.retry_interval,
        max_attempts,
    }
}

pub fn capture_config(config: &ResolvedConfig, device_override: Option<&str>) -> CaptureConfig {
    let device = device_override.unwrap_or(&config.video_device);
    CaptureConfig {
        device: DeviceLocator::parse(device),
        pixel_format: config.pixel_format.clone(),
        warmup_frames: config.warmup_frames,
        frame_timeout: config.frame_timeout,
    }
}

pub fn protector_selection(mode: ProtectionMode) -> ProtectorSelection {
    match mode {
        ProtectionMode::Auto => ProtectorSelection::Auto,
        ProtectionMode::Keyring => ProtectorSelection::Keyring,
        ProtectionMode::None => ProtectorSelection::Passthrough,
    }
}

pub fn open_store(config: &ResolvedConfig, override_path: Option<&Path>) -> AppResult<ProtectedStore> {
    let path = config.resolve_template_path(override_path);
    let protector = select_protector(protector_selection(config.protection), &current_user())?;
    debug!(path = %path.display(), protector = protector.name(), "opened template store");
    Ok(FileTemplateStore::new(path, protector))
}

/// Resolves `--image`: a 1-based number into the enrollment dir, a relative
/// name found in the enrollment dir, or else the path as given.
pub fn resolve_image_argument(value: &str, enrollment_dir: &Path) -> AppResult<PathBuf> {
    let Ok(number) = value.parse::<usize>() else {
        let path = PathBuf::from(value);
        if path.is_relative() {
            let in_dir = enrollment_dir.join(&path);
            if in_dir.is_file() {
                return Ok(in_dir);
            }
        }
        return Ok(path);
    };
    let images = facelock_core::faces::list_enrollment_images(enrollment_dir)?;
    number
        .checked_sub(1)
        .and_then(|index| images.get(index).cloned())
        .ok_or_else(|| {
            AppError::InvalidConfig(format!(
                "image number {number} is out of range; {} image(s) in {}",
                images.len(),
                enrollment_dir.display()
            ))
        })
}

fn current_user() -> String {
    env::var("USER")
        .or_else(|_| env::var("LOGNAME"))
        .unwrap_or_else(|_| "facelock".to_string())
}

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use image::ImageError;
use thiserror::Error;

use crate::faces::store::StoreError;
use crate::protect::ProtectError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to open video device {device}: {source}")]
    DeviceOpen {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("camera {device} unavailable: {message}")]
    Acquisition { device: String, message: String },

    #[error("device capability error: {0}")]
    Capability(String),

    #[error("unsupported pixel format '{0}' for selected device")]
    UnsupportedFormat(String),

    #[error("input file not found or unreadable: {path}")]
    MissingInput { path: PathBuf },

    #[error("unsupported image type {path}; expected one of {expected}")]
    UnsupportedImage { path: PathBuf, expected: String },

    #[error("failed to decode image {path}: {source}")]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: ImageError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed processing frame data: {0}")]
    FrameProcessing(String),

    #[error("face detector failed: {0}")]
    Detector(String),

    #[error("no face detected for enrollment step {step} ({instruction})")]
    NoFaceDetected { step: usize, instruction: String },

    #[error("no face templates could be enrolled: {0}")]
    NoTemplates(String),

    #[error("enrollment cannot {action} while {state}")]
    EnrollmentState { action: &'static str, state: String },

    #[error("contract violation: {0}")]
    Precondition(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("template protection unavailable: {0}")]
    Protection(#[from] ProtectError),

    #[error("failed to read configuration file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration file {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("enrollment aborted by user")]
    Aborted,

    #[error("unlock worker stopped unexpectedly: {0}")]
    Worker(String),

    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            AppError::MissingInput { .. } => ExitCode::from(2),
            AppError::UnsupportedImage { .. } => ExitCode::from(2),
            AppError::ImageDecode { .. } => ExitCode::from(2),
            AppError::UnsupportedFormat(_) => ExitCode::from(2),
            AppError::Capability(_) => ExitCode::from(3),
            AppError::DeviceOpen { .. } => ExitCode::from(4),
            AppError::Acquisition { .. } => ExitCode::from(4),
            AppError::NoFaceDetected { .. } => ExitCode::from(5),
            AppError::NoTemplates(_) => ExitCode::from(5),
            AppError::Store(StoreError::NotFound { .. }) => ExitCode::from(6),
            AppError::Store(StoreError::Corrupt { .. }) => ExitCode::from(6),
            AppError::Store(StoreError::Protection { .. }) => ExitCode::from(7),
            AppError::Protection(_) => ExitCode::from(7),
            AppError::ConfigRead { .. } => ExitCode::from(2),
            AppError::ConfigParse { .. } => ExitCode::from(2),
            AppError::InvalidConfig(_) => ExitCode::from(2),
            AppError::Aborted => ExitCode::from(130),
            _ => ExitCode::from(1),
        }
    }

    pub fn human_message(&self) -> String {
        match self {
            AppError::Store(StoreError::NotFound { path }) => format!(
                "no enrolled face templates at {}; run `facelock enroll` first",
                path.display()
            ),
            AppError::Store(StoreError::Corrupt { path, .. }) => format!(
                "{self}; the template file {} must be re-enrolled with `facelock enroll`",
                path.display()
            ),
            AppError::Store(StoreError::Protection { .. }) => format!(
                "{self}; the templates were sealed for a different user or machine"
            ),
            _ => self.to_string(),
        }
    }

    /// Camera failures end the current attempt but may succeed on a later one.
    pub fn is_acquisition(&self) -> bool {
        matches!(
            self,
            AppError::DeviceOpen { .. } | AppError::Acquisition { .. } | AppError::Capability(_)
        )
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_advise_reenrollment() {
        let err = AppError::from(StoreError::Corrupt {
            path: PathBuf::from("/tmp/t.dat"),
            message: "truncated".into(),
        });
        let message = err.human_message();
        assert!(message.contains("re-enrolled"));
        assert_eq!(err.exit_code(), ExitCode::from(6));
    }

    #[test]
    fn acquisition_errors_are_classified() {
        let err = AppError::Acquisition {
            device: "/dev/video0".into(),
            message: "timed out".into(),
        };
        assert!(err.is_acquisition());
        assert!(!AppError::Precondition("x".into()).is_acquisition());
    }
}

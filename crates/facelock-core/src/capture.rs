pub mod device;
pub mod directory;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use image::GrayImage;
use tracing::{debug, info};
use v4l::capability::{Capabilities, Flags as CapabilityFlags};
use v4l::format::{Format, FourCC};

use crate::errors::{AppError, AppResult};

use self::device::{CaptureDevice, CaptureDeviceOpener, CaptureStream, V4lCaptureDevice};

pub use self::directory::ImageDirectorySource;

const STREAM_BUFFERS: u32 = 4;

/// A camera (or camera stand-in) that can be opened for one session at a time.
///
/// The returned stream borrows the source mutably, so a second session cannot
/// start until the first stream is dropped; dropping it releases the device.
pub trait FrameSource {
    fn acquire(&mut self) -> AppResult<Box<dyn FrameStream + '_>>;
}

pub trait FrameStream {
    /// `Ok(None)` is a transient miss; errors mean the device is gone.
    fn next_frame(&mut self) -> AppResult<Option<GrayImage>>;
    fn source_name(&self) -> &str;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn acquire(&mut self) -> AppResult<Box<dyn FrameStream + '_>> {
        (**self).acquire()
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub device: DeviceLocator,
    pub pixel_format: String,
    pub warmup_frames: u32,
    pub frame_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: DeviceLocator::Index(0),
            pixel_format: "YUYV".into(),
            warmup_frames: 0,
            frame_timeout: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceLocator {
    Index(u32),
    Path(PathBuf),
}

impl DeviceLocator {
    pub fn parse(device: &str) -> Self {
        if let Ok(index) = device.parse::<u32>() {
            DeviceLocator::Index(index)
        } else {
            DeviceLocator::Path(PathBuf::from(device))
        }
    }

    pub fn display(&self) -> String {
        match self {
            DeviceLocator::Index(i) => format!("/dev/video{i}"),
            DeviceLocator::Path(path) => path.display().to_string(),
        }
    }

    fn open(&self) -> Result<v4l::Device, AppError> {
        let opened = match self {
            DeviceLocator::Index(index) => v4l::Device::new(*index as usize),
            DeviceLocator::Path(path) => v4l::Device::with_path(path),
        };
        opened.map_err(|source| AppError::DeviceOpen {
            device: self.display(),
            source,
        })
    }
}

/// Video4Linux camera, opened anew for each session.
pub struct V4lFrameSource {
    config: CaptureConfig,
    opener: Arc<CaptureDeviceOpener>,
}

impl V4lFrameSource {
    pub fn new(config: CaptureConfig) -> Self {
        Self::with_opener(
            config,
            Arc::new(|locator: &DeviceLocator| {
                V4lCaptureDevice::open(locator).map(|device| Box::new(device) as Box<dyn CaptureDevice>)
            }),
        )
    }

    pub fn with_opener(config: CaptureConfig, opener: Arc<CaptureDeviceOpener>) -> Self {
        Self { config, opener }
    }
}

impl FrameSource for V4lFrameSource {
    fn acquire(&mut self) -> AppResult<Box<dyn FrameStream + '_>> {
        let mut device = (self.opener)(&self.config.device)?;
        let name = device.name().to_string();
        debug!(device = %name, "opened capture device");

        ensure_capabilities(&device.query_caps()?)?;

        let requested = parse_fourcc(&self.config.pixel_format)
            .ok_or_else(|| AppError::UnsupportedFormat(self.config.pixel_format.clone()))?;
        let formats = device.enum_formats()?;
        if !formats.iter().any(|format| format.fourcc == requested) {
            return Err(AppError::UnsupportedFormat(fourcc_to_string(requested)));
        }

        let mut format = device.format()?;
        format.fourcc = requested;
        let format = device.set_format(&format)?;
        info!(
            device = %name,
            pixel_format = %fourcc_to_string(format.fourcc),
            width = format.width,
            height = format.height,
            "camera ready"
        );

        let mut raw = device.start_stream(STREAM_BUFFERS, self.config.frame_timeout)?;
        for idx in 0..self.config.warmup_frames {
            raw.next()?;
            debug!(frame = idx + 1, "discarded warm-up frame");
        }

        Ok(Box::new(V4lFrameStream { raw, format, name }))
    }
}

struct V4lFrameStream {
    raw: Box<dyn CaptureStream>,
    format: Format,
    name: String,
}

impl FrameStream for V4lFrameStream {
    fn next_frame(&mut self) -> AppResult<Option<GrayImage>> {
        let data = self.raw.next()?;
        match convert_frame_to_image(&data, &self.format) {
            Ok(image) => Ok(Some(image)),
            Err(err) => {
                debug!(device = %self.name, error = %err, "dropping unusable frame");
                Ok(None)
            }
        }
    }

    fn source_name(&self) -> &str {
        &self.name
    }
}

fn ensure_capabilities(caps: &Capabilities) -> AppResult<()> {
    let flags = caps.capabilities;
    let mut reasons = Vec::new();
    if !flags.contains(CapabilityFlags::VIDEO_CAPTURE) {
        reasons.push("missing VIDEO_CAPTURE".to_string());
    }
    if !flags.contains(CapabilityFlags::STREAMING) {
        reasons.push("missing STREAMING".to_string());
    }
    if reasons.is_empty() {
        Ok(())
    } else {
        Err(AppError::Capability(reasons.join(", ")))
    }
}

/// Converts a raw Y16, GREY or YUYV buffer to 8-bit grayscale.
pub fn convert_frame_to_image(data: &[u8], format: &Format) -> AppResult<GrayImage> {
    let width = format.width as usize;
    let height = format.height as usize;
    let expected_pixels = width * height;
    let pixel_format = fourcc_to_string(format.fourcc);

    let short_buffer = |expected: usize| {
        AppError::FrameProcessing(format!(
            "expected {expected} bytes for {pixel_format} frame, got {}",
            data.len()
        ))
    };

    let buffer = match pixel_format.as_str() {
        "Y16" => {
            if data.len() < expected_pixels * 2 {
                return Err(short_buffer(expected_pixels * 2));
            }
            // Little-endian 16-bit samples; keep the high byte.
            data[..expected_pixels * 2]
                .chunks_exact(2)
                .map(|sample| sample[1])
                .collect()
        }
        "GREY" | "Y08" => {
            if data.len() < expected_pixels {
                return Err(short_buffer(expected_pixels));
            }
            data[..expected_pixels].to_vec()
        }
        "YUYV" => {
            let expected_bytes = expected_pixels * 2;
            if data.len() < expected_bytes || expected_pixels % 2 != 0 {
                return Err(short_buffer(expected_bytes));
            }
            // Luma sits at every even byte.
            data[..expected_bytes].iter().step_by(2).copied().collect()
        }
        other => {
            return Err(AppError::FrameProcessing(format!(
                "unsupported conversion from pixel format {other}"
            )))
        }
    };

    GrayImage::from_vec(format.width, format.height, buffer)
        .ok_or_else(|| AppError::FrameProcessing("failed to build image buffer".into()))
}

pub fn parse_fourcc(code: &str) -> Option<FourCC> {
    if code.is_empty() || code.len() > 4 {
        return None;
    }
    let mut repr = [b' '; 4];
    for (i, byte) in code.as_bytes().iter().enumerate() {
        repr[i] = *byte;
    }
    Some(FourCC::new(&repr))
}

pub fn fourcc_to_string(fourcc: FourCC) -> String {
    String::from_utf8_lossy(&fourcc.repr)
        .trim_matches(|c| c == char::from(0) || c == ' ')
        .to_string()
}

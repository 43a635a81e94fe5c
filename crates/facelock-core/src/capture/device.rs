use std::io;
use std::time::Duration;

use v4l::buffer::Type;
use v4l::capability::Capabilities;
use v4l::format::Format;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;

use crate::errors::{AppError, AppResult};

use super::DeviceLocator;

#[cfg(test)]
use std::collections::VecDeque;
#[cfg(test)]
use v4l::capability::Flags as CapabilityFlags;

/// The subset of a V4L2 device used to start a capture session.
pub trait CaptureDevice {
    fn name(&self) -> &str;
    fn query_caps(&self) -> AppResult<Capabilities>;
    fn enum_formats(&self) -> AppResult<Vec<v4l::format::Description>>;
    fn format(&self) -> AppResult<Format>;
    fn set_format(&mut self, format: &Format) -> AppResult<Format>;
    /// Consumes the device; it is closed when the returned stream drops.
    fn start_stream(
        self: Box<Self>,
        buffer_count: u32,
        timeout: Duration,
    ) -> AppResult<Box<dyn CaptureStream>>;
}

pub trait CaptureStream {
    fn next(&mut self) -> AppResult<Vec<u8>>;
}

pub type CaptureDeviceOpener =
    dyn Fn(&DeviceLocator) -> AppResult<Box<dyn CaptureDevice>> + Send + Sync;

pub struct V4lCaptureDevice {
    inner: v4l::Device,
    name: String,
}

impl V4lCaptureDevice {
    pub fn open(locator: &DeviceLocator) -> AppResult<Self> {
        Ok(Self {
            inner: locator.open()?,
            name: locator.display(),
        })
    }

    fn acquisition(&self, err: io::Error) -> AppError {
        acquisition_error(&self.name, err)
    }
}

fn acquisition_error(device: &str, err: io::Error) -> AppError {
    let message = if err.kind() == io::ErrorKind::TimedOut {
        "timed out waiting for a frame".to_string()
    } else {
        err.to_string()
    };
    AppError::Acquisition {
        device: device.to_string(),
        message,
    }
}

impl CaptureDevice for V4lCaptureDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_caps(&self) -> AppResult<Capabilities> {
        self.inner.query_caps().map_err(|err| self.acquisition(err))
    }

    fn enum_formats(&self) -> AppResult<Vec<v4l::format::Description>> {
        self.inner.enum_formats().map_err(|err| self.acquisition(err))
    }

    fn format(&self) -> AppResult<Format> {
        self.inner.format().map_err(|err| self.acquisition(err))
    }

    fn set_format(&mut self, format: &Format) -> AppResult<Format> {
        self.inner
            .set_format(format)
            .map_err(|err| acquisition_error(&self.name, err))
    }

    fn start_stream(
        self: Box<Self>,
        buffer_count: u32,
        timeout: Duration,
    ) -> AppResult<Box<dyn CaptureStream>> {
        let mut stream = Stream::with_buffers(&self.inner, Type::VideoCapture, buffer_count)
            .map_err(|err| self.acquisition(err))?;
        stream.set_timeout(timeout);
        let V4lCaptureDevice { inner, name } = *self;
        Ok(Box::new(V4lStream {
            stream,
            _device: inner,
            name,
        }))
    }
}

// Field order matters: the stream stops before the device handle closes.
struct V4lStream {
    stream: Stream<'static>,
    _device: v4l::Device,
    name: String,
}

impl CaptureStream for V4lStream {
    fn next(&mut self) -> AppResult<Vec<u8>> {
        match self.stream.next() {
            Ok((data, _)) => Ok(data.to_vec()),
            Err(err) => Err(acquisition_error(&self.name, err)),
        }
    }
}

#[cfg(test)]
pub struct FakeCaptureDevice {
    pub caps: Capabilities,
    pub formats: Vec<v4l::format::Description>,
    pub format: Format,
    pub frames: VecDeque<AppResult<Vec<u8>>>,
    pub released: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
impl FakeCaptureDevice {
    pub fn new(format: Format) -> Self {
        Self {
            caps: Capabilities {
                driver: "fake".into(),
                card: "fake".into(),
                bus: "loopback".into(),
                version: (0, 0, 0),
                capabilities: CapabilityFlags::VIDEO_CAPTURE | CapabilityFlags::STREAMING,
            },
            formats: vec![v4l::format::Description {
                index: 0,
                typ: 1,
                flags: v4l::format::description::Flags::empty(),
                description: "fake".into(),
                fourcc: format.fourcc,
            }],
            format,
            frames: VecDeque::new(),
            released: Default::default(),
        }
    }
}

#[cfg(test)]
impl CaptureDevice for FakeCaptureDevice {
    fn name(&self) -> &str {
        "/dev/fake0"
    }

    fn query_caps(&self) -> AppResult<Capabilities> {
        Ok(Capabilities {
            driver: self.caps.driver.clone(),
            card: self.caps.card.clone(),
            bus: self.caps.bus.clone(),
            version: self.caps.version,
            capabilities: self.caps.capabilities,
        })
    }

    fn enum_formats(&self) -> AppResult<Vec<v4l::format::Description>> {
        Ok(self
            .formats
            .iter()
            .map(|desc| v4l::format::Description {
                index: desc.index,
                typ: desc.typ,
                flags: desc.flags,
                description: desc.description.clone(),
                fourcc: desc.fourcc,
            })
            .collect())
    }

    fn format(&self) -> AppResult<Format> {
        Ok(self.format)
    }

    fn set_format(&mut self, format: &Format) -> AppResult<Format> {
        self.format = Format::new(format.width, format.height, format.fourcc);
        Ok(self.format)
    }

    fn start_stream(
        self: Box<Self>,
        _buffer_count: u32,
        _timeout: Duration,
    ) -> AppResult<Box<dyn CaptureStream>> {
        Ok(Box::new(FakeStream {
            frames: self.frames,
            released: self.released,
        }))
    }
}

#[cfg(test)]
struct FakeStream {
    frames: VecDeque<AppResult<Vec<u8>>>,
    released: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
impl CaptureStream for FakeStream {
    fn next(&mut self) -> AppResult<Vec<u8>> {
        self.frames.pop_front().unwrap_or_else(|| {
            Err(AppError::Acquisition {
                device: "/dev/fake0".into(),
                message: "timed out waiting for a frame".into(),
            })
        })
    }
}

#[cfg(test)]
impl Drop for FakeStream {
    fn drop(&mut self) {
        self.released
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

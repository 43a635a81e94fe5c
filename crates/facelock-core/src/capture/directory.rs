use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use image::GrayImage;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::faces::enrollment::list_enrollment_images;

use super::{FrameSource, FrameStream};

const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// Replays still images from a directory as if they were camera frames.
#[derive(Debug, Clone)]
pub struct ImageDirectorySource {
    dir: PathBuf,
    frame_interval: Duration,
    repeat: bool,
}

impl ImageDirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            frame_interval: DEFAULT_FRAME_INTERVAL,
            repeat: true,
        }
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Stop with an acquisition error after the last image instead of looping.
    pub fn play_once(mut self) -> Self {
        self.repeat = false;
        self
    }
}

impl FrameSource for ImageDirectorySource {
    fn acquire(&mut self) -> AppResult<Box<dyn FrameStream + '_>> {
        let name = self.dir.display().to_string();
        let images = list_enrollment_images(&self.dir).map_err(|err| AppError::Acquisition {
            device: name.clone(),
            message: err.to_string(),
        })?;
        if images.is_empty() {
            return Err(AppError::Acquisition {
                device: name,
                message: "directory contains no images".into(),
            });
        }
        debug!(dir = %name, frames = images.len(), "replaying still images");
        Ok(Box::new(DirectoryStream {
            source: self,
            images,
            position: 0,
            name,
        }))
    }
}

struct DirectoryStream<'a> {
    source: &'a ImageDirectorySource,
    images: Vec<PathBuf>,
    position: usize,
    name: String,
}

impl FrameStream for DirectoryStream<'_> {
    fn next_frame(&mut self) -> AppResult<Option<GrayImage>> {
        if self.position >= self.images.len() {
            if !self.source.repeat {
                return Err(AppError::Acquisition {
                    device: self.name.clone(),
                    message: "no more images to replay".into(),
                });
            }
            self.position = 0;
        }
        let path = &self.images[self.position];
        self.position += 1;

        if !self.source.frame_interval.is_zero() {
            thread::sleep(self.source.frame_interval);
        }
        match image::open(path) {
            Ok(image) => Ok(Some(image.to_luma8())),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable frame");
                Ok(None)
            }
        }
    }

    fn source_name(&self) -> &str {
        &self.name
    }
}

use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

pub const DEFAULT_CROP_SIZE: (u32, u32) = (64, 64);

/// Normalized pixel intensities of an equalized face crop, each in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(Vec<f32>);

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureExtractor {
    crop_size: (u32, u32),
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self {
            crop_size: DEFAULT_CROP_SIZE,
        }
    }
}

impl FeatureExtractor {
    pub fn new(crop_size: (u32, u32)) -> AppResult<Self> {
        if crop_size.0 == 0 || crop_size.1 == 0 {
            return Err(AppError::Precondition(format!(
                "canonical crop size must be non-zero, got {}x{}",
                crop_size.0, crop_size.1
            )));
        }
        Ok(Self { crop_size })
    }

    pub fn crop_size(&self) -> (u32, u32) {
        self.crop_size
    }

    /// Length of every vector this extractor produces.
    pub fn feature_len(&self) -> usize {
        self.crop_size.0 as usize * self.crop_size.1 as usize
    }

    /// Resize, equalize, flatten and scale a face crop.
    ///
    /// The crop must already contain only the face; a zero-area crop is
    /// rejected rather than coerced.
    pub fn extract(&self, face: &GrayImage) -> AppResult<FeatureVector> {
        if face.width() == 0 || face.height() == 0 {
            return Err(AppError::Precondition(format!(
                "face crop has zero area ({}x{})",
                face.width(),
                face.height()
            )));
        }

        let (width, height) = self.crop_size;
        let resized = if face.dimensions() == self.crop_size {
            face.clone()
        } else {
            imageops::resize(face, width, height, FilterType::Triangle)
        };
        let equalized = equalize_histogram(&resized);

        let values = equalized
            .as_raw()
            .iter()
            .map(|&pixel| f32::from(pixel) / 255.0)
            .collect();
        Ok(FeatureVector(values))
    }
}

/// Global histogram equalization over 256 bins.
///
/// A single-valued image is returned unchanged.
pub fn equalize_histogram(image: &GrayImage) -> GrayImage {
    let total = image.as_raw().len();
    if total == 0 {
        return image.clone();
    }

    let mut histogram = [0usize; 256];
    for &pixel in image.as_raw() {
        histogram[pixel as usize] += 1;
    }

    let first = histogram.iter().position(|&count| count > 0).unwrap_or(0);
    if histogram[first] == total {
        return image.clone();
    }

    let scale = 255.0 / (total - histogram[first]) as f64;
    let mut lut = [0u8; 256];
    let mut cumulative = 0usize;
    for level in (first + 1)..256 {
        cumulative += histogram[level];
        lut[level] = (cumulative as f64 * scale).round().clamp(0.0, 255.0) as u8;
    }

    let mut output = image.clone();
    for pixel in output.pixels_mut() {
        pixel.0[0] = lut[pixel.0[0] as usize];
    }
    output
}

use dlib_face_recognition::{FaceDetector, FaceDetectorTrait, ImageMatrix};
use image::{imageops, GrayImage, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::errors::AppResult;

pub const DEFAULT_MIN_FACE_SIZE: u32 = 50;

/// Face rectangle in frame coordinates, exclusive of `right`/`bottom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

impl BoundingBox {
    pub fn new(left: i64, top: i64, right: i64, bottom: i64) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> i64 {
        (self.right - self.left).max(0)
    }

    pub fn height(&self) -> i64 {
        (self.bottom - self.top).max(0)
    }

    pub fn area(&self) -> i64 {
        self.width() * self.height()
    }

    /// Intersection with a `width` x `height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> BoundingBox {
        let (width, height) = (i64::from(width), i64::from(height));
        BoundingBox {
            left: self.left.clamp(0, width),
            top: self.top.clamp(0, height),
            right: self.right.clamp(0, width),
            bottom: self.bottom.clamp(0, height),
        }
    }
}

/// Box with the largest area inside a `width` x `height` frame; the first
/// one wins a tie. Boxes entirely outside the frame are never chosen.
pub fn largest_face(faces: &[BoundingBox], width: u32, height: u32) -> Option<BoundingBox> {
    let mut largest: Option<(BoundingBox, i64)> = None;
    for face in faces {
        let visible = face.clamp_to(width, height).area();
        if visible > 0 && largest.map_or(true, |(_, area)| visible > area) {
            largest = Some((*face, visible));
        }
    }
    largest.map(|(face, _)| face)
}

/// Crops `face` out of `frame`, or `None` when it lies outside the frame.
pub fn crop_face(frame: &GrayImage, face: &BoundingBox) -> Option<GrayImage> {
    let clamped = face.clamp_to(frame.width(), frame.height());
    if clamped.area() == 0 {
        return None;
    }
    let crop = imageops::crop_imm(
        frame,
        clamped.left as u32,
        clamped.top as u32,
        clamped.width() as u32,
        clamped.height() as u32,
    )
    .to_image();
    Some(crop)
}

/// Finds zero or more faces in a grayscale frame.
pub trait FaceLocator {
    fn locate(&mut self, frame: &GrayImage) -> AppResult<Vec<BoundingBox>>;
}

impl<L: FaceLocator + ?Sized> FaceLocator for Box<L> {
    fn locate(&mut self, frame: &GrayImage) -> AppResult<Vec<BoundingBox>> {
        (**self).locate(frame)
    }
}

/// HOG detector from dlib.
pub struct DlibFaceLocator {
    detector: FaceDetector,
    min_face_size: u32,
}

impl DlibFaceLocator {
    pub fn new(min_face_size: u32) -> Self {
        Self {
            detector: FaceDetector::new(),
            min_face_size,
        }
    }
}

impl FaceLocator for DlibFaceLocator {
    fn locate(&mut self, frame: &GrayImage) -> AppResult<Vec<BoundingBox>> {
        let rgb = gray_to_rgb(frame);
        let matrix = ImageMatrix::from_image(&rgb);
        let locations = self.detector.face_locations(&matrix);

        let min = i64::from(self.min_face_size);
        let faces: Vec<BoundingBox> = locations
            .iter()
            .map(|rect| BoundingBox::new(rect.left, rect.top, rect.right, rect.bottom))
            .filter(|face| face.width() >= min && face.height() >= min)
            .collect();
        trace!(
            detected = locations.len(),
            kept = faces.len(),
            "face locator finished"
        );
        Ok(faces)
    }
}

pub fn gray_to_rgb(image: &GrayImage) -> RgbImage {
    let mut rgb = RgbImage::new(image.width(), image.height());
    for (x, y, pixel) in rgb.enumerate_pixels_mut() {
        let v = image.get_pixel(x, y)[0];
        *pixel = Rgb([v, v, v]);
    }
    rgb
}

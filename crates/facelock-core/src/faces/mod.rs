pub mod comparer;
pub mod enrollment;
pub mod extractor;
pub mod liveness;
pub mod locator;
pub mod store;

pub use comparer::{best_match, first_match, score, TemplateMatch};

pub use enrollment::{
    enroll_from_directory, enroll_from_image, has_supported_extension, list_enrollment_images,
    BatchEnrollmentOutcome, CaptureReport, EnrolledImage, EnrollmentConfig, EnrollmentState,
    GuidedEnrollment, SkippedImage, POSE_STEPS, SUPPORTED_IMAGE_EXTENSIONS,
};

pub use extractor::{equalize_histogram, FeatureExtractor, FeatureVector, DEFAULT_CROP_SIZE};

pub use liveness::{
    Clock, LivenessConfig, LivenessEngine, LivenessOutcome, MatchProgress, SystemClock,
};

pub use locator::{
    crop_face, gray_to_rgb, largest_face, BoundingBox, DlibFaceLocator, FaceLocator,
    DEFAULT_MIN_FACE_SIZE,
};

pub use store::{FileTemplateStore, StoreError, Template, TemplateSet, TemplateStore};

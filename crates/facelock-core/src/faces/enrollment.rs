use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use image::GrayImage;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::faces::extractor::{FeatureExtractor, DEFAULT_CROP_SIZE};
use crate::faces::locator::{crop_face, largest_face, BoundingBox, FaceLocator};
use crate::faces::store::{Template, TemplateSet, TemplateStore};

/// Pose instructions, in the order they are captured.
pub const POSE_STEPS: [&str; 5] = [
    "1. Neutral face, looking straight",
    "2. Smile",
    "3. Turn head left",
    "4. Turn head right",
    "5. Remove/Put on glasses if you have",
];

pub const SUPPORTED_IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "tiff"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrollmentConfig {
    pub canonical_crop_size: (u32, u32),
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            canonical_crop_size: DEFAULT_CROP_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EnrollmentState {
    AwaitingCapture { step: usize },
    Captured { step: usize },
    Finalizing,
    Complete { templates: usize },
    Failed { reason: String },
    Aborted,
}

impl EnrollmentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EnrollmentState::Complete { .. } | EnrollmentState::Failed { .. } | EnrollmentState::Aborted
        )
    }
}

impl fmt::Display for EnrollmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnrollmentState::AwaitingCapture { step } => {
                write!(f, "awaiting capture for step {}", step + 1)
            }
            EnrollmentState::Captured { step } => write!(f, "holding capture for step {}", step + 1),
            EnrollmentState::Finalizing => f.write_str("finalizing"),
            EnrollmentState::Complete { templates } => {
                write!(f, "complete with {templates} template(s)")
            }
            EnrollmentState::Failed { reason } => write!(f, "failed: {reason}"),
            EnrollmentState::Aborted => f.write_str("aborted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureReport {
    pub step: usize,
    pub faces_found: usize,
    pub face: BoundingBox,
}

/// Guided capture of one template per pose step.
///
/// Nothing is written until the last step is passed; an aborted or failed
/// session leaves the stored template file as it was.
pub struct GuidedEnrollment<'s, L, S: ?Sized> {
    extractor: FeatureExtractor,
    locator: L,
    store: &'s S,
    state: EnrollmentState,
    pending: Option<Template>,
    accepted: Vec<Template>,
}

impl<'s, L, S> GuidedEnrollment<'s, L, S>
where
    L: FaceLocator,
    S: TemplateStore + ?Sized,
{
    pub fn new(config: EnrollmentConfig, locator: L, store: &'s S) -> AppResult<Self> {
        Ok(Self {
            extractor: FeatureExtractor::new(config.canonical_crop_size)?,
            locator,
            store,
            state: EnrollmentState::AwaitingCapture { step: 0 },
            pending: None,
            accepted: Vec::with_capacity(POSE_STEPS.len()),
        })
    }

    pub fn state(&self) -> &EnrollmentState {
        &self.state
    }

    pub fn step_count(&self) -> usize {
        POSE_STEPS.len()
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.len()
    }

    /// Instruction for the step in progress, if any.
    pub fn instruction(&self) -> Option<&'static str> {
        match self.state {
            EnrollmentState::AwaitingCapture { step } | EnrollmentState::Captured { step } => {
                POSE_STEPS.get(step).copied()
            }
            _ => None,
        }
    }

    /// Locates the largest face in `frame` and holds its template for review.
    pub fn capture(&mut self, frame: &GrayImage) -> AppResult<CaptureReport> {
        let step = match self.state {
            EnrollmentState::AwaitingCapture { step } => step,
            _ => return Err(self.wrong_state("capture")),
        };
        let instruction = POSE_STEPS[step];

        let faces = self.locator.locate(frame)?;
        let face = largest_face(&faces, frame.width(), frame.height()).ok_or_else(|| {
            AppError::NoFaceDetected {
                step: step + 1,
                instruction: instruction.to_string(),
            }
        })?;
        let crop = crop_face(frame, &face).ok_or_else(|| AppError::NoFaceDetected {
            step: step + 1,
            instruction: instruction.to_string(),
        })?;
        let features = self.extractor.extract(&crop)?;

        debug!(step = step + 1, faces = faces.len(), ?face, "captured enrollment frame");
        self.pending = Some(Template::new(instruction, features));
        self.state = EnrollmentState::Captured { step };
        Ok(CaptureReport {
            step,
            faces_found: faces.len(),
            face,
        })
    }

    /// Discards the held capture and waits for another one on the same step.
    pub fn retake(&mut self) -> AppResult<()> {
        let step = match self.state {
            EnrollmentState::Captured { step } => step,
            _ => return Err(self.wrong_state("retake")),
        };
        self.pending = None;
        self.state = EnrollmentState::AwaitingCapture { step };
        Ok(())
    }

    /// Accepts the held capture and moves on, saving after the last step.
    pub fn confirm(&mut self) -> AppResult<EnrollmentState> {
        if !matches!(self.state, EnrollmentState::Captured { .. }) {
            return Err(self.wrong_state("confirm"));
        }
        let Some(template) = self.pending.take() else {
            return Err(self.wrong_state("confirm"));
        };
        info!(source = %template.source, "accepted enrollment capture");
        self.accepted.push(template);
        self.advance()
    }

    /// Leaves the current step without a template.
    pub fn abandon_step(&mut self) -> AppResult<EnrollmentState> {
        let step = match self.state {
            EnrollmentState::AwaitingCapture { step } => step,
            _ => return Err(self.wrong_state("skip a step")),
        };
        warn!(step = step + 1, "enrollment step left without a template");
        self.advance()
    }

    pub fn abort(&mut self) {
        if !self.state.is_terminal() {
            self.pending = None;
            self.accepted.clear();
            self.state = EnrollmentState::Aborted;
        }
    }

    fn advance(&mut self) -> AppResult<EnrollmentState> {
        let step = match self.state {
            EnrollmentState::AwaitingCapture { step } | EnrollmentState::Captured { step } => step,
            _ => return Err(self.wrong_state("advance")),
        };
        if step + 1 < POSE_STEPS.len() {
            self.state = EnrollmentState::AwaitingCapture { step: step + 1 };
            return Ok(self.state.clone());
        }

        self.state = EnrollmentState::Finalizing;
        if self.accepted.is_empty() {
            self.state = EnrollmentState::Failed {
                reason: "no step produced a template".into(),
            };
            return Ok(self.state.clone());
        }

        let set = TemplateSet::new(std::mem::take(&mut self.accepted))?;
        if let Err(err) = self.store.save(&set) {
            self.state = EnrollmentState::Failed {
                reason: err.to_string(),
            };
            return Err(err.into());
        }
        info!(
            templates = set.len(),
            path = %self.store.location().display(),
            "enrollment complete"
        );
        self.state = EnrollmentState::Complete {
            templates: set.len(),
        };
        Ok(self.state.clone())
    }

    fn wrong_state(&self, action: &'static str) -> AppError {
        AppError::EnrollmentState {
            action,
            state: self.state.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrolledImage {
    pub file: String,
    pub template_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedImage {
    pub file: String,
    pub reason: String,
}

#[derive(Debug)]
pub struct BatchEnrollmentOutcome {
    pub store_path: PathBuf,
    pub enrolled: Vec<EnrolledImage>,
    pub skipped: Vec<SkippedImage>,
    pub logs: Vec<String>,
}

/// Enrolls every supported image in `dir` as one template set.
///
/// Images that fail to decode or contain no face are skipped.
pub fn enroll_from_directory<L, S>(
    dir: &Path,
    config: EnrollmentConfig,
    locator: &mut L,
    store: &S,
) -> AppResult<BatchEnrollmentOutcome>
where
    L: FaceLocator + ?Sized,
    S: TemplateStore + ?Sized,
{
    let extractor = FeatureExtractor::new(config.canonical_crop_size)?;
    let images = list_enrollment_images(dir)?;
    let mut logs = vec![format!(
        "Found {} candidate image(s) in {}",
        images.len(),
        dir.display()
    )];

    let mut templates = Vec::new();
    let mut enrolled = Vec::new();
    let mut skipped = Vec::new();
    for path in &images {
        let file = display_name(path);
        let outcome = load_grayscale(path)
            .and_then(|image| template_from_image(&image, &file, &extractor, locator));
        match outcome {
            Ok(Some(template)) => {
                logs.push(format!("Enrolled {file}"));
                enrolled.push(EnrolledImage {
                    file,
                    template_id: template.id.clone(),
                });
                templates.push(template);
            }
            Ok(None) => {
                warn!(%file, "no face found; skipping");
                logs.push(format!("No face found in {file}; skipped"));
                skipped.push(SkippedImage {
                    file,
                    reason: "no face detected".into(),
                });
            }
            Err(err) => {
                warn!(%file, error = %err, "failed to process image; skipping");
                logs.push(format!("Could not process {file}: {err}"));
                skipped.push(SkippedImage {
                    file,
                    reason: err.to_string(),
                });
            }
        }
    }

    if templates.is_empty() {
        return Err(AppError::NoTemplates(format!(
            "none of the {} image(s) in {} contained a usable face",
            images.len(),
            dir.display()
        )));
    }

    let set = TemplateSet::new(templates)?;
    store.save(&set)?;
    logs.push(format!(
        "Saved {} template(s) to {}",
        set.len(),
        store.location().display()
    ));

    Ok(BatchEnrollmentOutcome {
        store_path: store.location().to_path_buf(),
        enrolled,
        skipped,
        logs,
    })
}

/// Enrolls a single still image, replacing any stored templates.
pub fn enroll_from_image<L, S>(
    path: &Path,
    config: EnrollmentConfig,
    locator: &mut L,
    store: &S,
) -> AppResult<BatchEnrollmentOutcome>
where
    L: FaceLocator + ?Sized,
    S: TemplateStore + ?Sized,
{
    if !path.is_file() {
        return Err(AppError::MissingInput {
            path: path.to_path_buf(),
        });
    }
    if !has_supported_extension(path) {
        return Err(AppError::UnsupportedImage {
            path: path.to_path_buf(),
            expected: SUPPORTED_IMAGE_EXTENSIONS.join(", "),
        });
    }

    let extractor = FeatureExtractor::new(config.canonical_crop_size)?;
    let file = display_name(path);
    let image = load_grayscale(path)?;
    let template = template_from_image(&image, &file, &extractor, locator)?
        .ok_or_else(|| AppError::NoTemplates(format!("no face found in {file}")))?;

    let enrolled = vec![EnrolledImage {
        file: file.clone(),
        template_id: template.id.clone(),
    }];
    let set = TemplateSet::new(vec![template])?;
    store.save(&set)?;

    Ok(BatchEnrollmentOutcome {
        store_path: store.location().to_path_buf(),
        enrolled,
        skipped: Vec::new(),
        logs: vec![
            format!("Enrolled {file}"),
            format!("Saved 1 template to {}", store.location().display()),
        ],
    })
}

/// Supported image files directly inside `dir`, sorted by name.
pub fn list_enrollment_images(dir: &Path) -> AppResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(AppError::MissingInput {
            path: dir.to_path_buf(),
        });
    }
    let mut images = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && has_supported_extension(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

pub fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            SUPPORTED_IMAGE_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
        .unwrap_or(false)
}

fn template_from_image<L: FaceLocator + ?Sized>(
    image: &GrayImage,
    source: &str,
    extractor: &FeatureExtractor,
    locator: &mut L,
) -> AppResult<Option<Template>> {
    let faces = locator.locate(image)?;
    let largest = largest_face(&faces, image.width(), image.height());
    let Some(crop) = largest.and_then(|face| crop_face(image, &face)) else {
        return Ok(None);
    };
    let features = extractor.extract(&crop)?;
    Ok(Some(Template::new(source, features)))
}

fn load_grayscale(path: &Path) -> AppResult<GrayImage> {
    let image = image::open(path).map_err(|source| AppError::ImageDecode {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(image.to_luma8())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

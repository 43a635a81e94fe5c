use std::io;

use facelock_core::capture::V4lFrameSource;
use facelock_core::errors::AppResult;
use facelock_core::faces::{
    enroll_from_directory, enroll_from_image, BatchEnrollmentOutcome, DlibFaceLocator,
};
use tracing::info;

use crate::cli::EnrollArgs;
use crate::config::{
    capture_config, enrollment_config, load_settings, open_store, resolve_image_argument,
};
use crate::guided::{run_guided_session, GuidedOutcome};

#[derive(Debug)]
pub enum EnrollOutcome {
    Guided(GuidedOutcome),
    Batch(BatchEnrollmentOutcome),
}

pub fn run_enroll(args: &EnrollArgs) -> AppResult<EnrollOutcome> {
    let settings = load_settings()?;
    let store = open_store(&settings, args.templates.as_deref())?;
    let config = enrollment_config(&settings);
    let mut locator = DlibFaceLocator::new(settings.min_face_size);

    if let Some(dir) = &args.from_dir {
        info!(dir = %dir.display(), "enrolling from image directory");
        let outcome = enroll_from_directory(dir, config, &mut locator, &store)?;
        return Ok(EnrollOutcome::Batch(outcome));
    }
    if let Some(value) = &args.image {
        let path = resolve_image_argument(value, &settings.enrollment_dir)?;
        info!(path = %path.display(), "enrolling from single image");
        let outcome = enroll_from_image(&path, config, &mut locator, &store)?;
        return Ok(EnrollOutcome::Batch(outcome));
    }

    let mut camera = V4lFrameSource::new(capture_config(&settings, args.device.as_deref()));
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut prompts = io::stderr();
    let outcome = run_guided_session(&mut input, &mut prompts, &mut camera, locator, &store, config)?;
    Ok(EnrollOutcome::Guided(outcome))
}

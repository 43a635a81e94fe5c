use std::path::PathBuf;

use facelock_core::capture::{FrameSource, ImageDirectorySource, V4lFrameSource};
use facelock_core::errors::AppResult;
use facelock_core::faces::{DlibFaceLocator, TemplateStore};
use facelock_core::unlock::{spawn_unlock_worker, UnlockComponents, UnlockEvent, UnlockResult};
use tracing::info;

use crate::cli::UnlockArgs;
use crate::config::{capture_config, load_settings, open_store, unlock_config};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockSummary {
    pub result: UnlockResult,
    pub template_path: PathBuf,
    pub templates: usize,
}

/// Loads the enrolled templates and watches the camera until the worker
/// finishes, handing every event to `on_event` as it arrives.
pub fn run_unlock(
    args: &UnlockArgs,
    on_event: &mut dyn FnMut(&UnlockEvent) -> AppResult<()>,
) -> AppResult<UnlockSummary> {
    let settings = load_settings()?;
    let store = open_store(&settings, args.templates.as_deref())?;
    let templates = store.load()?;
    info!(
        templates = templates.len(),
        path = %store.location().display(),
        "loaded enrolled templates"
    );
    let template_count = templates.len();

    let config = unlock_config(&settings, args.max_attempts);
    let capture = capture_config(&settings, args.device.as_deref());
    let frames_dir = args.frames_dir.clone();
    let min_face_size = settings.min_face_size;
    let mut worker = spawn_unlock_worker(config, templates, move || {
        let source: Box<dyn FrameSource> = match frames_dir {
            Some(dir) => Box::new(ImageDirectorySource::new(dir)),
            None => Box::new(V4lFrameSource::new(capture)),
        };
        Ok(UnlockComponents {
            source,
            locator: Box::new(DlibFaceLocator::new(min_face_size)),
        })
    })?;

    let events = worker.events().clone();
    let mut render_error = None;
    for event in events.iter() {
        if let Err(err) = on_event(&event) {
            render_error = Some(err);
            worker.stop();
            break;
        }
    }
    drop(events);

    let result = worker.join()?;
    if let Some(err) = render_error {
        return Err(err);
    }
    Ok(UnlockSummary {
        result,
        template_path: store.location().to_path_buf(),
        templates: template_count,
    })
}

//! Terminal front end for guided enrollment.
//!
//! Prompts go to `output` and answers are read line by line from `input`, so
//! the whole session can be driven from an in-memory script.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use facelock_core::capture::{FrameSource, FrameStream};
use facelock_core::errors::{AppError, AppResult};
use facelock_core::faces::{
    EnrollmentConfig, EnrollmentState, FaceLocator, GuidedEnrollment, TemplateStore,
};
use tracing::debug;

/// Frames already queued in the driver when Enter is pressed.
const STALE_FRAMES: usize = 4;
const FRAME_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuidedOutcome {
    pub store_path: PathBuf,
    pub templates: usize,
    /// 1-based pose steps that were left without a template.
    pub skipped_steps: Vec<usize>,
}

enum Answer {
    Capture,
    Skip,
    Keep,
    Retake,
    Quit,
    Unknown,
}

fn read_answer<R: BufRead>(input: &mut R) -> AppResult<Answer> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(Answer::Quit);
    }
    Ok(match line.trim().to_ascii_lowercase().as_str() {
        "" => Answer::Capture,
        "c" => Answer::Capture,
        "s" => Answer::Skip,
        "y" | "yes" => Answer::Keep,
        "n" | "no" | "r" => Answer::Retake,
        "q" | "quit" => Answer::Quit,
        _ => Answer::Unknown,
    })
}

/// Runs the five-pose session against `source` until it completes or the
/// user quits. The camera is held for the whole session and released on
/// every return path.
pub fn run_guided_session<R, W, S, L, T>(
    input: &mut R,
    output: &mut W,
    source: &mut S,
    locator: L,
    store: &T,
    config: EnrollmentConfig,
) -> AppResult<GuidedOutcome>
where
    R: BufRead,
    W: Write,
    S: FrameSource + ?Sized,
    L: FaceLocator,
    T: TemplateStore + ?Sized,
{
    let mut session = GuidedEnrollment::new(config, locator, store)?;
    let mut stream = source.acquire()?;
    writeln!(
        output,
        "Enrolling {} poses using {}.",
        session.step_count(),
        stream.source_name()
    )?;

    let mut skipped_steps = Vec::new();
    let mut capture_rejected = false;
    loop {
        match session.state().clone() {
            EnrollmentState::AwaitingCapture { step } => {
                let instruction = session.instruction().unwrap_or_default();
                if capture_rejected {
                    write!(
                        output,
                        "{instruction}\n  Enter = capture again, s = skip this pose, q = quit: "
                    )?;
                } else {
                    write!(output, "{instruction}\n  Press Enter to capture (q = quit): ")?;
                }
                output.flush()?;

                match read_answer(input)? {
                    Answer::Quit => {
                        session.abort();
                        return Err(AppError::Aborted);
                    }
                    Answer::Skip if capture_rejected => {
                        capture_rejected = false;
                        skipped_steps.push(step + 1);
                        writeln!(output, "Skipping pose {}.", step + 1)?;
                        session.abandon_step()?;
                    }
                    Answer::Capture => {
                        let Some(frame) = fresh_frame(stream.as_mut())? else {
                            writeln!(output, "No frame from {}; try again.", stream.source_name())?;
                            continue;
                        };
                        match session.capture(&frame) {
                            Ok(report) => {
                                capture_rejected = false;
                                writeln!(
                                    output,
                                    "Face captured ({}x{} px, {} face(s) in view).",
                                    report.face.width(),
                                    report.face.height(),
                                    report.faces_found
                                )?;
                            }
                            Err(AppError::NoFaceDetected { .. }) => {
                                capture_rejected = true;
                                writeln!(output, "No face detected. Adjust your position.")?;
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    _ => writeln!(output, "Unrecognized answer.")?,
                }
            }
            EnrollmentState::Captured { .. } => {
                write!(output, "  Keep this capture? [Y/n/q]: ")?;
                output.flush()?;
                match read_answer(input)? {
                    Answer::Quit => {
                        session.abort();
                        return Err(AppError::Aborted);
                    }
                    Answer::Retake => session.retake()?,
                    Answer::Capture | Answer::Keep => {
                        session.confirm()?;
                        if matches!(session.state(), EnrollmentState::AwaitingCapture { .. }) {
                            writeln!(
                                output,
                                "Pose kept ({} of {} captured).",
                                session.accepted_count(),
                                session.step_count()
                            )?;
                        }
                    }
                    _ => writeln!(output, "Unrecognized answer.")?,
                }
            }
            EnrollmentState::Complete { templates } => {
                writeln!(
                    output,
                    "Saved {templates} template(s) to {}.",
                    store.location().display()
                )?;
                return Ok(GuidedOutcome {
                    store_path: store.location().to_path_buf(),
                    templates,
                    skipped_steps,
                });
            }
            EnrollmentState::Failed { reason } => return Err(AppError::NoTemplates(reason)),
            EnrollmentState::Aborted => return Err(AppError::Aborted),
            EnrollmentState::Finalizing => {
                return Err(AppError::Precondition(
                    "enrollment stopped while finalizing".into(),
                ))
            }
        }
    }
}

/// Drops frames buffered before the prompt, then returns the first usable one.
fn fresh_frame(stream: &mut dyn FrameStream) -> AppResult<Option<image::GrayImage>> {
    for _ in 0..STALE_FRAMES {
        stream.next_frame()?;
    }
    for attempt in 0..FRAME_ATTEMPTS {
        if let Some(frame) = stream.next_frame()? {
            return Ok(Some(frame));
        }
        debug!(attempt, "camera returned no usable frame");
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use facelock_core::faces::{BoundingBox, StoreError, TemplateSet, POSE_STEPS};
    use image::{GrayImage, Luma};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct StillCamera {
        released: Arc<AtomicUsize>,
    }

    struct StillStream {
        released: Arc<AtomicUsize>,
    }

    impl FrameSource for StillCamera {
        fn acquire(&mut self) -> AppResult<Box<dyn FrameStream + '_>> {
            Ok(Box::new(StillStream {
                released: Arc::clone(&self.released),
            }))
        }
    }

    impl FrameStream for StillStream {
        fn next_frame(&mut self) -> AppResult<Option<GrayImage>> {
            Ok(Some(GrayImage::from_fn(96, 96, |x, y| {
                Luma([((x * 3 + y * 5) % 256) as u8])
            })))
        }

        fn source_name(&self) -> &str {
            "still"
        }
    }

    impl Drop for StillStream {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedLocator {
        script: VecDeque<bool>,
    }

    impl FaceLocator for ScriptedLocator {
        fn locate(&mut self, _frame: &GrayImage) -> AppResult<Vec<BoundingBox>> {
            Ok(if self.script.pop_front().unwrap_or(true) {
                vec![BoundingBox::new(10, 10, 70, 70)]
            } else {
                Vec::new()
            })
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        saved: RefCell<Vec<TemplateSet>>,
    }

    impl TemplateStore for MemoryStore {
        fn load(&self) -> Result<TemplateSet, StoreError> {
            self.saved
                .borrow()
                .last()
                .cloned()
                .ok_or(StoreError::NotFound {
                    path: PathBuf::from("memory"),
                })
        }

        fn save(&self, templates: &TemplateSet) -> Result<(), StoreError> {
            self.saved.borrow_mut().push(templates.clone());
            Ok(())
        }

        fn location(&self) -> &Path {
            Path::new("memory")
        }
    }

    fn run(script: &str, faces: Vec<bool>) -> (AppResult<GuidedOutcome>, MemoryStore, usize, String) {
        let released = Arc::new(AtomicUsize::new(0));
        let mut camera = StillCamera {
            released: Arc::clone(&released),
        };
        let store = MemoryStore::default();
        let mut input = Cursor::new(script.as_bytes().to_vec());
        let mut output = Vec::new();
        let result = run_guided_session(
            &mut input,
            &mut output,
            &mut camera,
            ScriptedLocator {
                script: faces.into(),
            },
            &store,
            EnrollmentConfig::default(),
        );
        let transcript = String::from_utf8(output).unwrap();
        (result, store, released.load(Ordering::SeqCst), transcript)
    }

    #[test]
    fn five_confirmed_poses_are_saved() {
        let (result, store, released, transcript) = run(&"\ny\n".repeat(5), vec![]);
        let outcome = result.unwrap();
        assert_eq!(outcome.templates, POSE_STEPS.len());
        assert!(outcome.skipped_steps.is_empty());
        assert_eq!(store.saved.borrow().len(), 1);
        assert_eq!(released, 1);
        for step in POSE_STEPS {
            assert!(transcript.contains(step));
        }
    }

    #[test]
    fn retake_replaces_the_held_capture() {
        let script = format!("\nn\n{}", "\ny\n".repeat(5));
        let (result, store, _, _) = run(&script, vec![]);
        assert_eq!(result.unwrap().templates, 5);
        assert_eq!(store.saved.borrow()[0].len(), 5);
    }

    #[test]
    fn skip_is_offered_only_after_a_rejected_capture() {
        // "s" before any capture is ignored; after a miss it skips pose 1.
        let script = format!("s\n\ns\n{}", "\ny\n".repeat(4));
        let (result, store, _, transcript) = run(&script, vec![false]);
        let outcome = result.unwrap();
        assert_eq!(outcome.skipped_steps, vec![1]);
        assert_eq!(outcome.templates, 4);
        assert_eq!(store.saved.borrow()[0].len(), 4);
        assert!(transcript.contains("No face detected"));
        assert!(transcript.contains("Unrecognized answer"));
        assert!(transcript.contains("Pose kept (1 of 5 captured)."));
        assert!(transcript.contains("Pose kept (3 of 5 captured)."));
        assert!(!transcript.contains("Pose kept (4 of 5 captured)."));
    }

    #[test]
    fn quitting_saves_nothing_and_releases_the_camera() {
        let (result, store, released, _) = run("\ny\n\nq\n", vec![]);
        assert!(matches!(result, Err(AppError::Aborted)));
        assert!(store.saved.borrow().is_empty());
        assert_eq!(released, 1);
    }

    #[test]
    fn end_of_input_aborts() {
        let (result, store, released, _) = run("", vec![]);
        assert!(matches!(result, Err(AppError::Aborted)));
        assert!(store.saved.borrow().is_empty());
        assert_eq!(released, 1);
    }

    #[test]
    fn skipping_every_pose_fails_without_saving() {
        let (result, store, _, _) = run(&"\ns\n".repeat(5), vec![false; 5]);
        assert!(matches!(result, Err(AppError::NoTemplates(_))));
        assert!(store.saved.borrow().is_empty());
    }
}

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use facelock_cli::cli::{OutputMode, UnlockArgs};
use facelock_cli::commands::{CommandHandler, UnlockHandler};
use facelock_cli::errors::{AppError, AppResult};
use facelock_cli::unlock::UnlockSummary;
use facelock_core::faces::StoreError;
use facelock_core::unlock::{UnlockEvent, UnlockResult, UnlockStage};

fn summary(result: UnlockResult) -> UnlockSummary {
    UnlockSummary {
        result,
        template_path: PathBuf::from("/tmp/face_templates.dat"),
        templates: 5,
    }
}

fn scripted_run(
    result: UnlockResult,
) -> impl Fn(&UnlockArgs, &mut dyn FnMut(&UnlockEvent) -> AppResult<()>) -> AppResult<UnlockSummary>
       + Send
       + Sync
       + 'static {
    move |_args: &UnlockArgs, on_event: &mut dyn FnMut(&UnlockEvent) -> AppResult<()>| {
        on_event(&UnlockEvent::Stage(UnlockStage::Locked))?;
        on_event(&UnlockEvent::Stage(UnlockStage::Scanning))?;
        Ok(summary(result))
    }
}

#[test]
fn events_are_rendered_before_the_summary() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let handler = UnlockHandler::with_dependencies(
        UnlockArgs::default(),
        scripted_run(UnlockResult::Unlocked { attempts: 1 }),
        {
            let log = Arc::clone(&log);
            move |event, _mode| {
                if let UnlockEvent::Stage(stage) = event {
                    log.lock().unwrap().push(stage.status_text().to_string());
                }
                Ok(())
            }
        },
        {
            let log = Arc::clone(&log);
            move |summary, _mode| {
                log.lock().unwrap().push(format!("{:?}", summary.result));
                Ok(())
            }
        },
    );

    let exit = handler.execute(OutputMode::Human, false).unwrap();
    assert_eq!(exit, ExitCode::SUCCESS);
    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[
            "Locked".to_string(),
            "Looking for your face...".to_string(),
            "Unlocked { attempts: 1 }".to_string(),
        ]
    );
}

#[test]
fn exhausted_attempts_exit_nonzero() {
    let handler = UnlockHandler::with_dependencies(
        UnlockArgs::default(),
        scripted_run(UnlockResult::Exhausted { attempts: 3 }),
        |_event, _mode| Ok(()),
        |_summary, _mode| Ok(()),
    );
    assert_eq!(
        handler.execute(OutputMode::Json, false).unwrap(),
        ExitCode::from(1)
    );
}

#[test]
fn render_failure_stops_the_run() {
    let handler = UnlockHandler::with_dependencies(
        UnlockArgs::default(),
        scripted_run(UnlockResult::Unlocked { attempts: 1 }),
        |_event, _mode| {
            Err(AppError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stdout closed",
            )))
        },
        |_summary, _mode| Ok(()),
    );
    let err = handler.execute(OutputMode::Json, false).unwrap_err();
    assert!(matches!(err, AppError::Io(_)));
}

#[test]
fn missing_templates_advise_enrollment() {
    let handler = UnlockHandler::with_dependencies(
        UnlockArgs::default(),
        |_args: &UnlockArgs, _on_event: &mut dyn FnMut(&UnlockEvent) -> AppResult<()>| {
            Err(AppError::Store(StoreError::NotFound {
                path: PathBuf::from("/tmp/face_templates.dat"),
            }))
        },
        |_event, _mode| Ok(()),
        |_summary, _mode| Ok(()),
    );
    let err = handler.execute(OutputMode::Human, false).unwrap_err();
    assert_eq!(err.exit_code(), ExitCode::from(6));
    assert!(err.human_message().contains("facelock enroll"));
}

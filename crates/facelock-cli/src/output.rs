use std::error::Error;
use std::io::{self, Write};

use facelock_core::faces::LivenessOutcome;
use facelock_core::unlock::{UnlockEvent, UnlockResult};
use serde_json::{json, Value};

use crate::cli::OutputMode;
use crate::enroll::EnrollOutcome;
use crate::errors::{AppError, AppResult};
use crate::images::ImageListing;
use crate::unlock::UnlockSummary;

fn write_json_line(payload: &Value) -> AppResult<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    let payload = serde_json::to_string(payload)?;
    handle.write_all(payload.as_bytes())?;
    handle.write_all(b"\n")?;
    Ok(())
}

pub fn render_unlock_event(event: &UnlockEvent, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => match event {
            UnlockEvent::Stage(stage) => println!("{}", stage.status_text()),
            UnlockEvent::Match {
                count,
                required,
                template_index,
                similarity,
                ..
            } => println!(
                "Match {count}/{required} (template #{}, similarity {similarity:.3})",
                template_index + 1
            ),
            UnlockEvent::AttemptRejected { attempt, outcome } => {
                println!("Attempt {attempt} not recognized: {}", rejection_summary(outcome))
            }
            UnlockEvent::CameraError { attempt, message } => {
                println!("Camera unavailable on attempt {attempt}: {message}")
            }
            UnlockEvent::Unlocked { attempt, .. } => println!("Unlocked on attempt {attempt}"),
        },
        OutputMode::Json => write_json_line(&unlock_event_payload(event))?,
    }
    Ok(())
}

fn rejection_summary(outcome: &LivenessOutcome) -> String {
    let mut summary = format!(
        "{}/{} matches in {:.1}s",
        outcome.matches,
        outcome.required,
        outcome.elapsed.as_secs_f64()
    );
    match outcome.closest_miss {
        Some(similarity) => summary.push_str(&format!(", closest similarity {similarity:.3}")),
        None if outcome.frames_with_face == 0 => summary.push_str(", no face seen"),
        None => {}
    }
    summary
}

fn outcome_payload(outcome: &LivenessOutcome) -> Value {
    json!({
        "accepted": outcome.accepted,
        "matches": outcome.matches,
        "required": outcome.required,
        "frames_delivered": outcome.frames_delivered,
        "frames_processed": outcome.frames_processed,
        "frames_with_face": outcome.frames_with_face,
        "faces_detected": outcome.faces_detected,
        "matched_templates": outcome.matched_templates,
        "closest_miss": outcome.closest_miss,
        "elapsed_secs": outcome.elapsed.as_secs_f64(),
    })
}

fn unlock_event_payload(event: &UnlockEvent) -> Value {
    match event {
        UnlockEvent::Stage(stage) => json!({
            "event": "stage",
            "stage": stage,
            "status": stage.status_text(),
        }),
        UnlockEvent::Match {
            attempt,
            count,
            required,
            template_index,
            similarity,
        } => json!({
            "event": "match",
            "attempt": attempt,
            "count": count,
            "required": required,
            "template_index": template_index,
            "similarity": similarity,
        }),
        UnlockEvent::AttemptRejected { attempt, outcome } => json!({
            "event": "attempt_rejected",
            "attempt": attempt,
            "outcome": outcome_payload(outcome),
        }),
        UnlockEvent::CameraError { attempt, message } => json!({
            "event": "camera_error",
            "attempt": attempt,
            "message": message,
        }),
        UnlockEvent::Unlocked { attempt, outcome } => json!({
            "event": "unlocked",
            "attempt": attempt,
            "outcome": outcome_payload(outcome),
        }),
    }
}

pub fn render_unlock(summary: &UnlockSummary, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => match summary.result {
            UnlockResult::Unlocked { attempts } => {
                println!("Face recognized after {attempts} attempt(s)")
            }
            UnlockResult::Exhausted { attempts } => {
                println!("Face not recognized after {attempts} attempt(s)")
            }
            UnlockResult::Cancelled { attempts } => {
                println!("Unlock cancelled after {attempts} attempt(s)")
            }
        },
        OutputMode::Json => write_json_line(&unlock_summary_payload(summary))?,
    }
    Ok(())
}

fn unlock_summary_payload(summary: &UnlockSummary) -> Value {
    let (status, attempts) = match summary.result {
        UnlockResult::Unlocked { attempts } => ("unlocked", attempts),
        UnlockResult::Exhausted { attempts } => ("exhausted", attempts),
        UnlockResult::Cancelled { attempts } => ("cancelled", attempts),
    };
    json!({
        "status": status,
        "attempts": attempts,
        "template_path": summary.template_path.display().to_string(),
        "templates": summary.templates,
    })
}

pub fn render_enroll(outcome: &EnrollOutcome, mode: OutputMode, verbose: bool) -> AppResult<()> {
    match mode {
        OutputMode::Human => match outcome {
            EnrollOutcome::Guided(guided) => {
                if !guided.skipped_steps.is_empty() {
                    tracing::warn!(
                        "Pose step(s) {:?} were skipped without a template",
                        guided.skipped_steps
                    );
                }
                println!(
                    "Enrollment successful: {} template(s) saved to {}",
                    guided.templates,
                    guided.store_path.display()
                );
            }
            EnrollOutcome::Batch(batch) => {
                if verbose {
                    for line in &batch.logs {
                        tracing::info!("{line}");
                    }
                }
                for skipped in &batch.skipped {
                    println!("Skipped {}: {}", skipped.file, skipped.reason);
                }
                println!(
                    "Enrollment successful: {} template(s) saved to {}",
                    batch.enrolled.len(),
                    batch.store_path.display()
                );
            }
        },
        OutputMode::Json => write_json_line(&enroll_payload(outcome))?,
    }
    Ok(())
}

fn enroll_payload(outcome: &EnrollOutcome) -> Value {
    match outcome {
        EnrollOutcome::Guided(guided) => json!({
            "mode": "guided",
            "store_path": guided.store_path.display().to_string(),
            "templates": guided.templates,
            "skipped_steps": guided.skipped_steps,
        }),
        EnrollOutcome::Batch(batch) => json!({
            "mode": "batch",
            "store_path": batch.store_path.display().to_string(),
            "templates": batch.enrolled.len(),
            "enrolled": batch.enrolled,
            "skipped": batch.skipped,
        }),
    }
}

pub fn render_images(listing: &ImageListing, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            if listing.images.is_empty() {
                println!("No enrollment images in {}", listing.dir.display());
            }
            for (index, image) in listing.images.iter().enumerate() {
                println!("{:>3}. {image}", index + 1);
            }
        }
        OutputMode::Json => write_json_line(&json!({
            "dir": listing.dir.display().to_string(),
            "images": listing.images,
        }))?,
    }
    Ok(())
}

pub fn render_error(err: &AppError, mode: OutputMode) {
    match mode {
        OutputMode::Human => {
            eprintln!("error: {}", err.human_message());
            if let Some(source) = err.source() {
                eprintln!("cause: {source}");
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "status": "error",
                "error": err.human_message(),
            });
            if let Ok(json) = serde_json::to_string(&payload) {
                println!("{json}");
            }
            if let Some(source) = err.source() {
                eprintln!("cause: {source}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facelock_core::faces::{BatchEnrollmentOutcome, EnrolledImage, SkippedImage, TemplateMatch};
    use facelock_core::unlock::UnlockStage;
    use std::path::PathBuf;
    use std::time::Duration;

    fn accepted_outcome() -> LivenessOutcome {
        LivenessOutcome {
            accepted: true,
            matches: 3,
            required: 3,
            frames_delivered: 12,
            frames_processed: 6,
            frames_with_face: 5,
            faces_detected: 5,
            matched_templates: vec![TemplateMatch {
                template_index: 1,
                similarity: 0.91,
            }],
            closest_miss: None,
            elapsed: Duration::from_millis(1500),
        }
    }

    #[test]
    fn stage_events_carry_status_text() {
        let payload = unlock_event_payload(&UnlockEvent::Stage(UnlockStage::Scanning));
        assert_eq!(payload["event"], "stage");
        assert_eq!(payload["stage"], "scanning");
        assert_eq!(payload["status"], "Looking for your face...");
    }

    #[test]
    fn unlocked_event_includes_outcome() {
        let payload = unlock_event_payload(&UnlockEvent::Unlocked {
            attempt: 2,
            outcome: accepted_outcome(),
        });
        assert_eq!(payload["attempt"], 2);
        assert_eq!(payload["outcome"]["matches"], 3);
        assert_eq!(payload["outcome"]["elapsed_secs"], 1.5);
        assert_eq!(
            payload["outcome"]["matched_templates"][0]["template_index"],
            1
        );
    }

    #[test]
    fn rejected_attempts_report_the_closest_similarity() {
        let mut outcome = accepted_outcome();
        outcome.accepted = false;
        outcome.matches = 1;
        outcome.closest_miss = Some(0.6123);
        assert_eq!(
            rejection_summary(&outcome),
            "1/3 matches in 1.5s, closest similarity 0.612"
        );

        outcome.closest_miss = None;
        outcome.frames_with_face = 0;
        assert_eq!(rejection_summary(&outcome), "1/3 matches in 1.5s, no face seen");

        let payload = unlock_event_payload(&UnlockEvent::AttemptRejected {
            attempt: 1,
            outcome,
        });
        assert_eq!(payload["outcome"]["closest_miss"], Value::Null);
        assert_eq!(payload["outcome"]["frames_with_face"], 0);
    }

    #[test]
    fn summary_reports_status_and_attempts() {
        let payload = unlock_summary_payload(&UnlockSummary {
            result: UnlockResult::Exhausted { attempts: 3 },
            template_path: PathBuf::from("/tmp/face_templates.dat"),
            templates: 5,
        });
        assert_eq!(payload["status"], "exhausted");
        assert_eq!(payload["attempts"], 3);
        assert_eq!(payload["templates"], 5);
    }

    #[test]
    fn batch_enroll_payload_lists_skips() {
        let outcome = EnrollOutcome::Batch(BatchEnrollmentOutcome {
            store_path: PathBuf::from("/tmp/face_templates.dat"),
            enrolled: vec![EnrolledImage {
                file: "a.png".into(),
                template_id: "id-a".into(),
            }],
            skipped: vec![SkippedImage {
                file: "b.png".into(),
                reason: "no face detected".into(),
            }],
            logs: vec![],
        });
        let payload = enroll_payload(&outcome);
        assert_eq!(payload["mode"], "batch");
        assert_eq!(payload["templates"], 1);
        assert_eq!(payload["skipped"][0]["file"], "b.png");
    }
}

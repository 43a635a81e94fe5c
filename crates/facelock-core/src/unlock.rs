//! Background unlock loop.
//!
//! The worker thread owns the camera and the face locator; the caller only
//! sees [`UnlockEvent`]s arriving on a channel and the final [`UnlockResult`].

use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::capture::FrameSource;
use crate::errors::{AppError, AppResult};
use crate::faces::liveness::{Clock, LivenessConfig, LivenessEngine, LivenessOutcome};
use crate::faces::locator::FaceLocator;
use crate::faces::store::TemplateSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockStage {
    Locked,
    InitializingCamera,
    Scanning,
    Recognized,
    Retrying,
}

impl UnlockStage {
    pub fn status_text(&self) -> &'static str {
        match self {
            UnlockStage::Locked => "Locked",
            UnlockStage::InitializingCamera => "Initializing camera...",
            UnlockStage::Scanning => "Looking for your face...",
            UnlockStage::Recognized => "Face recognized",
            UnlockStage::Retrying => "Not recognized, retrying...",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnlockEvent {
    Stage(UnlockStage),
    Match {
        attempt: u32,
        count: u32,
        required: u32,
        template_index: usize,
        similarity: f64,
    },
    AttemptRejected {
        attempt: u32,
        outcome: LivenessOutcome,
    },
    CameraError {
        attempt: u32,
        message: String,
    },
    Unlocked {
        attempt: u32,
        outcome: LivenessOutcome,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockResult {
    Unlocked { attempts: u32 },
    Exhausted { attempts: u32 },
    Cancelled { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnlockConfig {
    pub liveness: LivenessConfig,
    pub retry_interval: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for UnlockConfig {
    fn default() -> Self {
        Self {
            liveness: LivenessConfig::default(),
            retry_interval: Duration::from_millis(1000),
            max_attempts: None,
        }
    }
}

pub struct UnlockComponents {
    pub source: Box<dyn FrameSource>,
    pub locator: Box<dyn FaceLocator>,
}

pub struct UnlockWorker {
    events: Receiver<UnlockEvent>,
    shutdown: Option<Sender<()>>,
    handle: thread::JoinHandle<AppResult<UnlockResult>>,
}

impl UnlockWorker {
    pub fn events(&self) -> &Receiver<UnlockEvent> {
        &self.events
    }

    /// Asks the worker to stop at its next backoff.
    pub fn stop(&mut self) {
        self.shutdown.take();
    }

    pub fn join(self) -> AppResult<UnlockResult> {
        let UnlockWorker {
            events,
            shutdown,
            handle,
        } = self;
        drop(events);
        let result = handle
            .join()
            .map_err(|_| AppError::Worker("unlock thread panicked".into()))?;
        drop(shutdown);
        result
    }
}

/// Starts the unlock loop on its own thread.
///
/// `factory` runs on that thread, so camera and detector handles never cross
/// threads.
pub fn spawn_unlock_worker<F>(
    config: UnlockConfig,
    templates: TemplateSet,
    factory: F,
) -> AppResult<UnlockWorker>
where
    F: FnOnce() -> AppResult<UnlockComponents> + Send + 'static,
{
    let engine = LivenessEngine::new(config.liveness)?;
    let (events_tx, events_rx) = unbounded();
    let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

    let handle = thread::Builder::new()
        .name("facelock-unlock".into())
        .spawn(move || {
            let UnlockComponents {
                mut source,
                mut locator,
            } = factory()?;
            run_unlock_loop(
                &engine,
                &config,
                &templates,
                source.as_mut(),
                locator.as_mut(),
                &events_tx,
                &shutdown_rx,
            )
        })?;

    Ok(UnlockWorker {
        events: events_rx,
        shutdown: Some(shutdown_tx),
        handle,
    })
}

/// Repeats liveness attempts until one is accepted, attempts run out, the
/// shutdown channel closes, or a non-camera error occurs.
pub fn run_unlock_loop<C, S, L>(
    engine: &LivenessEngine<C>,
    config: &UnlockConfig,
    templates: &TemplateSet,
    source: &mut S,
    locator: &mut L,
    events: &Sender<UnlockEvent>,
    shutdown: &Receiver<()>,
) -> AppResult<UnlockResult>
where
    C: Clock,
    S: FrameSource + ?Sized,
    L: FaceLocator + ?Sized,
{
    let emit = |event: UnlockEvent| {
        if events.send(event).is_err() {
            debug!("unlock event receiver dropped");
        }
    };

    emit(UnlockEvent::Stage(UnlockStage::Locked));
    let mut attempt = 0u32;
    loop {
        if config.max_attempts.is_some_and(|max| attempt >= max) {
            info!(attempts = attempt, "giving up after maximum attempts");
            return Ok(UnlockResult::Exhausted { attempts: attempt });
        }
        if matches!(shutdown.try_recv(), Err(TryRecvError::Disconnected)) {
            return Ok(UnlockResult::Cancelled { attempts: attempt });
        }
        attempt += 1;

        emit(UnlockEvent::Stage(UnlockStage::InitializingCamera));
        let result = source.acquire().and_then(|mut stream| {
            emit(UnlockEvent::Stage(UnlockStage::Scanning));
            engine.evaluate_observed(stream.as_mut(), locator, templates, |progress| {
                emit(UnlockEvent::Match {
                    attempt,
                    count: progress.count,
                    required: progress.required,
                    template_index: progress.matched.template_index,
                    similarity: progress.matched.similarity,
                })
            })
        });

        let delay = match result {
            Ok(outcome) if outcome.accepted => {
                info!(attempt, "face unlock accepted");
                emit(UnlockEvent::Stage(UnlockStage::Recognized));
                emit(UnlockEvent::Unlocked { attempt, outcome });
                return Ok(UnlockResult::Unlocked { attempts: attempt });
            }
            Ok(outcome) => {
                info!(attempt, matches = outcome.matches, "face unlock rejected");
                emit(UnlockEvent::AttemptRejected { attempt, outcome });
                config.retry_interval
            }
            Err(err) if err.is_acquisition() => {
                warn!(attempt, error = %err, "camera error during unlock attempt");
                emit(UnlockEvent::CameraError {
                    attempt,
                    message: err.to_string(),
                });
                config.retry_interval * 2
            }
            Err(err) => return Err(err),
        };

        emit(UnlockEvent::Stage(UnlockStage::Retrying));
        match shutdown.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                return Ok(UnlockResult::Cancelled { attempts: attempt });
            }
        }
    }
}

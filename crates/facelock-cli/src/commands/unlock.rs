use std::any::Any;
use std::process::ExitCode;

use facelock_core::unlock::{UnlockEvent, UnlockResult};

use crate::cli::{OutputMode, UnlockArgs};
use crate::commands::CommandHandler;
use crate::errors::AppResult;
use crate::output::{render_unlock, render_unlock_event};
use crate::unlock::{self, UnlockSummary};

type EventSink<'a> = &'a mut dyn FnMut(&UnlockEvent) -> AppResult<()>;

pub struct UnlockHandler {
    args: UnlockArgs,
    run: Box<dyn Fn(&UnlockArgs, EventSink<'_>) -> AppResult<UnlockSummary> + Send + Sync>,
    render_event: Box<dyn Fn(&UnlockEvent, OutputMode) -> AppResult<()> + Send + Sync>,
    render: Box<dyn Fn(&UnlockSummary, OutputMode) -> AppResult<()> + Send + Sync>,
}

impl UnlockHandler {
    pub fn new(args: UnlockArgs) -> Self {
        Self::with_dependencies(args, unlock::run_unlock, render_unlock_event, render_unlock)
    }

    pub fn with_dependencies(
        args: UnlockArgs,
        run: impl Fn(&UnlockArgs, EventSink<'_>) -> AppResult<UnlockSummary> + Send + Sync + 'static,
        render_event: impl Fn(&UnlockEvent, OutputMode) -> AppResult<()> + Send + Sync + 'static,
        render: impl Fn(&UnlockSummary, OutputMode) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            args,
            run: Box::new(run),
            render_event: Box::new(render_event),
            render: Box::new(render),
        }
    }

    pub fn args(&self) -> &UnlockArgs {
        &self.args
    }
}

impl CommandHandler for UnlockHandler {
    fn execute(&self, mode: OutputMode, _verbose: bool) -> AppResult<ExitCode> {
        let mut sink = |event: &UnlockEvent| (self.render_event)(event, mode);
        let summary = (self.run)(&self.args, &mut sink)?;
        (self.render)(&summary, mode)?;
        Ok(match summary.result {
            UnlockResult::Unlocked { .. } => ExitCode::SUCCESS,
            UnlockResult::Exhausted { .. } => ExitCode::from(1),
            UnlockResult::Cancelled { .. } => ExitCode::from(130),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

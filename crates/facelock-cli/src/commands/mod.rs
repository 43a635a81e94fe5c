use std::any::Any;
use std::process::ExitCode;

use crate::cli::{Commands, OutputMode};
use crate::errors::AppResult;

pub trait CommandHandler: Send + Sync {
    fn execute(&self, mode: OutputMode, verbose: bool) -> AppResult<ExitCode>;
    fn as_any(&self) -> &dyn Any;
}

mod enroll;
mod images;
mod unlock;

pub use enroll::EnrollHandler;
pub use images::ImagesHandler;
pub use unlock::UnlockHandler;

impl From<Commands> for Box<dyn CommandHandler> {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Unlock(args) => Box::new(UnlockHandler::new(args)),
            Commands::Enroll(args) => Box::new(EnrollHandler::new(args)),
            Commands::Images(args) => Box::new(ImagesHandler::new(args)),
        }
    }
}

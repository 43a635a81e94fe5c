use std::any::Any;
use std::process::ExitCode;

use crate::cli::{ImagesArgs, OutputMode};
use crate::commands::CommandHandler;
use crate::errors::AppResult;
use crate::images::{self, ImageListing};
use crate::output::render_images;

pub struct ImagesHandler {
    args: ImagesArgs,
    run: Box<dyn Fn(&ImagesArgs) -> AppResult<ImageListing> + Send + Sync>,
    render: Box<dyn Fn(&ImageListing, OutputMode) -> AppResult<()> + Send + Sync>,
}

impl ImagesHandler {
    pub fn new(args: ImagesArgs) -> Self {
        Self::with_dependencies(args, images::run_list_images, render_images)
    }

    pub fn with_dependencies(
        args: ImagesArgs,
        run: impl Fn(&ImagesArgs) -> AppResult<ImageListing> + Send + Sync + 'static,
        render: impl Fn(&ImageListing, OutputMode) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            args,
            run: Box::new(run),
            render: Box::new(render),
        }
    }
}

impl CommandHandler for ImagesHandler {
    fn execute(&self, mode: OutputMode, _verbose: bool) -> AppResult<ExitCode> {
        let listing = (self.run)(&self.args)?;
        (self.render)(&listing, mode)?;
        Ok(ExitCode::SUCCESS)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

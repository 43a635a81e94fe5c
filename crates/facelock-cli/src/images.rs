use std::path::PathBuf;

use facelock_core::errors::AppResult;
use facelock_core::faces::list_enrollment_images;
use serde::Serialize;

use crate::cli::ImagesArgs;
use crate::config::load_settings;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageListing {
    pub dir: PathBuf,
    pub images: Vec<String>,
}

pub fn run_list_images(args: &ImagesArgs) -> AppResult<ImageListing> {
    let dir = match &args.dir {
        Some(dir) => dir.clone(),
        None => load_settings()?.enrollment_dir,
    };
    list_images_in(dir)
}

/// File names are listed in the order `enroll --image N` numbers them.
pub fn list_images_in(dir: PathBuf) -> AppResult<ImageListing> {
    let images = list_enrollment_images(&dir)?
        .iter()
        .filter_map(|path| path.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .collect();
    Ok(ImageListing { dir, images })
}

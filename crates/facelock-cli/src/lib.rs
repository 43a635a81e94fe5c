pub mod cli;
pub mod commands;
pub mod config;
pub mod enroll;
pub mod guided;
pub mod images;
pub mod output;
pub mod unlock;

pub use facelock_core::errors;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "facelock",
    about = "Unlock a local session with an enrolled face",
    version
)]
pub struct Cli {
    /// Emit structured JSON to stdout instead of human-readable logs
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase verbosity (may be used multiple times)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    pub fn output_mode(&self) -> OutputMode {
        if self.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }

    /// Running without a subcommand unlocks.
    pub fn command_or_default(self) -> Commands {
        self.command
            .unwrap_or_else(|| Commands::Unlock(UnlockArgs::default()))
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Watch the camera until an enrolled face is recognized
    Unlock(UnlockArgs),
    /// Replace the enrolled face templates
    Enroll(EnrollArgs),
    /// List candidate images for batch enrollment
    Images(ImagesArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct UnlockArgs {
    /// Video device path (e.g. /dev/video2) or index (e.g. 0)
    #[arg(long)]
    pub device: Option<String>,

    /// Template file to authenticate against
    #[arg(long)]
    pub templates: Option<PathBuf>,

    /// Stop after this many rejected attempts instead of retrying forever
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Replay still images from a directory instead of opening a camera
    #[arg(long)]
    pub frames_dir: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct EnrollArgs {
    /// Video device path (e.g. /dev/video2) or index (e.g. 0)
    #[arg(long)]
    pub device: Option<String>,

    /// Template file to write
    #[arg(long)]
    pub templates: Option<PathBuf>,

    /// Enroll every image in a directory instead of guided capture
    #[arg(long, value_name = "DIR", conflicts_with = "image")]
    pub from_dir: Option<PathBuf>,

    /// Enroll one image, by path or by its number in `facelock images`
    #[arg(long, value_name = "FILE|N")]
    pub image: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ImagesArgs {
    /// Directory to list (defaults to the configured enrollment directory)
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_unlock() {
        let cli = Cli::try_parse_from(["facelock", "--json"]).unwrap();
        assert_eq!(cli.output_mode(), OutputMode::Json);
        assert!(matches!(cli.command_or_default(), Commands::Unlock(_)));
    }

    #[test]
    fn enroll_flags_parse() {
        let cli =
            Cli::try_parse_from(["facelock", "enroll", "--image", "2", "-vv"]).unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command_or_default() {
            Commands::Enroll(args) => assert_eq!(args.image.as_deref(), Some("2")),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn from_dir_conflicts_with_image() {
        let parsed = Cli::try_parse_from([
            "facelock",
            "enroll",
            "--from-dir",
            "face_model",
            "--image",
            "a.png",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn unlock_flags_parse() {
        let cli = Cli::try_parse_from([
            "facelock",
            "unlock",
            "--device",
            "2",
            "--max-attempts",
            "3",
        ])
        .unwrap();
        match cli.command_or_default() {
            Commands::Unlock(args) => {
                assert_eq!(args.device.as_deref(), Some("2"));
                assert_eq!(args.max_attempts, Some(3));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}

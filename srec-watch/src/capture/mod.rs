//! Capture command construction and post-capture processing.

mod convert;
mod ffmpeg;

pub use convert::{convert_to_mp4, produced_files};
pub use ffmpeg::FfmpegCommandBuilder;

use std::path::PathBuf;

use chrono::{DateTime, Local};

use crate::Result;

/// Everything needed to build a capture command for one live session.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub entry_id: String,
    pub name: String,
    pub title: Option<String>,
    pub media_locator: String,
    pub proxy: Option<String>,
    pub credentials: Option<String>,
    pub format: String,
    pub segment: bool,
    pub segment_time_secs: u64,
    pub output_dir: PathBuf,
    pub started_at: DateTime<Local>,
}

/// A ready-to-spawn command line plus where its output lands.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureCommand {
    pub program: String,
    pub args: Vec<String>,
    pub output_dir: PathBuf,
    /// File name without extension (and without the segment suffix).
    pub file_stem: String,
    pub format: String,
}

impl CaptureCommand {
    /// A bare command without capture output, used for tests and helpers.
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            output_dir: PathBuf::new(),
            file_stem: String::new(),
            format: String::new(),
        }
    }
}

/// Turns a capture request into a command line.
pub trait CommandBuilder: Send + Sync {
    fn build(&self, request: &CaptureRequest) -> Result<CaptureCommand>;
}

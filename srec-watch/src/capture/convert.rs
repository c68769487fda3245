//! Post-capture conversion to mp4.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use process_utils::tokio_command;
use tracing::{debug, info, warn};

use super::CaptureCommand;
use crate::{Error, Result};

/// Files written by a finished capture, sorted by name.
///
/// Matches both the single-file output and the `_NNN` segments.
pub async fn produced_files(command: &CaptureCommand) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(&command.output_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let matches = entry.file_type().await?.is_file()
            && path.extension().and_then(|e| e.to_str()) == Some(command.format.as_str())
            && path
                .file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|stem| stem.starts_with(&command.file_stem));
        if matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Remux `input` into an mp4 next to it, then delete the source or move
/// it into an `original/` subdirectory.
pub async fn convert_to_mp4(ffmpeg: &str, input: &Path, delete_original: bool) -> Result<PathBuf> {
    let output = input.with_extension("mp4");
    debug!(input = %input.display(), output = %output.display(), "Converting capture to mp4");

    let status = tokio_command(ffmpeg)
        .arg("-y")
        .arg("-i")
        .arg(input)
        .args(["-c:v", "copy", "-c:a", "copy", "-f", "mp4"])
        .arg(&output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| Error::process(format!("failed to run {ffmpeg}: {e}")))?;

    if !status.success() {
        return Err(Error::process(format!(
            "conversion of {} failed with {status}",
            input.display()
        )));
    }

    if delete_original {
        tokio::fs::remove_file(input).await?;
    } else if let (Some(parent), Some(name)) = (input.parent(), input.file_name()) {
        let archive = parent.join("original");
        tokio::fs::create_dir_all(&archive).await?;
        if let Err(e) = tokio::fs::rename(input, archive.join(name)).await {
            warn!(input = %input.display(), error = %e, "Failed to move original capture");
        }
    }

    info!(output = %output.display(), "Converted capture to mp4");
    Ok(output)
}

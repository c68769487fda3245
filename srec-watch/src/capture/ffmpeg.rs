//! ffmpeg-based capture command.

use super::{CaptureCommand, CaptureRequest, CommandBuilder};
use crate::config::{AppSettings, VALID_FORMATS};
use crate::utils::sanitize_filename;
use crate::{Error, Result};

/// Builds `ffmpeg` stream-copy commands.
#[derive(Debug, Clone)]
pub struct FfmpegCommandBuilder {
    ffmpeg_path: String,
    user_agent: Option<String>,
}

impl FfmpegCommandBuilder {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            user_agent: None,
        }
    }

    pub fn from_settings(settings: &AppSettings) -> Self {
        let builder = Self::new(settings.ffmpeg_path.clone());
        match settings.capture_user_agent.as_deref().filter(|ua| !ua.trim().is_empty()) {
            Some(ua) => builder.with_user_agent(ua),
            None => builder,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// `<name>_<title>_<YYYY-MM-DD_HH-MM-SS>`, sanitized.
    pub fn file_stem(request: &CaptureRequest) -> String {
        let time = request.started_at.format("%Y-%m-%d_%H-%M-%S");
        match request.title.as_deref().filter(|t| !t.trim().is_empty()) {
            Some(title) => format!(
                "{}_{}_{}",
                sanitize_filename(&request.name),
                sanitize_filename(title),
                time
            ),
            None => format!("{}_{}", sanitize_filename(&request.name), time),
        }
    }

    fn muxer(format: &str) -> &'static str {
        match format {
            "ts" => "mpegts",
            "mkv" => "matroska",
            "m4a" => "ipod",
            "flv" => "flv",
            "mov" => "mov",
            "mp3" => "mp3",
            _ => "mp4",
        }
    }

    fn codec_args(format: &str) -> Vec<String> {
        let args: &[&str] = match format {
            "mp3" => &["-vn", "-c:a", "libmp3lame", "-b:a", "320k"],
            "m4a" => &["-vn", "-c:a", "aac", "-b:a", "320k"],
            _ => &["-c", "copy"],
        };
        args.iter().map(|s| s.to_string()).collect()
    }
}

impl CommandBuilder for FfmpegCommandBuilder {
    fn build(&self, request: &CaptureRequest) -> Result<CaptureCommand> {
        if !VALID_FORMATS.contains(&request.format.as_str()) {
            return Err(Error::validation(format!(
                "unsupported capture format '{}'",
                request.format
            )));
        }

        let mut args: Vec<String> = ["-y", "-hide_banner", "-loglevel", "error"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        if let Some(ua) = &self.user_agent {
            args.extend(["-user_agent".to_string(), ua.clone()]);
        }
        if let Some(proxy) = &request.proxy {
            args.extend(["-http_proxy".to_string(), proxy.clone()]);
        }
        if let Some(cookies) = &request.credentials {
            args.extend(["-headers".to_string(), format!("Cookie: {cookies}\r\n")]);
        }

        args.extend(["-i".to_string(), request.media_locator.clone()]);
        args.extend(Self::codec_args(&request.format));

        let file_stem = Self::file_stem(request);
        let muxer = Self::muxer(&request.format);

        let output = if request.segment {
            args.extend([
                "-f".to_string(),
                "segment".to_string(),
                "-segment_time".to_string(),
                request.segment_time_secs.to_string(),
                "-segment_format".to_string(),
                muxer.to_string(),
                "-reset_timestamps".to_string(),
                "1".to_string(),
            ]);
            request
                .output_dir
                .join(format!("{file_stem}_%03d.{}", request.format))
        } else {
            args.extend(["-f".to_string(), muxer.to_string()]);
            request
                .output_dir
                .join(format!("{file_stem}.{}", request.format))
        };
        args.push(output.to_string_lossy().to_string());

        Ok(CaptureCommand {
            program: self.ffmpeg_path.clone(),
            args,
            output_dir: request.output_dir.clone(),
            file_stem,
            format: request.format.clone(),
        })
    }
}

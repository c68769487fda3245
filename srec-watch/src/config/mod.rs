//! Application settings.
//!
//! Settings are read from a JSON file; every field has a default so a
//! partial (or missing) file is fine. A handful of paths can be overridden
//! from the environment, which `main` populates from `.env` via `dotenvy`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::notification::ChannelConfig;
use crate::{Error, Result};

/// Environment variable pointing at the settings file.
pub const CONFIG_PATH_ENV: &str = "SREC_WATCH_CONFIG";
/// Environment override for [`AppSettings::data_dir`].
pub const DATA_DIR_ENV: &str = "SREC_WATCH_DATA_DIR";
/// Environment override for [`AppSettings::log_dir`].
pub const LOG_DIR_ENV: &str = "SREC_WATCH_LOG_DIR";

const DEFAULT_CONFIG_PATH: &str = "config/settings.json";

/// Container formats the capture command can produce.
pub const VALID_FORMATS: &[&str] = &["ts", "flv", "mkv", "mov", "mp4", "mp3", "m4a"];

/// Timeouts for the escalating stop of a capture process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StopGraceConfig {
    /// Wait after the graceful quit byte.
    pub quit_secs: u64,
    /// Wait after the terminate signal.
    pub terminate_secs: u64,
    /// Wait after the kill signal.
    pub kill_secs: u64,
}

impl Default for StopGraceConfig {
    fn default() -> Self {
        Self {
            quit_secs: 2,
            terminate_secs: 5,
            kill_secs: 3,
        }
    }
}

/// Global application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Where capture files are written.
    pub output_dir: PathBuf,
    /// Where the entry list is persisted.
    pub data_dir: PathBuf,
    /// Where rolling log files go.
    pub log_dir: PathBuf,
    pub log_retention_days: i64,

    /// Default check interval for new entries.
    pub check_interval_secs: u64,
    /// Never capture, only notify when a stream goes live.
    pub notify_only: bool,
    /// Check interval used while in notify-only mode.
    pub notify_interval_secs: u64,
    /// How often the scheduler looks for due entries.
    pub scheduler_tick_secs: u64,
    /// Bound on a single liveness query.
    pub liveness_timeout_secs: u64,

    /// Free space (in GB) below which new captures are refused.
    pub disk_threshold_gb: f64,
    pub disk_notify_throttle_secs: u64,

    pub dedup_window_secs: u64,
    pub inter_job_delay_ms: u64,

    pub handler_idle_secs: u64,
    pub handler_sweep_secs: u64,

    pub process_poll_secs: u64,
    pub stop_grace: StopGraceConfig,

    pub ffmpeg_path: String,
    /// `User-Agent` the capture process presents to the media server.
    pub capture_user_agent: Option<String>,
    pub default_format: String,
    pub segment_recording: bool,
    pub segment_time_secs: u64,
    pub convert_to_mp4: bool,
    /// After conversion, delete the source file instead of moving it to `original/`.
    pub delete_original: bool,

    pub notify_on_start: bool,
    pub notify_on_end: bool,

    /// Default proxy for liveness queries and capture.
    pub proxy: Option<String>,
    /// Base URL of the stream resolver service.
    pub resolver_endpoint: Option<String>,

    pub channels: Vec<ChannelConfig>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            data_dir: PathBuf::from("data"),
            log_dir: PathBuf::from("logs"),
            log_retention_days: 7,
            check_interval_secs: 300,
            notify_only: false,
            notify_interval_secs: 3600,
            scheduler_tick_secs: 10,
            liveness_timeout_secs: 10,
            disk_threshold_gb: 1.0,
            disk_notify_throttle_secs: 60,
            dedup_window_secs: 30,
            inter_job_delay_ms: 500,
            handler_idle_secs: 300,
            handler_sweep_secs: 180,
            process_poll_secs: 30,
            stop_grace: StopGraceConfig::default(),
            ffmpeg_path: "ffmpeg".to_string(),
            capture_user_agent: None,
            default_format: "ts".to_string(),
            segment_recording: true,
            segment_time_secs: 1800,
            convert_to_mp4: false,
            delete_original: true,
            notify_on_start: true,
            notify_on_end: true,
            proxy: None,
            resolver_endpoint: None,
            channels: Vec::new(),
        }
    }
}

impl AppSettings {
    /// Load settings from the path in `SREC_WATCH_CONFIG`, or the default path.
    pub fn load_from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut settings = Self::load(&path)?;

        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            settings.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var(LOG_DIR_ENV) {
            settings.log_dir = PathBuf::from(dir);
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a JSON file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let settings: Self = serde_json::from_str(&contents)?;
                info!(path = %path.display(), "Loaded settings");
                Ok(settings)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Settings file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Check the settings for values the rest of the crate cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !VALID_FORMATS.contains(&self.default_format.as_str()) {
            return Err(Error::config(format!(
                "unsupported capture format '{}', expected one of {:?}",
                self.default_format, VALID_FORMATS
            )));
        }

        for (name, value) in [
            ("check_interval_secs", self.check_interval_secs),
            ("notify_interval_secs", self.notify_interval_secs),
            ("scheduler_tick_secs", self.scheduler_tick_secs),
            ("liveness_timeout_secs", self.liveness_timeout_secs),
            ("segment_time_secs", self.segment_time_secs),
        ] {
            if value == 0 {
                return Err(Error::config(format!("{name} must be greater than zero")));
            }
        }

        if self.disk_threshold_gb < 0.0 {
            return Err(Error::config("disk_threshold_gb must not be negative"));
        }

        if let Some(proxy) = &self.proxy {
            validate_proxy(proxy)?;
        }

        Ok(())
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs)
    }

    /// Disk threshold converted to bytes.
    pub fn disk_threshold_bytes(&self) -> u64 {
        (self.disk_threshold_gb * 1024.0 * 1024.0 * 1024.0) as u64
    }

    /// Path of the persisted entry list.
    pub fn entries_path(&self) -> PathBuf {
        self.data_dir.join("entries.json")
    }
}

/// Accept `http`, `https` and `socks5` proxies with a host.
pub fn validate_proxy(proxy: &str) -> Result<()> {
    let parsed = url::Url::parse(proxy)
        .map_err(|e| Error::config(format!("invalid proxy '{proxy}': {e}")))?;

    if !matches!(parsed.scheme(), "http" | "https" | "socks5" | "socks5h") {
        return Err(Error::config(format!(
            "invalid proxy '{proxy}': unsupported scheme '{}'",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(Error::config(format!("invalid proxy '{proxy}': missing host")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = AppSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.check_interval_secs, 300);
        assert_eq!(settings.notify_interval_secs, 3600);
        assert_eq!(settings.dedup_window_secs, 30);
        assert_eq!(settings.stop_grace, StopGraceConfig::default());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: AppSettings =
            serde_json::from_str(r#"{"notify_only": true, "default_format": "flv"}"#).unwrap();
        assert!(settings.notify_only);
        assert_eq!(settings.default_format, "flv");
        assert_eq!(settings.liveness_timeout_secs, 10);
        assert_eq!(settings.stop_grace.kill_secs, 3);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AppSettings::load(dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.output_dir, PathBuf::from("downloads"));
    }

    #[test]
    fn test_rejects_bad_format() {
        let settings = AppSettings {
            default_format: "avi".to_string(),
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let settings = AppSettings {
            check_interval_secs: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_proxy() {
        assert!(validate_proxy("http://127.0.0.1:7890").is_ok());
        assert!(validate_proxy("socks5://localhost:1080").is_ok());
        assert!(validate_proxy("ftp://host:21").is_err());
        assert!(validate_proxy("not a url").is_err());
    }

    #[test]
    fn test_threshold_bytes() {
        let settings = AppSettings {
            disk_threshold_gb: 2.0,
            ..Default::default()
        };
        assert_eq!(settings.disk_threshold_bytes(), 2 * 1024 * 1024 * 1024);
    }
}

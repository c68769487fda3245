//! Panic reporting.
//!
//! Capture tasks run detached, so a panic in one of them would otherwise
//! only show up on stderr. The hook routes it through `tracing` and, for
//! `panic = "abort"` release builds where the non-blocking log writer never
//! gets to flush, appends the record straight to today's rolling log file.

use std::backtrace::Backtrace;
use std::fs::OpenOptions;
use std::io::Write;
use std::panic::PanicHookInfo;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::logging::LOG_FILE_PREFIX;

/// Install the hook. The previous hook still runs afterwards.
pub fn install(log_dir: impl AsRef<Path>) {
    let log_dir = log_dir.as_ref().to_path_buf();
    let previous = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info| {
        let record = describe(info);
        tracing::error!(target: "srec_watch::panic", "{record}");

        if cfg!(panic = "abort") {
            let _ = append(&todays_log(&log_dir), &record);
        }

        previous(info);
    }));
}

fn todays_log(log_dir: &Path) -> PathBuf {
    log_dir.join(format!("{LOG_FILE_PREFIX}.{}", Local::now().format("%Y-%m-%d")))
}

fn append(path: &Path, record: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{record}")?;
    file.flush()
}

fn describe(info: &PanicHookInfo<'_>) -> String {
    let payload = info
        .payload()
        .downcast_ref::<&'static str>()
        .map(|s| (*s).to_string())
        .or_else(|| info.payload().downcast_ref::<String>().cloned())
        .unwrap_or_else(|| info.to_string());

    let location = info
        .location()
        .map(|loc| format!("{}:{}", loc.file(), loc.line()))
        .unwrap_or_else(|| "<unknown>".to_string());

    let thread = std::thread::current();
    let thread_name = thread.name().unwrap_or("<unnamed>");

    format!(
        "{} PANIC thread={thread_name} location={location} payload={payload}\n{}",
        Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"),
        Backtrace::force_capture()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_todays_log_matches_rolling_name() {
        let path = todays_log(Path::new("/tmp/logs"));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("srec-watch.log."));
        assert_eq!(name.len(), "srec-watch.log.".len() + 10);
    }

    #[test]
    fn test_append_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panic.log");
        append(&path, "first").unwrap();
        append(&path, "second").unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "first\nsecond\n");
    }
}

//! Notification payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Priority level for notifications.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NotificationPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// What triggered a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationKind {
    StreamStart,
    StreamEnd,
    DiskLow,
    CaptureError,
    HandlerError,
    Test,
}

impl NotificationKind {
    pub fn priority(&self) -> NotificationPriority {
        match self {
            Self::DiskLow | Self::CaptureError | Self::HandlerError => NotificationPriority::High,
            Self::StreamStart | Self::StreamEnd => NotificationPriority::Normal,
            Self::Test => NotificationPriority::Low,
        }
    }
}

/// A short text alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl NotificationMessage {
    pub fn new(kind: NotificationKind, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            body: body.into(),
            entry_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_entry(mut self, entry_id: impl Into<String>) -> Self {
        self.entry_id = Some(entry_id.into());
        self
    }

    pub fn stream_start(name: &str, stream_title: Option<&str>) -> Self {
        let body = match stream_title {
            Some(t) if !t.is_empty() => format!("{name} is live: {t}"),
            _ => format!("{name} is live"),
        };
        Self::new(NotificationKind::StreamStart, "Stream started", body)
    }

    pub fn stream_end(name: &str) -> Self {
        Self::new(
            NotificationKind::StreamEnd,
            "Stream ended",
            format!("{name} went offline"),
        )
    }

    pub fn disk_low(free_gb: f64, threshold_gb: f64) -> Self {
        Self::new(
            NotificationKind::DiskLow,
            "Disk space low",
            format!(
                "{free_gb:.2} GB free, below the {threshold_gb:.2} GB threshold. New captures are paused."
            ),
        )
    }

    pub fn capture_error(name: &str, code: Option<i32>) -> Self {
        let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        Self::new(
            NotificationKind::CaptureError,
            "Capture failed",
            format!("Capture of {name} exited unexpectedly ({code})"),
        )
    }

    pub fn handler_unavailable(name: &str, reason: &str) -> Self {
        Self::new(
            NotificationKind::HandlerError,
            "Liveness handler unavailable",
            format!("Cannot check {name}: {reason}"),
        )
    }

    pub fn test() -> Self {
        Self::new(NotificationKind::Test, "Test notification", "Channel is configured correctly")
    }

    pub fn priority(&self) -> NotificationPriority {
        self.kind.priority()
    }

    /// Dedup key: hex SHA-256 of title and body.
    pub fn dedup_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.title.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.body.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_hash_depends_on_content_only() {
        let a = NotificationMessage::stream_end("A");
        let mut b = NotificationMessage::stream_end("A").for_entry("x");
        b.timestamp = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(a.dedup_hash(), b.dedup_hash());
        assert_ne!(a.dedup_hash(), NotificationMessage::stream_end("B").dedup_hash());
        assert_eq!(a.dedup_hash().len(), 64);
    }

    #[test]
    fn test_hash_separates_title_and_body() {
        let a = NotificationMessage::new(NotificationKind::Test, "ab", "c");
        let b = NotificationMessage::new(NotificationKind::Test, "a", "bc");
        assert_ne!(a.dedup_hash(), b.dedup_hash());
    }

    #[test]
    fn test_priorities() {
        assert_eq!(NotificationMessage::disk_low(0.5, 1.0).priority(), NotificationPriority::High);
        assert!(NotificationPriority::Low < NotificationPriority::Normal);
        assert_eq!(NotificationKind::StreamStart.to_string(), "stream_start");
    }

    #[test]
    fn test_stream_start_body() {
        let msg = NotificationMessage::stream_start("Streamer", Some("Late show"));
        assert_eq!(msg.body, "Streamer is live: Late show");
        assert_eq!(NotificationMessage::stream_start("S", None).body, "S is live");
    }
}

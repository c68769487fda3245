//! The watch entry record and its notification bookkeeping.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::{ScheduledWindow, WatchStatus};
use crate::Result;

/// How a live stream is handled once detected.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MonitorMode {
    /// Start capturing automatically.
    #[default]
    Auto,
    /// Notify only; capture is started by the user.
    Manual,
}

/// One monitored live stream.
///
/// `capturing` implies `is_live`. Every helper below keeps that true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEntry {
    pub id: String,
    pub url: String,
    /// Display name (streamer / anchor).
    pub name: String,
    /// Last seen stream title.
    #[serde(default)]
    pub title: Option<String>,
    /// Platform detected from the URL.
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default = "default_quality")]
    pub quality: String,
    /// Container format; falls back to the global default when unset.
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub segment: Option<bool>,
    #[serde(default)]
    pub proxy: Option<String>,
    /// Cookie string sent with liveness queries and capture.
    #[serde(default)]
    pub credentials: Option<String>,
    #[serde(default)]
    pub mode: MonitorMode,
    #[serde(default)]
    pub schedule: Option<ScheduledWindow>,

    pub monitor_enabled: bool,
    #[serde(default)]
    pub status: WatchStatus,
    #[serde(default)]
    pub last_error: Option<String>,

    #[serde(default)]
    pub is_live: bool,
    #[serde(default)]
    pub capturing: bool,
    #[serde(default)]
    pub media_locator: Option<String>,

    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    pub check_interval_secs: u64,

    #[serde(default)]
    pub capture_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cumulative_duration_secs: i64,
    #[serde(default)]
    pub last_duration_secs: i64,

    /// The user stopped the current capture while the stream was live.
    #[serde(default)]
    pub manually_stopped: bool,
    /// A capture ran during the current live period and has ended.
    #[serde(default)]
    pub was_capturing: bool,
    #[serde(default)]
    pub start_notified: bool,
    #[serde(default)]
    pub end_notified: bool,

    pub created_at: DateTime<Utc>,
}

fn default_quality() -> String {
    "OD".to_string()
}

/// What a confirmed live-to-offline edge requires from the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OfflineOutcome {
    /// The stream was live before this observation.
    pub was_live: bool,
    /// A stream-end notification should go out.
    pub notify_end: bool,
    /// A capture session was running and has been closed; its process must be stopped.
    pub ended_capture: bool,
}

impl WatchEntry {
    pub fn new(url: impl Into<String>, name: impl Into<String>, check_interval_secs: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.into(),
            name: name.into(),
            title: None,
            platform: None,
            quality: default_quality(),
            format: None,
            segment: None,
            proxy: None,
            credentials: None,
            mode: MonitorMode::Auto,
            schedule: None,
            monitor_enabled: true,
            status: WatchStatus::Monitoring,
            last_error: None,
            is_live: false,
            capturing: false,
            media_locator: None,
            last_check: None,
            check_interval_secs,
            capture_started_at: None,
            cumulative_duration_secs: 0,
            last_duration_secs: 0,
            manually_stopped: false,
            was_capturing: false,
            start_notified: false,
            end_notified: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_mode(mut self, mode: MonitorMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduledWindow) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// `capturing ⇒ is_live`.
    pub fn invariant_holds(&self) -> bool {
        !self.capturing || self.is_live
    }

    /// Move to `target`, rejecting transitions the state machine does not allow.
    pub fn set_status(&mut self, target: WatchStatus) -> Result<()> {
        self.status = self.status.transition_to(target)?;
        Ok(())
    }

    /// Whether the check interval has elapsed since the last check.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_check {
            None => true,
            Some(last) => now - last >= TimeDelta::seconds(self.check_interval_secs as i64),
        }
    }

    /// Whether `now` (local wall clock) falls inside the scheduled window, if any.
    pub fn in_window(&self, now: chrono::NaiveTime) -> bool {
        self.schedule.is_none_or(|window| window.contains(now))
    }

    /// Record a live observation. Returns `true` when a new live period starts.
    pub fn mark_live(&mut self, title: Option<String>, media_locator: Option<String>) -> bool {
        if title.is_some() {
            self.title = title;
        }
        self.media_locator = media_locator;

        if self.is_live {
            return false;
        }
        self.is_live = true;
        self.end_notified = false;
        true
    }

    /// Decide whether a stream-start notification goes out for this observation.
    ///
    /// At most once per live period. A capture that ended while the stream
    /// stayed live has already been announced, so it does not fire again.
    pub fn claim_start_notification(&mut self) -> bool {
        if self.start_notified || self.was_capturing {
            return false;
        }
        self.start_notified = true;
        true
    }

    /// Record that the stream is offline (or that a query failed after a live period).
    ///
    /// Ends any running capture session so `capturing ⇒ is_live` keeps holding.
    pub fn mark_offline(&mut self, now: DateTime<Utc>) -> OfflineOutcome {
        if !self.is_live {
            return OfflineOutcome::default();
        }

        let ended_capture = self.end_capture(now).is_some();
        let notify_end = !self.end_notified && !self.manually_stopped;

        self.is_live = false;
        self.media_locator = None;
        self.end_notified = true;
        self.start_notified = false;
        self.was_capturing = false;
        self.manually_stopped = false;

        OfflineOutcome {
            was_live: true,
            notify_end,
            ended_capture,
        }
    }

    /// Open a capture session. Only valid while live.
    pub fn begin_capture(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_live || self.capturing {
            return false;
        }
        self.capturing = true;
        self.capture_started_at = Some(now);
        self.manually_stopped = false;
        true
    }

    /// Close the capture session and fold its duration into the totals.
    ///
    /// Returns `None` if no session was open.
    pub fn end_capture(&mut self, now: DateTime<Utc>) -> Option<TimeDelta> {
        if !self.capturing {
            return None;
        }
        self.capturing = false;

        let session = self
            .capture_started_at
            .take()
            .map(|started| (now - started).max(TimeDelta::zero()))
            .unwrap_or_default();
        self.cumulative_duration_secs += session.num_seconds();
        self.last_duration_secs = self.cumulative_duration_secs;

        if self.is_live {
            self.was_capturing = true;
        }
        Some(session)
    }

    /// The user stopped the capture but keeps monitoring.
    pub fn stop_capture_manually(&mut self, now: DateTime<Utc>) -> Option<TimeDelta> {
        let session = self.end_capture(now);
        if self.is_live {
            self.manually_stopped = true;
        }
        session
    }

    /// Disable monitoring and clear per-period notification state.
    pub fn stop_monitoring(&mut self, now: DateTime<Utc>) -> Option<TimeDelta> {
        let session = self.stop_capture_manually(now);
        self.monitor_enabled = false;
        self.status = WatchStatus::Stopped;
        self.start_notified = false;
        self.end_notified = false;
        self.was_capturing = false;
        session
    }

    /// Re-enable monitoring with a clean slate; the next check decides liveness afresh.
    pub fn start_monitoring(&mut self) {
        self.monitor_enabled = true;
        self.status = WatchStatus::Monitoring;
        self.is_live = false;
        self.media_locator = None;
        self.manually_stopped = false;
        self.start_notified = false;
        self.end_notified = false;
        self.was_capturing = false;
        self.last_error = None;
        self.last_check = None;
    }

    /// Drop runtime-only state after a restart: no process survives it.
    pub fn reset_after_restart(&mut self) {
        self.capturing = false;
        self.capture_started_at = None;
        self.is_live = false;
        self.media_locator = None;
        self.last_check = None;
        self.status = if self.monitor_enabled {
            WatchStatus::Monitoring
        } else if self.status == WatchStatus::Unsupported {
            WatchStatus::Unsupported
        } else {
            WatchStatus::Stopped
        };
    }
}

//! Scheduled check windows.

use chrono::{NaiveTime, TimeDelta, Timelike};
use serde::{Deserialize, Serialize};

/// A daily time window in which checks are allowed to run.
///
/// The window may wrap past midnight, e.g. `22:00` for 5 hours ends at `03:00`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduledWindow {
    pub start: NaiveTime,
    #[serde(default = "default_duration_hours")]
    pub duration_hours: f64,
}

fn default_duration_hours() -> f64 {
    5.0
}

impl ScheduledWindow {
    pub fn new(start: NaiveTime, duration_hours: f64) -> Self {
        Self {
            start,
            duration_hours,
        }
    }

    /// End of the window as a wall-clock time.
    pub fn end(&self) -> NaiveTime {
        let minutes = (self.duration_hours * 60.0).round() as i64;
        let (end, _) = self
            .start
            .overflowing_add_signed(TimeDelta::minutes(minutes));
        end
    }

    /// Whether `now` falls inside the window (both ends inclusive).
    pub fn contains(&self, now: NaiveTime) -> bool {
        if self.duration_hours >= 24.0 {
            return true;
        }
        if self.duration_hours <= 0.0 {
            return false;
        }

        let now = now.with_nanosecond(0).unwrap_or(now);
        let end = self.end();
        if self.start <= end {
            self.start <= now && now <= end
        } else {
            now >= self.start || now <= end
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_same_day_window() {
        let window = ScheduledWindow::new(t(18, 0), 5.0);
        assert_eq!(window.end(), t(23, 0));
        assert!(window.contains(t(18, 0)));
        assert!(window.contains(t(20, 30)));
        assert!(window.contains(t(23, 0)));
        assert!(!window.contains(t(23, 1)));
        assert!(!window.contains(t(9, 0)));
    }

    #[test]
    fn test_window_wraps_midnight() {
        let window = ScheduledWindow::new(t(22, 0), 5.0);
        assert_eq!(window.end(), t(3, 0));
        assert!(window.contains(t(23, 59)));
        assert!(window.contains(t(0, 30)));
        assert!(window.contains(t(3, 0)));
        assert!(!window.contains(t(12, 0)));
        assert!(!window.contains(t(21, 59)));
    }

    #[test]
    fn test_full_day_window() {
        let window = ScheduledWindow::new(t(8, 0), 24.0);
        assert!(window.contains(t(7, 59)));
    }

    #[test]
    fn test_deserialize_default_duration() {
        let window: ScheduledWindow = serde_json::from_str(r#"{"start":"20:00:00"}"#).unwrap();
        assert_eq!(window.duration_hours, 5.0);
        assert_eq!(window.start, t(20, 0));
    }
}

//! Per-entry watch state machine.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Status of a watch entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchStatus {
    /// Monitoring is disabled.
    #[default]
    Stopped,
    /// Idle, waiting for the next check.
    Monitoring,
    /// A liveness query is in flight.
    Checking,
    /// The stream is offline.
    OfflineWait,
    /// Live and about to spawn a capture process.
    PreparingCapture,
    /// Live but not capturing (manual mode, notify-only, or capture ended).
    NotifyOnly,
    /// A capture process is running.
    Capturing,
    /// The last liveness query failed. Retried on the next cycle.
    CheckError,
    /// Outside the configured scheduled window.
    NotInScheduledWindow,
    /// Free disk space is below the threshold.
    AdmissionDenied,
    /// The capture process exited with an unexpected code.
    CaptureError,
    /// The URL cannot be resolved by any handler.
    Unsupported,
}

impl WatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Monitoring => "MONITORING",
            Self::Checking => "CHECKING",
            Self::OfflineWait => "OFFLINE_WAIT",
            Self::PreparingCapture => "PREPARING_CAPTURE",
            Self::NotifyOnly => "NOTIFY_ONLY",
            Self::Capturing => "CAPTURING",
            Self::CheckError => "CHECK_ERROR",
            Self::NotInScheduledWindow => "NOT_IN_SCHEDULED_WINDOW",
            Self::AdmissionDenied => "ADMISSION_DENIED",
            Self::CaptureError => "CAPTURE_ERROR",
            Self::Unsupported => "UNSUPPORTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STOPPED" => Some(Self::Stopped),
            "MONITORING" => Some(Self::Monitoring),
            "CHECKING" => Some(Self::Checking),
            "OFFLINE_WAIT" => Some(Self::OfflineWait),
            "PREPARING_CAPTURE" => Some(Self::PreparingCapture),
            "NOTIFY_ONLY" => Some(Self::NotifyOnly),
            "CAPTURING" => Some(Self::Capturing),
            "CHECK_ERROR" => Some(Self::CheckError),
            "NOT_IN_SCHEDULED_WINDOW" => Some(Self::NotInScheduledWindow),
            "ADMISSION_DENIED" => Some(Self::AdmissionDenied),
            "CAPTURE_ERROR" => Some(Self::CaptureError),
            "UNSUPPORTED" => Some(Self::Unsupported),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::CheckError | Self::CaptureError | Self::Unsupported)
    }

    /// States in which the entry waits for its next detect cycle.
    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            Self::Monitoring
                | Self::OfflineWait
                | Self::NotifyOnly
                | Self::CheckError
                | Self::NotInScheduledWindow
                | Self::AdmissionDenied
                | Self::CaptureError
        )
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: WatchStatus) -> bool {
        use WatchStatus::*;

        if *self == target || target == Stopped {
            return true;
        }

        match self {
            Stopped | Unsupported => matches!(target, Monitoring),
            s if s.is_idle() => matches!(target, Checking | NotInScheduledWindow | Monitoring),
            Checking => matches!(
                target,
                Monitoring
                    | OfflineWait
                    | NotifyOnly
                    | PreparingCapture
                    | CheckError
                    | AdmissionDenied
                    | Unsupported
                    | NotInScheduledWindow
            ),
            PreparingCapture => matches!(target, Capturing | CaptureError | AdmissionDenied),
            Capturing => matches!(
                target,
                Monitoring | OfflineWait | NotifyOnly | CaptureError | AdmissionDenied
            ),
            _ => false,
        }
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: WatchStatus) -> Result<WatchStatus, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for WatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_str() {
        for status in [
            WatchStatus::Stopped,
            WatchStatus::NotInScheduledWindow,
            WatchStatus::AdmissionDenied,
            WatchStatus::Capturing,
        ] {
            assert_eq!(WatchStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(WatchStatus::parse("LIVE"), None);
    }

    #[test]
    fn test_serde_matches_as_str() {
        let json = serde_json::to_string(&WatchStatus::OfflineWait).unwrap();
        assert_eq!(json, "\"OFFLINE_WAIT\"");
    }

    #[test]
    fn test_detect_cycle_transitions() {
        use WatchStatus::*;
        assert!(Monitoring.can_transition_to(Checking));
        assert!(Checking.can_transition_to(PreparingCapture));
        assert!(PreparingCapture.can_transition_to(Capturing));
        assert!(Capturing.can_transition_to(NotifyOnly));
        assert!(NotifyOnly.can_transition_to(Checking));
        assert!(CheckError.can_transition_to(Checking));
    }

    #[test]
    fn test_invalid_transitions() {
        use WatchStatus::*;
        assert!(!Stopped.can_transition_to(Checking));
        assert!(!Monitoring.can_transition_to(Capturing));
        assert!(!Unsupported.can_transition_to(Checking));
        assert!(!Capturing.can_transition_to(Checking));
    }

    #[test]
    fn test_stop_always_allowed() {
        use WatchStatus::*;
        for status in [Monitoring, Checking, PreparingCapture, Capturing, CaptureError] {
            assert_eq!(status.transition_to(Stopped).unwrap(), Stopped);
        }
    }

    #[test]
    fn test_transition_to_error() {
        let err = WatchStatus::Stopped.transition_to(WatchStatus::Capturing).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert!(err.to_string().contains("STOPPED"));
    }
}

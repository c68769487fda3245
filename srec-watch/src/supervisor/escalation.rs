//! Escalating stop sequence for a supervised process.
//!
//! graceful quit → terminate → kill → kill the whole tree by PID.
//! Each stage is best-effort; a stage that cannot be applied (no stdin,
//! no PID) is skipped without waiting.

use std::time::Duration;

use tracing::debug;

use super::ProcessHandle;
use crate::config::StopGraceConfig;

/// How long to wait after each stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopTimeouts {
    pub quit: Duration,
    pub terminate: Duration,
    pub kill: Duration,
}

impl Default for StopTimeouts {
    fn default() -> Self {
        (&StopGraceConfig::default()).into()
    }
}

impl From<&StopGraceConfig> for StopTimeouts {
    fn from(config: &StopGraceConfig) -> Self {
        Self {
            quit: Duration::from_secs(config.quit_secs),
            terminate: Duration::from_secs(config.terminate_secs),
            kill: Duration::from_secs(config.kill_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStage {
    GracefulQuit,
    Terminate,
    Kill,
    KillTree,
}

impl StopStage {
    pub fn first() -> Self {
        Self::GracefulQuit
    }

    pub fn next(self) -> Option<Self> {
        match self {
            Self::GracefulQuit => Some(Self::Terminate),
            Self::Terminate => Some(Self::Kill),
            Self::Kill => Some(Self::KillTree),
            Self::KillTree => None,
        }
    }

    pub fn timeout(self, timeouts: &StopTimeouts) -> Duration {
        match self {
            Self::GracefulQuit => timeouts.quit,
            Self::Terminate => timeouts.terminate,
            Self::Kill | Self::KillTree => timeouts.kill,
        }
    }

    /// Apply this stage. Returns `false` if it could not be applied.
    pub async fn apply(self, handle: &ProcessHandle) -> bool {
        let applied = match self {
            Self::GracefulQuit => handle.send_quit().await,
            Self::Terminate => match handle.pid() {
                Some(pid) => tokio::task::spawn_blocking(move || process_utils::terminate(pid))
                    .await
                    .unwrap_or(false),
                None => false,
            },
            Self::Kill => handle.request_kill(),
            Self::KillTree => match handle.pid() {
                Some(pid) => {
                    let killed = tokio::task::spawn_blocking(move || process_utils::kill_tree(pid))
                        .await
                        .unwrap_or(0);
                    killed > 0
                }
                None => false,
            },
        };
        debug!(pid = ?handle.pid(), stage = ?self, applied, "Stop stage");
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        let mut stages = vec![StopStage::first()];
        while let Some(next) = stages.last().and_then(|s| s.next()) {
            stages.push(next);
        }
        assert_eq!(
            stages,
            [
                StopStage::GracefulQuit,
                StopStage::Terminate,
                StopStage::Kill,
                StopStage::KillTree
            ]
        );
    }

    #[test]
    fn test_default_timeouts() {
        let t = StopTimeouts::default();
        assert_eq!(StopStage::GracefulQuit.timeout(&t), Duration::from_secs(2));
        assert_eq!(StopStage::Terminate.timeout(&t), Duration::from_secs(5));
        assert_eq!(StopStage::Kill.timeout(&t), Duration::from_secs(3));
    }
}

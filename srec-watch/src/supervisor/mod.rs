//! Capture process supervision.
//!
//! The [`ProcessSupervisor`] owns every capture subprocess: it spawns them,
//! stops them through an escalating sequence, and periodically prunes
//! entries whose PID has vanished at the OS level. Each process is removed
//! from the registry by its waiter task once the exit is confirmed.
//!
//! The [`DrainWorker`] is a separate OS thread with its own runtime for
//! deferred work (post-capture conversion) that must be able to finish
//! after the main scheduler shuts down.

mod drain;
mod escalation;
mod process;

pub use drain::DrainWorker;
pub use escalation::{StopStage, StopTimeouts};
pub use process::{ExitOutcome, ManagedProcess, NORMAL_EXIT_CODES, ProcessHandle};

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use process_utils::tokio_command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::CaptureCommand;
use crate::{Error, Result};

type Registry = Arc<Mutex<HashMap<u64, ProcessHandle>>>;

/// Snapshot of one running process.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub id: u64,
    pub pid: Option<u32>,
    pub owner: String,
    pub running_for: Duration,
    pub formatted: String,
}

/// Result of a [`ProcessSupervisor::poll_all`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollReport {
    pub alive: usize,
    pub pruned: usize,
}

/// Registry and lifecycle manager for capture subprocesses.
pub struct ProcessSupervisor {
    registry: Registry,
    next_id: AtomicU64,
    timeouts: StopTimeouts,
}

impl ProcessSupervisor {
    pub fn new(timeouts: StopTimeouts) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            timeouts,
        }
    }

    /// Spawn `command` on behalf of entry `owner` and register it.
    ///
    /// stdin is piped for the graceful quit byte; stderr is drained to the log.
    pub fn spawn(&self, owner: &str, command: &CaptureCommand) -> Result<ProcessHandle> {
        let child = tokio_command(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::process(format!("failed to spawn {}: {e}", command.program)))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = process::launch(id, owner.to_string(), child, self.registry.clone());
        info!(entry_id = %owner, id, pid = ?handle.pid(), program = %command.program, "Spawned capture process");
        Ok(handle)
    }

    /// Stop one process. A process that already exited is a successful no-op.
    pub async fn stop(&self, handle: &ProcessHandle) -> Result<()> {
        if handle.has_exited() {
            return Ok(());
        }
        handle.mark_stop_requested();

        let mut stage = Some(StopStage::first());
        while let Some(current) = stage {
            if current.apply(handle).await
                && handle.wait_timeout(current.timeout(&self.timeouts)).await
            {
                info!(
                    entry_id = %handle.owner(),
                    pid = ?handle.pid(),
                    stage = ?current,
                    "Capture process stopped"
                );
                return Ok(());
            }
            if handle.has_exited() {
                return Ok(());
            }
            stage = current.next();
        }

        Err(Error::process(format!(
            "process {:?} for entry {} did not exit",
            handle.pid(),
            handle.owner()
        )))
    }

    /// Send the graceful quit byte to every registered process without waiting.
    ///
    /// Returns the handles that were asked to quit.
    pub async fn request_quit_all(&self) -> Vec<ProcessHandle> {
        let handles: Vec<ProcessHandle> = self.registry.lock().values().cloned().collect();
        for handle in &handles {
            handle.mark_stop_requested();
            if !handle.send_quit().await {
                debug!(entry_id = %handle.owner(), "No stdin for graceful quit");
            }
        }
        handles
    }

    /// Stop every registered process concurrently and clear the registry.
    pub async fn stop_all(&self) {
        let handles: Vec<ProcessHandle> = self.registry.lock().values().cloned().collect();
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "Stopping all capture processes");

        let results = futures::future::join_all(handles.iter().map(|h| self.stop(h))).await;
        for (handle, result) in handles.iter().zip(results) {
            if let Err(e) = result {
                error!(entry_id = %handle.owner(), error = %e, "Failed to stop capture process");
            }
        }

        let mut registry = self.registry.lock();
        if !registry.is_empty() {
            warn!(leftover = registry.len(), "Dropping unresponsive processes from registry");
            registry.clear();
        }
    }

    /// Confirm every registered process still exists; prune those that do not.
    pub async fn poll_all(&self) -> PollReport {
        let handles: Vec<ProcessHandle> = self.registry.lock().values().cloned().collect();
        let pids: Vec<Option<u32>> = handles.iter().map(|h| h.pid()).collect();

        let exists = tokio::task::spawn_blocking(move || {
            pids.into_iter()
                .map(|pid| pid.is_some_and(process_utils::pid_exists))
                .collect::<Vec<_>>()
        })
        .await
        .unwrap_or_default();

        let mut report = PollReport::default();
        for (handle, alive) in handles.iter().zip(exists) {
            if alive || handle.has_exited() {
                report.alive += usize::from(alive);
                continue;
            }
            if self.registry.lock().remove(&handle.id()).is_some() {
                warn!(entry_id = %handle.owner(), pid = ?handle.pid(), "Pruned vanished capture process");
                report.pruned += 1;
            }
        }
        report
    }

    /// Run [`poll_all`](Self::poll_all) every `interval` until cancelled.
    pub fn spawn_watcher(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Process watcher shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = supervisor.poll_all().await;
                        if report.pruned > 0 {
                            info!(alive = report.alive, pruned = report.pruned, "Process poll");
                        }
                    }
                }
            }
        })
    }

    pub fn get(&self, id: u64) -> Option<ProcessHandle> {
        self.registry.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.lock().is_empty()
    }

    pub fn running_processes(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<ProcessInfo> = self
            .registry
            .lock()
            .values()
            .map(|h| {
                let running_for = h.running_for();
                ProcessInfo {
                    id: h.id(),
                    pid: h.pid(),
                    owner: h.owner().to_string(),
                    running_for,
                    formatted: format!(
                        "PID {} ({}) running {}",
                        h.pid().map_or_else(|| "?".to_string(), |p| p.to_string()),
                        h.owner(),
                        format_duration(running_for)
                    ),
                }
            })
            .collect();
        infos.sort_by_key(|i| i.id);
        infos
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}h {:02}m {:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn fast() -> StopTimeouts {
        StopTimeouts {
            quit: Duration::from_millis(500),
            terminate: Duration::from_secs(2),
            kill: Duration::from_secs(2),
        }
    }

    fn sh(script: &str) -> CaptureCommand {
        CaptureCommand::new("sh", ["-c", script])
    }

    #[tokio::test]
    async fn test_exit_code_reported_and_deregistered() {
        let supervisor = ProcessSupervisor::new(fast());
        let handle = supervisor.spawn("e1", &sh("exit 3")).unwrap();
        let outcome = handle.wait().await;
        assert_eq!(outcome.code, Some(3));
        assert!(!outcome.is_normal());
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn test_normal_exit_codes() {
        let supervisor = ProcessSupervisor::new(fast());
        for (script, code) in [("exit 0", 0), ("exit 255", 255)] {
            let outcome = supervisor.spawn("e1", &sh(script)).unwrap().wait().await;
            assert_eq!(outcome.code, Some(code));
            assert!(outcome.is_normal());
        }
    }

    #[tokio::test]
    async fn test_stop_exited_is_noop() {
        let supervisor = ProcessSupervisor::new(fast());
        let handle = supervisor.spawn("e1", &sh("exit 0")).unwrap();
        handle.wait().await;
        assert!(supervisor.stop(&handle).await.is_ok());
        assert!(!handle.stop_requested());
    }

    #[tokio::test]
    async fn test_graceful_quit_via_stdin() {
        let supervisor = ProcessSupervisor::new(fast());
        let handle = supervisor.spawn("e1", &sh("read -r line; exit 0")).unwrap();
        supervisor.stop(&handle).await.unwrap();
        let outcome = handle.exit_outcome().unwrap();
        assert_eq!(outcome.code, Some(0));
        assert!(outcome.stop_requested);
    }

    #[tokio::test]
    async fn test_terminate_when_quit_ignored() {
        let supervisor = ProcessSupervisor::new(fast());
        let handle = supervisor.spawn("e1", &CaptureCommand::new("sleep", ["30"])).unwrap();
        let pid = handle.pid().unwrap();
        supervisor.stop(&handle).await.unwrap();
        assert!(handle.has_exited());
        assert!(handle.exit_outcome().unwrap().is_normal());
        assert!(!process_utils::pid_exists(pid));
    }

    #[tokio::test]
    async fn test_stop_all_empties_registry() {
        let supervisor = ProcessSupervisor::new(fast());
        let handles: Vec<_> = (0..3)
            .map(|i| {
                supervisor
                    .spawn(&format!("e{i}"), &CaptureCommand::new("sleep", ["30"]))
                    .unwrap()
            })
            .collect();
        assert_eq!(supervisor.len(), 3);
        assert_eq!(supervisor.running_processes().len(), 3);

        supervisor.stop_all().await;
        assert!(supervisor.is_empty());
        for handle in handles {
            assert!(!process_utils::pid_exists(handle.pid().unwrap()));
        }
    }

    #[tokio::test]
    async fn test_poll_all_counts_alive() {
        let supervisor = ProcessSupervisor::new(fast());
        let handle = supervisor.spawn("e1", &CaptureCommand::new("sleep", ["30"])).unwrap();
        let report = supervisor.poll_all().await;
        assert_eq!(report, PollReport { alive: 1, pruned: 0 });
        supervisor.stop(&handle).await.unwrap();
        assert_eq!(supervisor.poll_all().await, PollReport::default());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let supervisor = ProcessSupervisor::new(fast());
        let err = supervisor
            .spawn("e1", &CaptureCommand::new("/nonexistent/capture-bin", ["x"]))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Process(_)));
        assert!(supervisor.is_empty());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 02m 03s");
    }
}

//! A supervised child process and its exit tracking.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::debug;

use super::Registry;

/// Exit codes treated as a normal end of capture.
pub const NORMAL_EXIT_CODES: [i32; 2] = [0, 255];

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitOutcome {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
    /// The supervisor was asked to stop it.
    pub stop_requested: bool,
}

impl ExitOutcome {
    /// A requested stop is always normal, whatever code it produced.
    pub fn is_normal(&self) -> bool {
        self.stop_requested || self.code.is_some_and(|c| NORMAL_EXIT_CODES.contains(&c))
    }
}

/// Shared handle to a supervised process.
pub type ProcessHandle = Arc<ManagedProcess>;

/// A child process registered with the supervisor.
pub struct ManagedProcess {
    id: u64,
    owner: String,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    started: Instant,
    stdin: Mutex<Option<ChildStdin>>,
    kill_tx: mpsc::UnboundedSender<()>,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
    stop_requested: AtomicBool,
}

impl ManagedProcess {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the watch entry that owns this process.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn running_for(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        *self.exit_tx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_outcome().is_some()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub(super) fn mark_stop_requested(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Wait until the process has exited and been removed from the registry.
    pub async fn wait(&self) -> ExitOutcome {
        let mut rx = self.exit_tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).unwrap_or_default(),
            Err(_) => self.exit_outcome().unwrap_or_default(),
        }
    }

    /// Wait up to `timeout`. Returns whether the process exited.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    /// Write the quit byte to stdin and close it. Returns `false` without stdin.
    pub(super) async fn send_quit(&self) -> bool {
        let Some(mut stdin) = self.stdin.lock().await.take() else {
            return false;
        };
        if let Err(e) = stdin.write_all(b"q").await {
            debug!(pid = ?self.pid, error = %e, "Quit byte not delivered");
            return false;
        }
        let _ = stdin.flush().await;
        true
    }

    /// Ask the waiter task to hard-kill the child through its own handle.
    pub(super) fn request_kill(&self) -> bool {
        self.kill_tx.send(()).is_ok()
    }
}

pub(super) fn launch(
    id: u64,
    owner: String,
    mut child: Child,
    registry: Registry,
) -> ProcessHandle {
    let (kill_tx, kill_rx) = mpsc::unbounded_channel();
    let (exit_tx, _) = watch::channel(None);

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_stderr(owner.clone(), stderr));
    }

    let handle = Arc::new(ManagedProcess {
        id,
        owner,
        pid: child.id(),
        started_at: Utc::now(),
        started: Instant::now(),
        stdin: Mutex::new(child.stdin.take()),
        kill_tx,
        exit_tx,
        stop_requested: AtomicBool::new(false),
    });

    registry.lock().insert(id, handle.clone());
    tokio::spawn(wait_for_exit(handle.clone(), child, kill_rx, registry));
    handle
}

/// Owns the child until it exits, then deregisters it and publishes the outcome.
async fn wait_for_exit(
    handle: ProcessHandle,
    mut child: Child,
    mut kill_rx: mpsc::UnboundedReceiver<()>,
    registry: Registry,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(()) = kill_rx.recv() => {
                if let Err(e) = child.start_kill() {
                    debug!(pid = ?handle.pid, error = %e, "Kill failed, process likely gone");
                }
            }
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            debug!(pid = ?handle.pid, error = %e, "Failed to wait for process");
            None
        }
    };

    registry.lock().remove(&handle.id);
    let outcome = ExitOutcome {
        code,
        stop_requested: handle.stop_requested(),
    };
    debug!(id = handle.id, pid = ?handle.pid, ?outcome, "Process exited");
    handle.exit_tx.send_replace(Some(outcome));
}

async fn drain_stderr(owner: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(entry_id = %owner, "{}", line);
    }
}

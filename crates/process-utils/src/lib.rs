//! Process helpers shared across the workspace.
//!
//! Besides the `CREATE_NO_WINDOW` command constructors, this crate is the
//! platform layer used by the capture supervisor when a child refuses to
//! exit: signalling by PID and tearing down a whole process tree. All of it
//! goes through `sysinfo` so the same calls work on POSIX and Windows.

use std::collections::HashSet;
use std::ffi::OsStr;

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

fn snapshot(pid: Option<u32>) -> System {
    let mut system = System::new();
    match pid {
        Some(pid) => {
            let pids = [Pid::from_u32(pid)];
            system.refresh_processes(ProcessesToUpdate::Some(&pids), true);
        }
        None => {
            system.refresh_processes(ProcessesToUpdate::All, true);
        }
    }
    system
}

/// Whether a process with this PID currently exists.
///
/// Zombies count as gone: they have exited and only wait to be reaped.
pub fn pid_exists(pid: u32) -> bool {
    let system = snapshot(Some(pid));
    system
        .process(Pid::from_u32(pid))
        .is_some_and(|p| p.status() != ProcessStatus::Zombie)
}

/// Ask a process to terminate.
///
/// Sends `SIGTERM` where the platform has it and falls back to a hard kill
/// elsewhere. Returns `false` when the process is already gone.
pub fn terminate(pid: u32) -> bool {
    let system = snapshot(Some(pid));
    let Some(process) = system.process(Pid::from_u32(pid)) else {
        return false;
    };
    match process.kill_with(Signal::Term) {
        Some(sent) => sent,
        None => process.kill(),
    }
}

/// Collect `root` and every descendant of it, children before parents.
fn descendants(system: &System, root: Pid) -> Vec<Pid> {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    let mut frontier = vec![root];

    while let Some(parent) = frontier.pop() {
        if !seen.insert(parent) {
            continue;
        }
        order.push(parent);
        for (pid, process) in system.processes() {
            if process.parent() == Some(parent) && !seen.contains(pid) {
                frontier.push(*pid);
            }
        }
    }

    order.reverse();
    order
}

/// Kill a process and all of its descendants by PID.
///
/// Children are killed first so they cannot be re-parented mid-walk.
/// Returns how many processes were signalled.
pub fn kill_tree(pid: u32) -> usize {
    let system = snapshot(None);
    let root = Pid::from_u32(pid);
    if system.process(root).is_none() {
        return 0;
    }

    descendants(&system, root)
        .into_iter()
        .filter_map(|pid| system.process(pid))
        .filter(|process| process.kill())
        .count()
}

#[cfg(all(test, unix, feature = "tokio"))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pid_exists_tracks_child() {
        let mut child = tokio_command("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        assert!(pid_exists(pid));

        assert!(terminate(pid));
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
        assert!(!pid_exists(pid));
    }

    #[tokio::test]
    async fn test_kill_tree_reaches_grandchildren() {
        let mut child = tokio_command("sh")
            .arg("-c")
            .arg("sleep 30 & wait")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(kill_tree(pid) >= 1);
        tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_kill_tree_missing_pid() {
        assert_eq!(kill_tree(u32::MAX - 1), 0);
        assert!(!terminate(u32::MAX - 1));
    }
}

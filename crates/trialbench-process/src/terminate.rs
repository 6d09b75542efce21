//! Process-tree inspection and termination primitives.

use std::collections::{HashMap, VecDeque};

use sysinfo::{Pid as SysPid, ProcessStatus, ProcessesToUpdate, System};
use tracing::debug;

use trialbench_core::metrics::METRICS;
use trialbench_core::Result;

/// All descendants of `root`, parents before their children.
pub fn descendants(root: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in system.processes() {
        // Linux threads show up as tasks of their process.
        if process.thread_kind().is_some() {
            continue;
        }
        if let Some(parent) = process.parent() {
            children
                .entry(parent.as_u32())
                .or_default()
                .push(pid.as_u32());
        }
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        for &child in children.get(&pid).into_iter().flatten() {
            if child != root && !found.contains(&child) {
                found.push(child);
                queue.push_back(child);
            }
        }
    }
    found
}

/// Whether `pid` names a live, non-zombie process.
pub fn is_alive(pid: u32) -> bool {
    let pid = SysPid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

/// Whether this platform can ask a process to exit before killing it.
pub fn supports_graceful() -> bool {
    cfg!(unix)
}

#[cfg(unix)]
fn send(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    use trialbench_core::BenchError;

    let raw = i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .ok_or_else(|| BenchError::ProcessControl {
            pid,
            reason: "not a signallable pid".to_string(),
        })?;
    METRICS.inc_processes_signalled();
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) => {
            debug!(pid, ?signal, "signal sent");
            Ok(())
        }
        Err(Errno::ESRCH) => {
            debug!(pid, ?signal, "process already gone");
            Ok(())
        }
        Err(e) => Err(BenchError::ProcessControl {
            pid,
            reason: format!("{signal:?}: {e}"),
        }),
    }
}

/// Ask `pid` to exit (SIGTERM).
#[cfg(unix)]
pub fn terminate(pid: u32) -> Result<()> {
    send(pid, nix::sys::signal::Signal::SIGTERM)
}

/// Kill `pid` outright (SIGKILL).
#[cfg(unix)]
pub fn kill(pid: u32) -> Result<()> {
    send(pid, nix::sys::signal::Signal::SIGKILL)
}

/// No graceful termination on Windows; same as [`kill`].
#[cfg(windows)]
pub fn terminate(pid: u32) -> Result<()> {
    kill(pid)
}

/// Kill `pid` and its whole tree with `taskkill /F /T`.
#[cfg(windows)]
pub fn kill(pid: u32) -> Result<()> {
    use trialbench_core::BenchError;

    METRICS.inc_processes_signalled();
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F", "/T"])
        .status()
        .map_err(|source| BenchError::Spawn {
            command: "taskkill".to_string(),
            source,
        })?;
    debug!(pid, ?status, "taskkill finished");
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_signalling_missing_pid_is_ok() {
        // Far above any default pid_max.
        assert!(terminate(999_999_999).is_ok());
        assert!(kill(999_999_999).is_ok());
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[tokio::test]
    async fn test_descendants_of_shell() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "sleep 30 & wait"])
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        let found = descendants(pid);
        assert_eq!(found.len(), 1, "expected the sleep child, got {found:?}");

        for p in found {
            kill(p).unwrap();
        }
        kill(pid).unwrap();
        child.wait().await.unwrap();
        assert!(!is_alive(pid));
    }
}

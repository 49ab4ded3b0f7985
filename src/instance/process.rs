//! Spawning server processes and delivering signals to them.

use crate::error::{validate_pid, validate_pid_for_check, validate_pid_start_time, Error, Result};
use chrono::{DateTime, Utc};
use nix::sys::signal::{self, killpg, Signal};
use nix::unistd::Pid;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Launch `<binary> --config <config_path>` in its own process group.
///
/// stdout and stderr are appended to `log_path`. The child is not killed when
/// its handle is dropped; teardown is explicit.
pub(crate) fn spawn(binary: &Path, config_path: &Path, kind: &str, log_path: &Path) -> Result<Child> {
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| {
            Error::Filesystem(format!(
                "Failed to open log file '{}': {}",
                log_path.display(),
                e
            ))
        })?;
    let log_err = log.try_clone()?;

    let mut cmd = Command::new(binary);
    cmd.arg("--config")
        .arg(config_path)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .kill_on_drop(false)
        .process_group(0);

    cmd.spawn().map_err(|e| {
        tracing::error!("Failed to spawn {} ({}): {}", kind, binary.display(), e);
        Error::Launch {
            kind: kind.to_string(),
            reason: format!("{}: {}", binary.display(), e),
        }
    })
}

/// Signal the process group led by `pid`, falling back to the single process.
fn signal_group(pid: Pid, sig: Signal) -> nix::Result<()> {
    killpg(pid, sig).or_else(|_| signal::kill(pid, sig))
}

/// True if `pid` names a live, non-zombie process.
pub(crate) fn is_pid_alive(pid: u32) -> bool {
    let Some(nix_pid) = validate_pid_for_check(pid) else {
        return false;
    };
    signal::kill(nix_pid, None).is_ok() && !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            // State follows the parenthesised command name, which may contain spaces
            let after_comm = stat.rfind(')')?;
            stat[after_comm + 1..].split_whitespace().next().map(|s| s == "Z")
        })
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Get the process group ID for `pid`.
pub(crate) fn get_process_group(pid: u32) -> Option<Pid> {
    let nix_pid = validate_pid_for_check(pid)?;
    match nix::unistd::getpgid(Some(nix_pid)) {
        Ok(pgid) if pgid.as_raw() > 0 => Some(pgid),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(
                "Failed to get PGID for PID {}: {} (process may have exited)",
                pid,
                e
            );
            None
        }
    }
}

/// SIGTERM the child's process group, wait up to `grace`, then SIGKILL.
pub(crate) async fn terminate_child(child: &mut Child, owner: &str, grace: Duration) -> Result<()> {
    if let Ok(Some(status)) = child.try_wait() {
        tracing::debug!("{} had already exited ({})", owner, status);
        return Ok(());
    }
    let Some(raw_pid) = child.id() else {
        return Ok(());
    };
    let pid = validate_pid(raw_pid, owner)?;

    if let Err(e) = signal_group(pid, Signal::SIGTERM) {
        tracing::warn!("Failed to send SIGTERM to {} (pid {}): {}", owner, raw_pid, e);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!("{} exited gracefully ({})", owner, status);
        }
        Ok(Err(e)) => {
            tracing::warn!("Error waiting for {}: {}", owner, e);
            force_kill_child(child, pid, owner).await;
        }
        Err(_) => {
            tracing::warn!(
                "{} did not exit after SIGTERM (grace period: {:?}), sending SIGKILL",
                owner,
                grace
            );
            force_kill_child(child, pid, owner).await;
        }
    }
    Ok(())
}

async fn force_kill_child(child: &mut Child, pid: Pid, owner: &str) {
    let _ = signal_group(pid, Signal::SIGKILL);
    if tokio::time::timeout(REAP_TIMEOUT, child.wait()).await.is_err() {
        tracing::warn!("{} was not reaped after SIGKILL", owner);
    }
}

/// Stop a server known only by pid, e.g. one restored from the state store.
pub(crate) async fn terminate_detached(
    pid_val: u32,
    owner: &str,
    grace: Duration,
    started_at: Option<DateTime<Utc>>,
) -> Result<()> {
    let pid = validate_pid(pid_val, owner)?;
    if !is_pid_alive(pid_val) {
        tracing::debug!("{} (pid {}) is no longer running", owner, pid_val);
        return Ok(());
    }

    if let Some(expected_start) = started_at {
        if !validate_pid_start_time(pid_val, expected_start) {
            tracing::warn!(
                "PID {} for '{}' was reused by another process, skipping kill",
                pid_val,
                owner
            );
            return Ok(());
        }
    }

    // Never signal our own group: the server would normally lead its own.
    let own_group = nix::unistd::getpgrp();
    let pgid = get_process_group(pid_val)
        .filter(|pgid| *pgid != own_group)
        .unwrap_or(pid);

    let sent = if pgid == pid {
        signal_group(pid, Signal::SIGTERM)
    } else {
        killpg(pgid, Signal::SIGTERM).or_else(|_| signal::kill(pid, Signal::SIGTERM))
    };
    if let Err(e) = sent {
        tracing::warn!("Failed to send SIGTERM to PID {} ({}): {}", pid_val, owner, e);
        return Ok(());
    }

    let polls = (grace.as_millis() / EXIT_POLL_INTERVAL.as_millis()).max(1);
    for _ in 0..polls {
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        if !is_pid_alive(pid_val) {
            return Ok(());
        }
    }

    tracing::warn!(
        "{} did not exit after SIGTERM (grace period: {:?}), sending SIGKILL",
        owner,
        grace
    );
    let _ = killpg(pgid, Signal::SIGKILL).or_else(|_| signal::kill(pid, Signal::SIGKILL));
    tokio::time::sleep(Duration::from_millis(500)).await;
    Ok(())
}

/// Last `lines` lines of a server log, for startup failure reports.
pub(crate) fn read_log_tail(path: &Path, lines: usize) -> Vec<String> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].iter().map(|l| l.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(is_pid_alive(std::process::id()));
        assert!(get_process_group(std::process::id()).is_some());
    }

    #[test]
    fn invalid_pids_are_not_alive() {
        assert!(!is_pid_alive(0));
        assert!(!is_pid_alive(i32::MAX as u32 + 1));
        assert!(get_process_group(0).is_none());
    }

    #[test]
    fn log_tail_returns_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        std::fs::write(&path, "a\nb\nc\nd\n").unwrap();
        assert_eq!(read_log_tail(&path, 2), vec!["c", "d"]);
        assert!(read_log_tail(&dir.path().join("missing"), 5).is_empty());
    }

    #[tokio::test]
    async fn terminate_child_stops_sleeping_process() {
        let sleep_bin = which::which("sleep").unwrap();
        let mut child = Command::new(sleep_bin)
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        terminate_child(&mut child, "sleep", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!is_pid_alive(pid));
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn spawn_missing_binary_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = spawn(
            &dir.path().join("nope"),
            &dir.path().join("server.conf"),
            "nope",
            &dir.path().join("server.log"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Launch { .. }));
    }
}

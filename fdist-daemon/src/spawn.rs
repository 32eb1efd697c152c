// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! Spawning and reaping of managed subprocesses.
//!
//! Workers are re-executions of this binary with a `worker` subcommand;
//! the supervisor reaps them with `waitpid(WNOHANG)` and classifies the
//! exit so the main loop can decide between restart and stay-down.

use fdist_common::exit_code;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::path::Path;
use tracing::{error, info, warn};

/// Why a child left, as the supervisor classifies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// Ordinary end of process.
    Normal,
    /// Stopped on user request; leave it alone.
    UserStop,
    /// Wants to be restarted (SIGHUP or stale shared memory).
    WantsRestart,
    /// Anything else, signal deaths included.
    Died,
}

pub fn classify(status: WaitStatus) -> Option<(Pid, ExitClass)> {
    match status {
        WaitStatus::Exited(pid, code) => {
            let class = match code {
                exit_code::SUCCESS => ExitClass::Normal,
                exit_code::USER_STOP => ExitClass::UserStop,
                exit_code::RESTART_SIGHUP | exit_code::RESTART_STALE_SHM => {
                    ExitClass::WantsRestart
                }
                _ => ExitClass::Died,
            };
            Some((pid, class))
        }
        WaitStatus::Signaled(pid, signal, _) => {
            error!("abnormal termination of pid {pid}, caused by signal {signal}");
            Some((pid, ExitClass::Died))
        }
        _ => None,
    }
}

/// Start one worker process. The child inherits stderr so its tracing
/// output lands where the operator pointed ours.
pub fn make_process(worker: &str, work_dir: &Path) -> std::io::Result<i32> {
    let exe = std::env::current_exe()?;
    let child = std::process::Command::new(exe)
        .arg("worker")
        .arg(worker)
        .arg("-w")
        .arg(work_dir)
        .spawn()?;
    info!("started {worker}, pid {}", child.id());
    Ok(child.id() as i32)
}

/// One non-blocking reap pass. Returns every child that changed state.
pub fn reap_children() -> Vec<(Pid, ExitClass)> {
    let mut reaped = Vec::new();
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if let Some(entry) = classify(status) {
                    reaped.push(entry);
                }
            }
            Err(nix::Error::ECHILD) => break,
            Err(err) => {
                warn!("waitpid() error: {err}");
                break;
            }
        }
    }
    reaped
}

/// Best-effort termination signal to one pid.
pub fn send_term(pid: i32) {
    if pid <= 0 {
        return;
    }
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        if err != nix::Error::ESRCH {
            warn!("failed to signal pid {pid}: {err}");
        }
    }
}

/// Last resort for a child that ignored the graceful path.
pub fn send_kill(pid: i32) {
    if pid <= 0 {
        return;
    }
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
        if err != nix::Error::ESRCH {
            warn!("failed to kill pid {pid}: {err}");
        }
    }
}

/// Preserve a core file the dying worker may have left, up to the
/// configured budget.
pub fn save_core_file(work_dir: &Path, worker: &str, saved_so_far: &mut u32, budget: u32) {
    if *saved_so_far >= budget {
        return;
    }
    let core = work_dir.join("core");
    if core.exists() {
        let target = work_dir.join(format!(
            "core.{worker}.{}.{saved_so_far}",
            chrono::Utc::now().timestamp()
        ));
        match std::fs::rename(&core, &target) {
            Ok(()) => *saved_so_far += 1,
            Err(err) => warn!("failed to set aside core file: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_exit_codes() {
        let pid = Pid::from_raw(123);
        assert_eq!(
            classify(WaitStatus::Exited(pid, 0)),
            Some((pid, ExitClass::Normal))
        );
        assert_eq!(
            classify(WaitStatus::Exited(pid, 1)),
            Some((pid, ExitClass::UserStop))
        );
        assert_eq!(
            classify(WaitStatus::Exited(pid, 2)),
            Some((pid, ExitClass::WantsRestart))
        );
        assert_eq!(
            classify(WaitStatus::Exited(pid, 3)),
            Some((pid, ExitClass::WantsRestart))
        );
        assert_eq!(
            classify(WaitStatus::Exited(pid, 7)),
            Some((pid, ExitClass::Died))
        );
        assert_eq!(
            classify(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some((pid, ExitClass::Died))
        );
        assert_eq!(classify(WaitStatus::StillAlive), None);
    }

    #[test]
    fn test_reap_children_with_no_children() {
        // The test binary has no children; the pass is a clean no-op.
        assert!(reap_children().is_empty());
    }

    #[test]
    fn test_save_core_respects_budget() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("core"), b"dump").unwrap();
        let mut saved = 0;
        save_core_file(dir.path(), "amg", &mut saved, 1);
        assert_eq!(saved, 1);
        assert!(!dir.path().join("core").exists());

        // Over budget: a second core stays where it is.
        std::fs::write(dir.path().join("core"), b"dump").unwrap();
        save_core_file(dir.path(), "amg", &mut saved, 1);
        assert_eq!(saved, 1);
        assert!(dir.path().join("core").exists());
    }
}

// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! The active-marker file `fifo/AFD_ACTIVE`.
//!
//! Layout, in order: the daemon pid, one pid slot per managed subprocess,
//! a heartbeat counter and a shutdown-request byte. The file is the
//! exclusion mechanism against a second daemon in the same working
//! directory: `claim` only succeeds over an existing file whose heartbeat
//! stopped advancing.

use crate::records::NO_OF_PROCESS;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const PID_SLOT_LEN: u64 = 8;
const DAEMON_PID_OFFSET: u64 = 0;
const PID_TABLE_OFFSET: u64 = PID_SLOT_LEN;
const HEARTBEAT_OFFSET: u64 = PID_TABLE_OFFSET + NO_OF_PROCESS as u64 * PID_SLOT_LEN;
const SHUTDOWN_OFFSET: u64 = HEARTBEAT_OFFSET + 8;
const FILE_LEN: u64 = SHUTDOWN_OFFSET + 1;

/// How often the heartbeat of a prior daemon is sampled during `claim`.
const HEARTBEAT_PROBE_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("another daemon is active in this working directory")]
    AlreadyRunning,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The claimed active marker. Dropping it unlinks the file.
#[derive(Debug)]
pub struct ActiveFile {
    file: File,
    path: PathBuf,
}

impl ActiveFile {
    /// Take ownership of the marker for this working directory.
    ///
    /// If a marker already exists, its heartbeat is watched for up to
    /// `heartbeat_timeout`; any advance means a live daemon and the claim
    /// fails with `AlreadyRunning`. A silent heartbeat means the previous
    /// daemon died without cleaning up, and the file is recycled.
    pub fn claim(path: &Path, heartbeat_timeout: Duration) -> Result<ActiveFile, ClaimError> {
        match File::options().read(true).write(true).open(path) {
            Ok(existing) => {
                if heartbeat_advances(&existing, heartbeat_timeout)? {
                    return Err(ClaimError::AlreadyRunning);
                }
                tracing::warn!(
                    "stale active marker at {}, previous daemon did not clean up",
                    path.display()
                );
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(FILE_LEN)?;
        let active = ActiveFile {
            file,
            path: path.to_path_buf(),
        };
        active.write_u64(DAEMON_PID_OFFSET, std::process::id() as u64)?;
        Ok(active)
    }

    pub fn daemon_pid(&self) -> io::Result<u32> {
        Ok(self.read_u64(DAEMON_PID_OFFSET)? as u32)
    }

    pub fn record_pid(&self, slot: usize, pid: i32) -> io::Result<()> {
        debug_assert!(slot < NO_OF_PROCESS);
        self.write_u64(PID_TABLE_OFFSET + slot as u64 * PID_SLOT_LEN, pid as u64)
    }

    pub fn clear_pid(&self, slot: usize) -> io::Result<()> {
        self.record_pid(slot, 0)
    }

    pub fn pid(&self, slot: usize) -> io::Result<i32> {
        debug_assert!(slot < NO_OF_PROCESS);
        Ok(self.read_u64(PID_TABLE_OFFSET + slot as u64 * PID_SLOT_LEN)? as i32)
    }

    /// Every pid currently recorded, the daemon's own first.
    pub fn list_live_pids(&self) -> io::Result<Vec<i32>> {
        let mut pids = Vec::with_capacity(NO_OF_PROCESS + 1);
        let own = self.read_u64(DAEMON_PID_OFFSET)? as i32;
        if own > 0 {
            pids.push(own);
        }
        for slot in 0..NO_OF_PROCESS {
            let pid = self.pid(slot)?;
            if pid > 0 {
                pids.push(pid);
            }
        }
        Ok(pids)
    }

    pub fn heartbeat(&self) -> io::Result<u64> {
        self.read_u64(HEARTBEAT_OFFSET)
    }

    /// Strictly increase the heartbeat counter.
    pub fn tick(&self) -> io::Result<u64> {
        let next = self.read_u64(HEARTBEAT_OFFSET)?.wrapping_add(1);
        self.write_u64(HEARTBEAT_OFFSET, next)?;
        Ok(next)
    }

    pub fn request_shutdown(&self) -> io::Result<()> {
        self.file.write_all_at(&[1], SHUTDOWN_OFFSET)
    }

    pub fn shutdown_requested(&self) -> io::Result<bool> {
        let mut buf = [0u8; 1];
        self.file.read_exact_at(&mut buf, SHUTDOWN_OFFSET)?;
        Ok(buf[0] != 0)
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn read_u64(&self, offset: u64) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(u64::from_ne_bytes(buf))
    }

    fn write_u64(&self, offset: u64, value: u64) -> io::Result<()> {
        self.file.write_all_at(&value.to_ne_bytes(), offset)
    }
}

impl Drop for ActiveFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!("failed to unlink {}: {err}", self.path.display());
            }
        }
    }
}

/// Watch an existing marker's heartbeat for up to `timeout`.
fn heartbeat_advances(file: &File, timeout: Duration) -> io::Result<bool> {
    let read_heartbeat = || -> io::Result<Option<u64>> {
        let mut buf = [0u8; 8];
        match file.read_exact_at(&mut buf, HEARTBEAT_OFFSET) {
            Ok(()) => Ok(Some(u64::from_ne_bytes(buf))),
            // A truncated marker cannot belong to a live daemon.
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(err),
        }
    };
    let Some(initial) = read_heartbeat()? else {
        return Ok(false);
    };
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        std::thread::sleep(HEARTBEAT_PROBE_INTERVAL.min(timeout));
        match read_heartbeat()? {
            Some(current) if current != initial => return Ok(true),
            Some(_) => {}
            None => return Ok(false),
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_fresh_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AFD_ACTIVE");
        let active = ActiveFile::claim(&path, Duration::from_millis(50)).unwrap();
        assert_eq!(active.daemon_pid().unwrap(), std::process::id());
        assert!(!active.shutdown_requested().unwrap());
        drop(active);
        assert!(!path.exists());
    }

    #[test]
    fn test_claim_detects_live_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AFD_ACTIVE");
        let active = ActiveFile::claim(&path, Duration::from_millis(50)).unwrap();

        // A "live" daemon: tick the heartbeat from another thread while a
        // second claim is probing.
        let ticking = std::thread::spawn({
            let path = path.clone();
            move || {
                let file = File::options().read(true).write(true).open(&path).unwrap();
                for _ in 0..20 {
                    let mut buf = [0u8; 8];
                    file.read_exact_at(&mut buf, HEARTBEAT_OFFSET).unwrap();
                    let next = u64::from_ne_bytes(buf) + 1;
                    file.write_all_at(&next.to_ne_bytes(), HEARTBEAT_OFFSET)
                        .unwrap();
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        });

        match ActiveFile::claim(&path, Duration::from_millis(600)) {
            Err(ClaimError::AlreadyRunning) => {}
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
        ticking.join().unwrap();
        drop(active);
    }

    #[test]
    fn test_claim_recycles_dead_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AFD_ACTIVE");
        {
            let first = ActiveFile::claim(&path, Duration::from_millis(50)).unwrap();
            first.record_pid(0, 12345).unwrap();
            // Simulate a crash: forget the marker instead of dropping it.
            std::mem::forget(first);
        }
        assert!(path.exists());
        // Nobody ticks the heartbeat, so the claim recycles the file.
        let second = ActiveFile::claim(&path, Duration::from_millis(300)).unwrap();
        assert_eq!(second.pid(0).unwrap(), 0);
    }

    #[test]
    fn test_heartbeat_is_monotone() {
        let dir = tempfile::tempdir().unwrap();
        let active =
            ActiveFile::claim(&dir.path().join("AFD_ACTIVE"), Duration::from_millis(50)).unwrap();
        let mut last = active.heartbeat().unwrap();
        for _ in 0..100 {
            let next = active.tick().unwrap();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_pid_slots_and_shutdown_byte() {
        let dir = tempfile::tempdir().unwrap();
        let active =
            ActiveFile::claim(&dir.path().join("AFD_ACTIVE"), Duration::from_millis(50)).unwrap();
        active.record_pid(2, 4242).unwrap();
        active.record_pid(5, 5151).unwrap();
        let pids = active.list_live_pids().unwrap();
        assert!(pids.contains(&(std::process::id() as i32)));
        assert!(pids.contains(&4242));
        assert!(pids.contains(&5151));
        active.clear_pid(2).unwrap();
        assert!(!active.list_live_pids().unwrap().contains(&4242));

        active.request_shutdown().unwrap();
        assert!(active.shutdown_requested().unwrap());
    }
}

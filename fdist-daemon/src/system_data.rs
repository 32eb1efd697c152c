// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! The `system_data` snapshot: rolling counters and history rings that
//! must survive a daemon restart.

use fdist_status::{StatusRecord, HISTORY_LOG_LENGTH};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemData {
    pub sys_log_ec: u32,
    pub warn_counter: u32,
    pub error_counter: u32,
    pub amg_fork_counter: u32,
    pub fd_fork_counter: u32,
    pub burst_counter: u32,
    pub max_queue_length: u32,
    pub dir_scans: u32,
    pub sys_log_history: Vec<u8>,
    pub receive_log_history: Vec<u8>,
    pub trans_log_history: Vec<u8>,
}

impl SystemData {
    pub fn capture(status: &StatusRecord) -> SystemData {
        SystemData {
            sys_log_ec: status.sys_log_ec,
            warn_counter: status.warn_counter,
            error_counter: status.error_counter,
            amg_fork_counter: status.amg_fork_counter,
            fd_fork_counter: status.fd_fork_counter,
            burst_counter: status.burst_counter,
            max_queue_length: status.max_queue_length,
            dir_scans: status.dir_scans,
            sys_log_history: status.sys_log_history.to_vec(),
            receive_log_history: status.receive_log_history.to_vec(),
            trans_log_history: status.trans_log_history.to_vec(),
        }
    }

    pub fn restore_into(&self, status: &mut StatusRecord) {
        status.sys_log_ec = self.sys_log_ec;
        status.warn_counter = self.warn_counter;
        status.error_counter = self.error_counter;
        status.amg_fork_counter = self.amg_fork_counter;
        status.fd_fork_counter = self.fd_fork_counter;
        status.burst_counter = self.burst_counter;
        status.max_queue_length = self.max_queue_length;
        status.dir_scans = self.dir_scans;
        restore_ring(&mut status.sys_log_history, &self.sys_log_history);
        restore_ring(&mut status.receive_log_history, &self.receive_log_history);
        restore_ring(&mut status.trans_log_history, &self.trans_log_history);
    }

    pub fn save(&self, path: &Path) {
        let write = || -> anyhow::Result<()> {
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
            std::fs::rename(&tmp, path)?;
            Ok(())
        };
        if let Err(err) = write() {
            warn!("failed to persist system data: {err}");
        }
    }

    pub fn load(path: &Path) -> Option<SystemData> {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(data) => Some(data),
                Err(err) => {
                    warn!("unreadable system data, starting fresh: {err}");
                    None
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!("failed to read system data: {err}");
                None
            }
        }
    }
}

fn restore_ring(target: &mut [u8; HISTORY_LOG_LENGTH], source: &[u8]) {
    let len = source.len().min(HISTORY_LOG_LENGTH);
    target[..len].copy_from_slice(&source[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system_data");

        let mut status: StatusRecord = unsafe { std::mem::zeroed() };
        status.error_counter = 9;
        status.max_queue_length = 44;
        status.sys_log_history[0] = 3;

        let data = SystemData::capture(&status);
        data.save(&path);

        let restored = SystemData::load(&path).unwrap();
        assert_eq!(restored, data);

        let mut fresh: StatusRecord = unsafe { std::mem::zeroed() };
        restored.restore_into(&mut fresh);
        assert_eq!(fresh.error_counter, 9);
        assert_eq!(fresh.max_queue_length, 44);
        assert_eq!(fresh.sys_log_history[0], 3);
    }

    #[test]
    fn test_missing_file_is_none() {
        assert!(SystemData::load(Path::new("/nonexistent/system_data")).is_none());
    }
}

// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! The on-disk layout below the working directory.
//!
//! Every path the daemon family touches is derived from here so the
//! supervisor and its workers can never disagree about where a file lives.

use std::io;
use std::path::{Path, PathBuf};

/// Subdirectories created below the working directory on startup, in
/// creation order.
const SUBTREE: &[&str] = &[
    "fifo",
    "messages",
    "files",
    "files/outgoing",
    "files/store",
    "files/crc",
    "files/tmp",
    "files/time",
    "files/incoming",
    "files/incoming/file_mask",
    "files/incoming/ls_data",
    "log",
    "archive",
    "etc",
    "etc/action",
    "etc/action/target",
    "etc/action/target/success",
    "etc/action/target/error",
];

#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> WorkDir {
        WorkDir { root: root.into() }
    }

    /// Create or verify the complete subtree. Existing directories are left
    /// untouched.
    pub fn ensure_subtree(&self) -> io::Result<()> {
        for sub in SUBTREE {
            std::fs::create_dir_all(self.root.join(sub))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn active_file(&self) -> PathBuf {
        self.root.join("fifo/AFD_ACTIVE")
    }

    pub fn status_file(&self) -> PathBuf {
        self.root.join("fifo/AFD_STATUS")
    }

    pub fn fsa_file(&self) -> PathBuf {
        self.root.join("fifo/FSA")
    }

    pub fn fra_file(&self) -> PathBuf {
        self.root.join("fifo/FRA")
    }

    pub fn cmd_fifo(&self) -> PathBuf {
        self.root.join("fifo/AFD_CMD_FIFO")
    }

    pub fn worker_cmd_fifo(&self, worker: &str) -> PathBuf {
        self.root.join(format!("fifo/{worker}_CMD_FIFO"))
    }

    pub fn outgoing_dir(&self) -> PathBuf {
        self.root.join("files/outgoing")
    }

    pub fn incoming_ls_data(&self, dir_alias: &str) -> PathBuf {
        self.root.join("files/incoming/ls_data").join(dir_alias)
    }

    pub fn incoming_file_mask(&self, dir_alias: &str) -> PathBuf {
        self.root.join("files/incoming/file_mask").join(dir_alias)
    }

    pub fn crc_dir(&self) -> PathBuf {
        self.root.join("files/crc")
    }

    pub fn counter_file(&self) -> PathBuf {
        self.root.join("files/COUNTER")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("etc/AFD_CONFIG")
    }

    pub fn rename_rule_file(&self) -> PathBuf {
        self.root.join("etc/rename.rule")
    }

    pub fn action_dir(&self, kind: &str) -> PathBuf {
        self.root.join("etc/action/target").join(kind)
    }

    pub fn system_data_file(&self) -> PathBuf {
        self.root.join("system_data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_subtree_creates_everything() {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = WorkDir::new(dir.path());
        work_dir.ensure_subtree().unwrap();
        for sub in SUBTREE {
            assert!(dir.path().join(sub).is_dir(), "missing {sub}");
        }
        // Idempotent.
        work_dir.ensure_subtree().unwrap();
    }

    #[test]
    fn test_paths_are_rooted() {
        let work_dir = WorkDir::new("/var/afd");
        assert_eq!(
            work_dir.active_file(),
            PathBuf::from("/var/afd/fifo/AFD_ACTIVE")
        );
        assert_eq!(
            work_dir.worker_cmd_fifo("AMG"),
            PathBuf::from("/var/afd/fifo/AMG_CMD_FIFO")
        );
    }
}

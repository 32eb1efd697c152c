// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! The distribution configuration: which directories are watched or
//! retrieved, which hosts receive the result, and the handling options
//! in between. Read from `etc/DIR_CONFIG.json`.

use fdist_status::{dir_flag, host_status, Arena, DirRecord, GtLtSign, HostRecord, StupidMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

fn default_max_errors() -> i32 {
    10
}

fn default_allowed_transfers() -> i32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostEntry {
    pub alias: String,
    /// `file:///target/path` for local delivery, `http://…` for remote.
    pub url: String,
    #[serde(default = "default_max_errors")]
    pub max_errors: i32,
    #[serde(default = "default_allowed_transfers")]
    pub allowed_transfers: i32,
    /// Seconds without a connection before the warn bit trips; zero
    /// disables the check.
    #[serde(default)]
    pub warn_time: i64,
    #[serde(default)]
    pub transfer_timeout: i64,
    #[serde(default)]
    pub retry_interval: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListingMode {
    #[default]
    Persistent,
    OneShot,
    GetOnceOnly,
}

impl From<ListingMode> for StupidMode {
    fn from(mode: ListingMode) -> StupidMode {
        match mode {
            ListingMode::Persistent => StupidMode::Persistent,
            ListingMode::OneShot => StupidMode::OneShot,
            ListingMode::GetOnceOnly => StupidMode::GetOnceOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    #[default]
    Equal,
    LessThan,
    GreaterThan,
}

impl From<Relation> for GtLtSign {
    fn from(relation: Relation) -> GtLtSign {
        match relation {
            Relation::Equal => GtLtSign::Equal,
            Relation::LessThan => GtLtSign::LessThan,
            Relation::GreaterThan => GtLtSign::GreaterThan,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirEntry {
    pub alias: String,
    /// Local path to watch, or a remote directory URL to retrieve from.
    pub location: String,
    /// Ordered mask groups; each inner list is one group.
    #[serde(default)]
    pub file_masks: Vec<Vec<String>>,
    /// Handling options, one per line, applied in order.
    #[serde(default)]
    pub options: String,
    /// Alias of the destination host.
    pub host: String,
    #[serde(default)]
    pub listing_mode: ListingMode,
    /// Delete remote files after a successful fetch.
    #[serde(default)]
    pub remove: bool,
    #[serde(default)]
    pub dont_get_dir_list: bool,
    #[serde(default)]
    pub accept_dot_files: bool,
    #[serde(default)]
    pub ignore_size: i64,
    #[serde(default)]
    pub ignore_size_relation: Relation,
    #[serde(default)]
    pub ignore_file_time: i64,
    #[serde(default)]
    pub ignore_file_time_relation: Relation,
    #[serde(default)]
    pub max_copied_files: Option<u32>,
    #[serde(default)]
    pub max_copied_file_size: Option<u64>,
}

impl DirEntry {
    pub fn is_remote(&self) -> bool {
        self.location.starts_with("http://") || self.location.starts_with("https://")
    }

    pub fn local_path(&self) -> Option<PathBuf> {
        if self.is_remote() {
            None
        } else {
            Some(PathBuf::from(&self.location))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DirConfig {
    pub hosts: Vec<HostEntry>,
    pub dirs: Vec<DirEntry>,
}

impl DirConfig {
    pub fn load(path: &Path) -> DirConfig {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(config) => config,
                Err(err) => {
                    warn!(sign = "CONFIG", "bad distribution configuration: {err}");
                    DirConfig::default()
                }
            },
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to read {}: {err}", path.display());
                }
                DirConfig::default()
            }
        }
    }

    pub fn host_index(&self, alias: &str) -> Option<usize> {
        self.hosts.iter().position(|host| host.alias == alias)
    }

    /// Populate a fresh host store from the configuration.
    pub fn build_fsa(&self, path: &Path) -> Result<Arena<HostRecord>, fdist_status::StoreError> {
        let mut arena: Arena<HostRecord> = Arena::create(path, self.hosts.len().max(1), 0)?;
        for (index, host) in self.hosts.iter().enumerate() {
            let record = arena.get_mut(index)?;
            record.set_alias(&host.alias);
            record.max_errors = host.max_errors;
            record.allowed_transfers = host.allowed_transfers;
            record.warn_time = host.warn_time;
            record.transfer_timeout = host.transfer_timeout;
            record.retry_interval = host.retry_interval;
            record.host_status = host_status::HOST_IN_DIR_CONFIG;
            record.danger_no_of_files = 1000;
        }
        Ok(arena)
    }

    /// Populate a fresh directory store, wiring `fsa_pos` back to the
    /// owning host.
    pub fn build_fra(
        &self,
        path: &Path,
        default_max_files: u32,
        default_max_size: u64,
    ) -> Result<Arena<DirRecord>, fdist_status::StoreError> {
        let mut arena: Arena<DirRecord> = Arena::create(path, self.dirs.len().max(1), 0)?;
        for (index, dir) in self.dirs.iter().enumerate() {
            let record = arena.get_mut(index)?;
            record.set_alias(&dir.alias);
            record.set_url(&dir.location);
            record.fsa_pos = self
                .host_index(&dir.host)
                .map(|pos| pos as i32)
                .unwrap_or(-1);
            record.stupid_mode = StupidMode::from(dir.listing_mode) as u8;
            record.remove = dir.remove as u8;
            record.ignore_size = dir.ignore_size;
            record.gt_lt_sign_size = GtLtSign::from(dir.ignore_size_relation) as u8;
            record.ignore_file_time = dir.ignore_file_time;
            record.gt_lt_sign_time = GtLtSign::from(dir.ignore_file_time_relation) as u8;
            record.max_copied_files = dir.max_copied_files.unwrap_or(default_max_files);
            record.max_copied_file_size = dir.max_copied_file_size.unwrap_or(default_max_size);
            let mut flags = 0;
            if dir.dont_get_dir_list {
                flags |= dir_flag::DONT_GET_DIR_LIST;
            }
            if dir.accept_dot_files {
                flags |= dir_flag::ACCEPT_DOT_FILES;
            }
            if dir.max_copied_files.is_some() {
                flags |= dir_flag::MAX_COPIED;
            }
            record.dir_flag = flags;
        }
        Ok(arena)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DirConfig {
        DirConfig {
            hosts: vec![HostEntry {
                alias: "mirror".into(),
                url: "file:///srv/mirror".into(),
                max_errors: 5,
                allowed_transfers: 2,
                warn_time: 0,
                transfer_timeout: 60,
                retry_interval: 30,
            }],
            dirs: vec![DirEntry {
                alias: "inbound".into(),
                location: "/var/spool/inbound".into(),
                file_masks: vec![vec!["*.dat".into()]],
                options: "tolower\n".into(),
                host: "mirror".into(),
                listing_mode: ListingMode::Persistent,
                remove: false,
                dont_get_dir_list: false,
                accept_dot_files: false,
                ignore_size: 0,
                ignore_size_relation: Relation::Equal,
                ignore_file_time: 0,
                ignore_file_time_relation: Relation::Equal,
                max_copied_files: Some(50),
                max_copied_file_size: None,
            }],
        }
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DIR_CONFIG.json");
        std::fs::write(&path, serde_json::to_vec_pretty(&sample()).unwrap()).unwrap();
        assert_eq!(DirConfig::load(&path), sample());
    }

    #[test]
    fn test_missing_or_bad_config_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            DirConfig::load(&dir.path().join("absent.json")),
            DirConfig::default()
        );
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, b"{ not json").unwrap();
        assert_eq!(DirConfig::load(&bad), DirConfig::default());
    }

    #[test]
    fn test_build_stores() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample();
        let fsa = config.build_fsa(&dir.path().join("FSA")).unwrap();
        assert_eq!(fsa.count(), 1);
        let host = fsa.get(0).unwrap();
        assert_eq!(host.alias(), "mirror");
        assert_eq!(host.max_errors, 5);
        assert!(host.status_set(host_status::HOST_IN_DIR_CONFIG));

        let fra = config
            .build_fra(&dir.path().join("FRA"), 100, 1 << 30)
            .unwrap();
        let record = fra.get(0).unwrap();
        assert_eq!(record.alias(), "inbound");
        assert_eq!(record.fsa_pos, 0);
        assert_eq!(record.max_copied_files, 50);
        assert!(record.flag_set(dir_flag::MAX_COPIED));
        assert_eq!(record.max_copied_file_size, 1 << 30);
    }

    #[test]
    fn test_remote_detection() {
        let mut entry = sample().dirs[0].clone();
        assert!(!entry.is_remote());
        assert!(entry.local_path().is_some());
        entry.location = "http://remote/data/".into();
        assert!(entry.is_remote());
        assert!(entry.local_path().is_none());
    }
}

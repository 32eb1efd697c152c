// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! Parser for the daemon configuration file `etc/AFD_CONFIG`.
//!
//! The format is plain `KEY value` lines with `#` comments. A missing file
//! means all defaults; a malformed line is skipped with a warning so a typo
//! never keeps the daemon from starting.

use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub tcp_port: u16,
    pub max_copied_files: u32,
    pub max_copied_file_size: u64,
    pub default_age_limit: Option<Duration>,
    pub dir_rescan_time: Duration,
    pub in_global_filesystem: bool,
    pub init_priority: Option<i32>,
    pub saved_core_files: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tcp_port: 4444,
            max_copied_files: 100,
            max_copied_file_size: 100 * 1024 * 1024,
            default_age_limit: None,
            dir_rescan_time: Duration::from_secs(5),
            in_global_filesystem: false,
            init_priority: None,
            saved_core_files: 10,
        }
    }
}

impl Config {
    /// Read the configuration from `path`, falling back to the defaults for
    /// anything absent or unparseable.
    pub fn load(path: &Path) -> Config {
        let mut config = Config::default();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("no configuration at {}, using defaults", path.display());
                return config;
            }
            Err(err) => {
                warn!("failed to read {}: {err}", path.display());
                return config;
            }
        };
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((key, value)) => (key, value.trim()),
                None => {
                    warn!(
                        sign = "CONFIG",
                        "{}:{}: key without value, skipping",
                        path.display(),
                        lineno + 1
                    );
                    continue;
                }
            };
            if !config.apply(key, value) {
                warn!(
                    sign = "CONFIG",
                    "{}:{}: bad value `{value}' for {key}, keeping default",
                    path.display(),
                    lineno + 1
                );
            }
        }
        config
    }

    fn apply(&mut self, key: &str, value: &str) -> bool {
        match key {
            "AFD_TCP_PORT" => match value.parse() {
                Ok(port) => {
                    self.tcp_port = port;
                    true
                }
                Err(_) => false,
            },
            "MAX_COPIED_FILES" => match value.parse() {
                Ok(n) => {
                    self.max_copied_files = n;
                    true
                }
                Err(_) => false,
            },
            "MAX_COPIED_FILE_SIZE" => match value.parse() {
                Ok(n) => {
                    self.max_copied_file_size = n;
                    true
                }
                Err(_) => false,
            },
            "DEFAULT_AGE_LIMIT" => match value.parse() {
                Ok(secs) => {
                    self.default_age_limit = Some(Duration::from_secs(secs));
                    true
                }
                Err(_) => false,
            },
            "AMG_DIR_RESCAN_TIME" => match value.parse() {
                Ok(secs) => {
                    self.dir_rescan_time = Duration::from_secs(secs);
                    true
                }
                Err(_) => false,
            },
            "IN_GLOBAL_FILESYSTEM" => match value {
                "YES" | "yes" | "1" => {
                    self.in_global_filesystem = true;
                    true
                }
                "NO" | "no" | "0" => {
                    self.in_global_filesystem = false;
                    true
                }
                _ => false,
            },
            "INIT_AFD_PRIORITY" => match value.parse() {
                Ok(prio) => {
                    self.init_priority = Some(prio);
                    true
                }
                Err(_) => false,
            },
            "NO_OF_SAVED_CORE_FILES" => match value.parse() {
                Ok(n) => {
                    self.saved_core_files = n;
                    true
                }
                Err(_) => false,
            },
            _ => {
                debug!("ignoring unknown configuration key {key}");
                true
            }
        }
    }
}

// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! Duplicate detection against persisted fingerprints.
//!
//! Each job keeps a fingerprint file under `files/crc/`; a batch file
//! whose fingerprint is already recorded (and younger than the timeout)
//! is a duplicate and silently dropped. Stale fingerprints are garbage
//! collected on every store write.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub struct DupStore {
    path: PathBuf,
    timeout: Duration,
    /// fingerprint hex -> unix time it was recorded.
    entries: HashMap<String, i64>,
}

impl DupStore {
    /// Open (or start) the fingerprint store of one job.
    pub fn open(crc_dir: &Path, job: &str, timeout: Duration) -> DupStore {
        let path = crc_dir.join(job);
        let mut entries = HashMap::new();
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                for line in contents.lines() {
                    if let Some((hex, stamp)) = line.split_once(' ') {
                        if let Ok(stamp) = stamp.parse() {
                            entries.insert(hex.to_string(), stamp);
                        }
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("failed to read dupcheck store {}: {err}", path.display()),
        }
        DupStore {
            path,
            timeout,
            entries,
        }
    }

    /// Check a fingerprint and record it. Returns true when the entry was
    /// already present and still fresh.
    pub fn check_and_insert(&mut self, fingerprint: &str, now: i64) -> bool {
        self.gc(now);
        let hit = self
            .entries
            .get(fingerprint)
            .is_some_and(|&stamp| now - stamp <= self.timeout.as_secs() as i64);
        self.entries.insert(fingerprint.to_string(), now);
        hit
    }

    fn gc(&mut self, now: i64) {
        let timeout = self.timeout.as_secs() as i64;
        self.entries.retain(|_, &mut stamp| now - stamp <= timeout);
    }

    /// Write the store back out. Losing it on error only risks one extra
    /// delivery, so a failure is a warning.
    pub fn persist(&self) {
        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&self.path)?;
            for (hex, stamp) in &self.entries {
                writeln!(file, "{hex} {stamp}")?;
            }
            Ok(())
        };
        if let Err(err) = write() {
            warn!("failed to persist dupcheck store {}: {err}", self.path.display());
        }
    }
}

/// Fingerprint of a file: its content hash, or its name when the job
/// deduplicates by name only.
pub fn fingerprint(dir: &Path, name: &str, by_content: bool) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    if by_content {
        let contents = std::fs::read(dir.join(name))?;
        hasher.update(&contents);
    } else {
        hasher.update(name.as_bytes());
    }
    Ok(format!("{:x}", hasher.finalize()))
}

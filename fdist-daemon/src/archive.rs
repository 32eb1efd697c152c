// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! The archive watcher: prunes delivered files out of `archive/` once
//! their retention runs out.
//!
//! Archived batches live in `archive/<expiry>_<name>` directories where
//! `<expiry>` is the unix time after which the batch may go. Entries
//! without the prefix fall back to a fixed retention on mtime.

use fdist_common::fifo;
use fdist_common::layout::WorkDir;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fallback retention for entries that carry no expiry in their name.
const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 86_400);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run(work_dir: &WorkDir) -> anyhow::Result<i32> {
    let mut commands = fifo::CommandReader::open(&work_dir.worker_cmd_fifo("archive_watch"))?;
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    info!("archive watcher running over {}", work_dir.archive_dir().display());
    loop {
        tokio::select! {
            _ = sweep.tick() => {
                let removed = sweep_archive(&work_dir.archive_dir(), chrono::Utc::now().timestamp());
                if removed > 0 {
                    debug!("removed {removed} expired archive entries");
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                for opcode in commands.drain()? {
                    match opcode {
                        fifo::Opcode::Stop | fifo::Opcode::QuickStop | fifo::Opcode::Shutdown => {
                            return Ok(fdist_common::exit_code::SUCCESS);
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Expiry encoded in an archive entry name, if any: `<unixtime>_rest`.
fn parse_expiry(name: &str) -> Option<i64> {
    let (stamp, _) = name.split_once('_')?;
    stamp.parse().ok()
}

/// One pass over the archive tree. Returns how many entries went.
pub fn sweep_archive(archive_dir: &Path, now: i64) -> usize {
    let entries = match std::fs::read_dir(archive_dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("can't read archive directory: {err}");
            return 0;
        }
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let expired = match parse_expiry(&name) {
            Some(expiry) => expiry <= now,
            None => entry
                .metadata()
                .and_then(|meta| meta.modified())
                .map(|mtime| {
                    mtime
                        .elapsed()
                        .map(|age| age > DEFAULT_RETENTION)
                        .unwrap_or(false)
                })
                .unwrap_or(false),
        };
        if !expired {
            continue;
        }
        let path = entry.path();
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Ok(()) => removed += 1,
            Err(err) => warn!("failed to prune {}: {err}", path.display()),
        }
    }
    removed
}

/// Name an archive entry so the sweeper can expire it without a stat.
pub fn archive_entry_name(expiry: i64, job: &str) -> String {
    format!("{expiry}_{job}")
}

// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! The shared status substrate: memory-mapped record arenas for hosts,
//! directories and the global daemon state, plus the active-marker file
//! with its heartbeat.
//!
//! Every record file is owned jointly: the supervisor creates and sizes
//! it, workers attach read-write. Mutations are bracketed by byte-range
//! locks over the record, and each arena carries a version word so a
//! consumer holding a stale mapping can detect it and re-attach.

pub mod active;
pub mod arena;
pub mod lock;
pub mod mmap;
pub mod records;

pub use active::{ActiveFile, ClaimError};
pub use arena::{Arena, Record, StoreError};
pub use lock::{LockMode, LockRank, RecordGuard};
pub use records::{
    dir_flag, host_status, proc_state, DirRecord, GtLtSign, HostRecord, JobStatus, StatusRecord,
    StupidMode, HISTORY_LOG_LENGTH, MAX_NO_PARALLEL_JOBS, NO_OF_PROCESS,
};

use std::hash::Hasher;

/// Stable identifier for a host, derived from its alias. Stays the same
/// across restarts and configuration reloads as long as the alias does.
pub fn host_id(alias: &str) -> u32 {
    let mut hasher = zwohash::ZwoHasher::default();
    hasher.write(alias.as_bytes());
    hasher.finish() as u32
}

/// Recompute the derived fields of the global record: `jobs_in_queue` as
/// the sum over hosts of `jobs_queued`, capped into `max_queue_length`.
pub fn reconcile(
    hosts: &Arena<HostRecord>,
    global: &mut Arena<StatusRecord>,
) -> Result<(), StoreError> {
    let mut jobs_in_queue: u32 = 0;
    for i in 0..hosts.count() {
        jobs_in_queue = jobs_in_queue.saturating_add(hosts.get(i)?.jobs_queued);
    }
    let status = global.get_mut(0)?;
    status.jobs_in_queue = jobs_in_queue;
    if jobs_in_queue > status.max_queue_length {
        status.max_queue_length = jobs_in_queue;
    }
    Ok(())
}

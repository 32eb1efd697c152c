// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! The supervisor's per-host pass: auto-pausing queues on error storms,
//! tripping warn-time bits on silent hosts, and the danger brake when
//! the queue depth gets out of hand.

use fdist_common::event::{self, EventAction};
use fdist_common::layout::WorkDir;
use fdist_status::{host_status, Arena, HostRecord, LockMode, StoreError};
use std::os::unix::fs::PermissionsExt;
use tracing::{info, warn};

const OFFLINE_BITS: u32 = host_status::ERROR_OFFLINE
    | host_status::ERROR_OFFLINE_T
    | host_status::ERROR_OFFLINE_STATIC;

/// Run the full pass over every host record.
pub fn check_hosts(
    fsa: &mut Arena<HostRecord>,
    work_dir: &WorkDir,
    link_max: i64,
    warn_time_disabled: bool,
    now: i64,
) -> Result<(), StoreError> {
    for index in 0..fsa.count() {
        check_one_host(fsa, work_dir, index, link_max, warn_time_disabled, now)?;
    }
    Ok(())
}

fn check_one_host(
    fsa: &mut Arena<HostRecord>,
    work_dir: &WorkDir,
    index: usize,
    link_max: i64,
    warn_time_disabled: bool,
    now: i64,
) -> Result<(), StoreError> {
    let _guard = fsa.lock_record(index, LockMode::Exclusive)?;
    let record = fsa.get_mut(index)?;
    let alias = record.alias().to_string();

    // Error storm: pause the queue at max_errors, resume below it.
    let over_limit = record.error_counter >= record.max_errors;
    let auto_paused = record.status_set(host_status::AUTO_PAUSE_QUEUE);
    if over_limit && !auto_paused {
        record.host_status |= host_status::AUTO_PAUSE_QUEUE;
        if !record.status_set(host_status::PENDING_ERRORS) {
            record.host_status |= host_status::PENDING_ERRORS;
            event::emit(
                EventAction::ErrorStart,
                &alias,
                format_args!("errors {} >= max errors {}", record.error_counter, record.max_errors),
            );
            run_action(work_dir, "error", &alias, "start");
        }
        let offline = record.host_status & OFFLINE_BITS != 0;
        let errors = record.error_counter;
        let max_errors = record.max_errors;
        if offline {
            info!(sign = "O", "{alias}: stopped input queue, since there are too many errors");
        } else {
            warn!("{alias}: stopped input queue, since there are too many errors");
        }
        event::emit(
            EventAction::StopQueue,
            &alias,
            format_args!("errors {errors} >= max errors {max_errors}"),
        );
    } else if !over_limit && auto_paused {
        record.host_status &= !host_status::AUTO_PAUSE_QUEUE;
        record.host_status &= !host_status::PENDING_ERRORS;
        record.host_status &= !(host_status::ERROR_ACKNOWLEDGED | host_status::ERROR_ACKNOWLEDGED_T);
        event::emit(EventAction::ErrorEnd, &alias, format_args!("error counter recovered"));
        event::emit(EventAction::StartQueue, &alias, format_args!("input queue started again"));
        run_action(work_dir, "error", &alias, "stop");
    }

    // Warn time: a host nobody talked to for too long.
    let record = fsa.get_mut(index)?;
    if !warn_time_disabled
        && record.warn_time > 0
        && now - record.last_connection >= record.warn_time
    {
        if !record.status_set(host_status::WARN_TIME_REACHED) {
            record.host_status |= host_status::WARN_TIME_REACHED;
            event::emit(
                EventAction::WarnTimeSet,
                &alias,
                format_args!("no connection for {} seconds", now - record.last_connection),
            );
            run_action(work_dir, "warn", &alias, "start");
        }
    } else if record.status_set(host_status::WARN_TIME_REACHED) {
        record.host_status &= !host_status::WARN_TIME_REACHED;
        event::emit(EventAction::WarnTimeUnset, &alias, format_args!("connection seen again"));
        run_action(work_dir, "warn", &alias, "stop");
    }

    // Danger brake: queue depth out of proportion, generous hysteresis
    // on the way back.
    let record = fsa.get_mut(index)?;
    let danger_set = record.status_set(host_status::DANGER_PAUSE_QUEUE);
    let deep_queue = (record.jobs_queued as i64) >= link_max / 2;
    let many_files = record.total_file_counter > record.danger_no_of_files;
    if deep_queue && many_files && !danger_set {
        record.host_status |= host_status::DANGER_PAUSE_QUEUE;
        warn!("{alias}: danger queue brake engaged ({} jobs queued)", record.jobs_queued);
        event::emit(EventAction::StopQueue, &alias, format_args!("danger queue brake"));
    } else if danger_set
        && (record.jobs_queued as i64) < link_max / 4
        && record.total_file_counter < record.danger_no_of_files / 2
    {
        record.host_status &= !host_status::DANGER_PAUSE_QUEUE;
        event::emit(EventAction::StartQueue, &alias, format_args!("danger queue brake released"));
    }

    Ok(())
}

/// Clear the warn bit on every host; the feature flag turned the check
/// off mid-flight.
pub fn clear_warn_bits(fsa: &mut Arena<HostRecord>) -> Result<(), StoreError> {
    for index in 0..fsa.count() {
        let _guard = fsa.lock_record(index, LockMode::Exclusive)?;
        let record = fsa.get_mut(index)?;
        record.host_status &= !host_status::WARN_TIME_REACHED;
    }
    Ok(())
}

/// Refresh the SUCCESS_ACTION bit of every host from the hook-script
/// directory. Returns the directory's mtime so the caller can skip
/// unchanged rescans.
pub fn refresh_success_actions(
    fsa: &mut Arena<HostRecord>,
    work_dir: &WorkDir,
    last_seen_mtime: i64,
) -> Result<i64, StoreError> {
    let dir = work_dir.action_dir("success");
    let mtime = std::fs::metadata(&dir)
        .and_then(|meta| meta.modified())
        .map(|mtime| {
            mtime
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0)
        })
        .unwrap_or(0);
    if mtime <= last_seen_mtime {
        return Ok(last_seen_mtime);
    }
    for index in 0..fsa.count() {
        let alias = fsa.get(index)?.alias().to_string();
        let script = dir.join(&alias);
        let runnable = script
            .metadata()
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false);
        let _guard = fsa.lock_record(index, LockMode::Exclusive)?;
        let record = fsa.get_mut(index)?;
        if runnable {
            record.host_status |= host_status::SUCCESS_ACTION;
        } else {
            record.host_status &= !host_status::SUCCESS_ACTION;
        }
    }
    Ok(mtime)
}

/// Fire a hook script, if present and executable. Fire-and-forget; the
/// supervisor never waits on an operator script.
fn run_action(work_dir: &WorkDir, kind: &str, alias: &str, phase: &str) {
    let script = work_dir.action_dir(kind).join(alias);
    let runnable = script
        .metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false);
    if !runnable {
        return;
    }
    match std::process::Command::new(&script)
        .arg(phase)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
    {
        Ok(_child) => info!("ran {kind} action for {alias} ({phase})"),
        Err(err) => warn!("failed to run {} for {alias}: {err}", script.display()),
    }
}

// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! The transfer worker: delivers staged batches to their destination
//! hosts and drives the retrieval plans of remote directories.

use crate::amg::retrieved_spool;
use crate::archive::archive_entry_name;
use crate::dirconfig::{DirConfig, DirEntry};
use crate::job::JobManifest;
use fdist_common::config::Config;
use fdist_common::fifo;
use fdist_common::layout::WorkDir;
use fdist_options::mask::MaskGroup;
use fdist_retrieve::planner::{plan_retrieval, DirPolicy, PlanRequest};
use fdist_retrieve::{HttpDirSource, RetrieveList};
use fdist_status::{host_status, Arena, DirRecord, GtLtSign, HostRecord, LockMode};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bits that take a host out of rotation.
const HOST_PAUSED: u32 = host_status::PAUSE_QUEUE
    | host_status::AUTO_PAUSE_QUEUE
    | host_status::DANGER_PAUSE_QUEUE
    | host_status::STOP_TRANSFER
    | host_status::HOST_DISABLED;

pub async fn run(work_dir: &WorkDir) -> anyhow::Result<i32> {
    let config = Config::load(&work_dir.config_file());
    let dir_config = DirConfig::load(&work_dir.root().join("etc/DIR_CONFIG.json"));
    let mut commands = fifo::CommandReader::open(&work_dir.worker_cmd_fifo("FD"))?;

    let mut fsa: Arena<HostRecord> = match Arena::attach(&work_dir.fsa_file()) {
        Ok(arena) => arena,
        Err(err) => {
            warn!("host store is gone ({err}), asking for a restart");
            return Ok(fdist_common::exit_code::RESTART_STALE_SHM);
        }
    };
    let mut fra: Arena<DirRecord> = match Arena::attach(&work_dir.fra_file()) {
        Ok(arena) => arena,
        Err(err) => {
            warn!("directory store is gone ({err}), asking for a restart");
            return Ok(fdist_common::exit_code::RESTART_STALE_SHM);
        }
    };

    if let Err(err) = fifo::send(&work_dir.cmd_fifo(), fifo::Opcode::FdReady) {
        debug!("could not report readiness: {err}");
    }
    info!("transfer worker running");

    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
    let mut cycle = tokio::time::interval(config.dir_rescan_time);
    let mut more_files: Vec<bool> = vec![false; dir_config.dirs.len()];
    loop {
        tokio::select! {
            _ = cycle.tick() => {
                if fsa.is_stale()? {
                    fsa = fsa.reattach()?;
                }
                if fra.is_stale()? {
                    fra = fra.reattach()?;
                }
                deliver_outgoing(work_dir, &dir_config, &mut fsa);
                let retrieve_disabled = fra.feature_flags()
                    & fdist_status::records::feature_flag::DISABLE_RETRIEVE
                    != 0;
                for (dir_pos, entry) in dir_config.dirs.iter().enumerate() {
                    if !entry.is_remote() || retrieve_disabled {
                        continue;
                    }
                    let resume = more_files[dir_pos];
                    match retrieve_one_dir(work_dir, entry, dir_pos, &mut fsa, &mut fra,
                                           &dir_config, resume).await {
                        Ok(more) => more_files[dir_pos] = more,
                        Err(err) => {
                            warn!("retrieval from {} failed: {err}", entry.alias);
                            bump_error_counter(&mut fsa, &dir_config, &entry.host);
                        }
                    }
                }
            }
            _ = hangup.recv() => {
                info!("SIGHUP received, asking for a restart");
                return Ok(fdist_common::exit_code::RESTART_SIGHUP);
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                for opcode in commands.drain()? {
                    match opcode {
                        fifo::Opcode::Stop | fifo::Opcode::QuickStop | fifo::Opcode::Shutdown => {
                            info!("transfer worker stopping");
                            return Ok(fdist_common::exit_code::SUCCESS);
                        }
                        fifo::Opcode::IsAlive => {
                            _ = fifo::send(&work_dir.cmd_fifo(), fifo::Opcode::FdReady);
                        }
                        other => debug!("ignoring {other:?}"),
                    }
                }
            }
        }
    }
}

/// One pass over the outgoing spool.
fn deliver_outgoing(work_dir: &WorkDir, dir_config: &DirConfig, fsa: &mut Arena<HostRecord>) {
    let batches = match std::fs::read_dir(work_dir.outgoing_dir()) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("can't read outgoing spool: {err}");
            return;
        }
    };
    for batch in batches.flatten() {
        if !batch.path().is_dir() {
            continue;
        }
        if let Err(err) = deliver_batch(work_dir, dir_config, fsa, &batch.path()) {
            warn!("delivery of {} failed: {err}", batch.path().display());
        }
    }
}

fn deliver_batch(
    work_dir: &WorkDir,
    dir_config: &DirConfig,
    fsa: &mut Arena<HostRecord>,
    batch_dir: &Path,
) -> anyhow::Result<()> {
    let Some(manifest) = JobManifest::take(batch_dir)? else {
        // Still being staged by the ingestion worker.
        return Ok(());
    };
    let Some(host_pos) = dir_config.host_index(&manifest.host) else {
        warn!("batch for unknown host {}, leaving it queued", manifest.host);
        manifest.write(batch_dir)?;
        return Ok(());
    };
    let host = &dir_config.hosts[host_pos];

    {
        let _guard = fsa.lock_record(host_pos, LockMode::Exclusive)?;
        let record = fsa.get(host_pos)?;
        if record.host_status & HOST_PAUSED != 0 {
            debug!("host {} is paused, batch stays queued", manifest.host);
            manifest.write(batch_dir)?;
            return Ok(());
        }
    }
    {
        let _guard = fsa.lock_record(host_pos, LockMode::Exclusive)?;
        fsa.get_mut(host_pos)?.active_transfers += 1;
    }

    let now = chrono::Utc::now().timestamp();
    let mut sent_files = 0i32;
    let mut sent_bytes = 0u64;
    let mut failed = false;

    let names: Vec<String> = std::fs::read_dir(batch_dir)?
        .flatten()
        .filter(|e| e.path().is_file())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    for name in &names {
        let path = batch_dir.join(name);
        let size = path.metadata().map(|m| m.len()).unwrap_or(0);
        if let Some(age_limit) = manifest.age_limit_secs {
            let age = path
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| mtime.elapsed().ok())
                .map(|age| age.as_secs())
                .unwrap_or(0);
            if age > age_limit {
                debug!("dropping {name}, older than the {age_limit}s age limit");
                _ = std::fs::remove_file(&path);
                continue;
            }
        }
        match deliver_file(&host.url, &path, name) {
            Ok(()) => {
                sent_files += 1;
                sent_bytes += size;
            }
            Err(err) => {
                warn!("failed to deliver {name} to {}: {err}", manifest.host);
                failed = true;
                break;
            }
        }
    }

    {
        let _guard = fsa.lock_record(host_pos, LockMode::Exclusive)?;
        let record = fsa.get_mut(host_pos)?;
        record.active_transfers -= 1;
        record.total_file_counter += sent_files;
        record.total_file_size += sent_bytes;
        record.last_connection = now;
        if failed {
            record.error_counter += 1;
            record.last_retry_time = now;
        } else {
            record.error_counter = 0;
            if record.jobs_queued > 0 {
                record.jobs_queued -= 1;
            }
        }
    }

    if failed {
        // Leave the batch queued for the next cycle.
        manifest.write(batch_dir)?;
        return Ok(());
    }

    match manifest.archive_secs {
        Some(secs) => {
            let name = batch_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "batch".to_string());
            let target = work_dir
                .archive_dir()
                .join(archive_entry_name(now + secs as i64, &name));
            if let Err(err) = std::fs::rename(batch_dir, &target) {
                warn!("failed to archive batch: {err}");
                std::fs::remove_dir_all(batch_dir)?;
            }
        }
        None => std::fs::remove_dir_all(batch_dir)?,
    }
    Ok(())
}

/// Local delivery: a `file://` URL names the target directory.
fn deliver_file(url: &str, source: &Path, name: &str) -> anyhow::Result<()> {
    if let Some(target_dir) = url.strip_prefix("file://") {
        let target_dir = Path::new(target_dir);
        std::fs::create_dir_all(target_dir)?;
        // Write-then-rename so a reader never sees a partial file.
        let tmp = target_dir.join(format!(".{name}.part"));
        std::fs::copy(source, &tmp)?;
        std::fs::rename(&tmp, target_dir.join(name))?;
        Ok(())
    } else {
        anyhow::bail!("no transport for {url}")
    }
}

fn bump_error_counter(fsa: &mut Arena<HostRecord>, dir_config: &DirConfig, host: &str) {
    if let Some(host_pos) = dir_config.host_index(host) {
        let mut update = || -> Result<(), fdist_status::StoreError> {
            let _guard = fsa.lock_record(host_pos, LockMode::Exclusive)?;
            fsa.get_mut(host_pos)?.error_counter += 1;
            Ok(())
        };
        if let Err(err) = update() {
            warn!("failed to raise the error counter of {host}: {err}");
        }
    }
}

fn policy_from_record(record: &DirRecord) -> DirPolicy {
    DirPolicy {
        ignore_size: record.ignore_size,
        size_sign: GtLtSign::from_raw(record.gt_lt_sign_size),
        ignore_file_time: record.ignore_file_time,
        time_sign: GtLtSign::from_raw(record.gt_lt_sign_time),
        max_copied_files: record.max_copied_files,
        max_copied_file_size: record.max_copied_file_size,
        stupid_mode: record.stupid_mode(),
        remove: record.remove != 0,
        dont_get_dir_list: record.flag_set(fdist_status::dir_flag::DONT_GET_DIR_LIST),
        accept_dot_files: record.flag_set(fdist_status::dir_flag::ACCEPT_DOT_FILES),
    }
}

/// Plan and fetch one remote directory. Returns whether eligible files
/// were left unassigned for the next cycle.
#[allow(clippy::too_many_arguments)]
async fn retrieve_one_dir(
    work_dir: &WorkDir,
    entry: &DirEntry,
    dir_pos: usize,
    fsa: &mut Arena<HostRecord>,
    fra: &mut Arena<DirRecord>,
    dir_config: &DirConfig,
    resume: bool,
) -> anyhow::Result<bool> {
    let policy = policy_from_record(fra.get(dir_pos)?);
    let masks: Vec<MaskGroup> = if entry.file_masks.is_empty() {
        vec![MaskGroup::new(vec!["*".to_string()])]
    } else {
        entry
            .file_masks
            .iter()
            .map(|group| MaskGroup::new(group.clone()))
            .collect()
    };

    let base: hyper::Uri = entry.location.parse()?;
    let mut source = HttpDirSource::new(base, Duration::from_secs(30));
    let mut list = RetrieveList::open(&work_dir.incoming_ls_data(&entry.alias))?;
    let request = PlanRequest {
        more_files_in_list: resume,
        distributed_helper: false,
        old_error_job: false,
        job_no: 0,
    };
    let plan = plan_retrieval(&mut source, &mut list, &policy, &masks, request).await?;
    if plan.files_to_retrieve == 0 {
        return Ok(plan.more_files_in_list);
    }
    debug!(
        "fetching up to {} files ({} bytes) from {}",
        plan.files_to_retrieve, plan.size_to_retrieve, entry.alias
    );

    let spool = retrieved_spool(work_dir, &entry.alias);
    std::fs::create_dir_all(&spool)?;
    let client: Client<HttpConnector, Empty<Bytes>> =
        Client::builder(TokioExecutor::new()).build(HttpConnector::new());

    let mut fetched_files = 0u32;
    let mut fetched_bytes = 0u64;
    for index in list.occupied() {
        let record = list.get(index)?;
        if record.assigned == 0 || record.retrieved != 0 {
            continue;
        }
        let name = record.name().to_string();
        match fetch_file(&client, &entry.location, &name, &spool).await {
            Ok(bytes) => {
                fetched_files += 1;
                fetched_bytes += bytes;
                list.update(index, |r| {
                    r.retrieved = 1;
                    r.assigned = 0;
                    r.size = bytes as i64;
                })?;
            }
            Err(err) => {
                warn!("failed to fetch {name}: {err}");
                list.update(index, |r| r.assigned = 0)?;
                bump_error_counter(fsa, dir_config, &entry.host);
            }
        }
    }
    list.sync()?;

    {
        let _guard = fra.lock_record(dir_pos, LockMode::Exclusive)?;
        let record = fra.get_mut(dir_pos)?;
        record.files_received += fetched_files;
        record.bytes_received += fetched_bytes;
        record.last_retrieval = chrono::Utc::now().timestamp();
    }
    Ok(plan.more_files_in_list)
}

async fn fetch_file(
    client: &Client<HttpConnector, Empty<Bytes>>,
    base: &str,
    name: &str,
    spool: &Path,
) -> anyhow::Result<u64> {
    let url: hyper::Uri = if base.ends_with('/') {
        format!("{base}{name}").parse()?
    } else {
        format!("{base}/{name}").parse()?
    };
    let response = client
        .get(url)
        .await
        .map_err(|err| anyhow::anyhow!("GET {name}: {err}"))?;
    if !response.status().is_success() {
        anyhow::bail!("GET {name} returned {}", response.status());
    }
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|err| anyhow::anyhow!("reading {name}: {err}"))?
        .to_bytes();

    let tmp = spool.join(format!(".{name}.part"));
    tokio::fs::write(&tmp, &body).await?;
    tokio::fs::rename(&tmp, spool.join(name)).await?;
    Ok(body.len() as u64)
}

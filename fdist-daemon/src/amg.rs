// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! The ingestion worker: watches the configured source directories,
//! collects matching files into staging batches, runs the per-destination
//! handling options over them and queues the result for the transfer
//! worker.

use crate::dirconfig::{DirConfig, DirEntry};
use crate::job::JobManifest;
use fdist_common::config::Config;
use fdist_common::fifo;
use fdist_common::layout::WorkDir;
use fdist_options::mask::MaskGroup;
use fdist_options::{parse_options, run_pipeline, Batch, PipelineContext, RuleBook};
use fdist_status::{dir_flag, Arena, DirRecord, HostRecord, LockMode};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Where retrieved files of a remote directory surface locally.
pub fn retrieved_spool(work_dir: &WorkDir, alias: &str) -> PathBuf {
    work_dir.root().join("files/incoming/retrieved").join(alias)
}

/// The local directory an entry is scanned from.
pub fn watch_path(work_dir: &WorkDir, entry: &DirEntry) -> PathBuf {
    entry
        .local_path()
        .unwrap_or_else(|| retrieved_spool(work_dir, &entry.alias))
}

pub async fn run(work_dir: &WorkDir) -> anyhow::Result<i32> {
    let config = Config::load(&work_dir.config_file());
    let dir_config = DirConfig::load(&work_dir.root().join("etc/DIR_CONFIG.json"));
    let rules = RuleBook::load(&work_dir.rename_rule_file());
    let mut commands = fifo::CommandReader::open(&work_dir.worker_cmd_fifo("AMG"))?;

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

    // Make sure the retrieval spools exist before the first scan.
    for entry in &dir_config.dirs {
        if entry.is_remote() {
            std::fs::create_dir_all(retrieved_spool(work_dir, &entry.alias))?;
        }
    }

    if let Err(err) = fifo::send(&work_dir.cmd_fifo(), fifo::Opcode::AmgReady) {
        debug!("could not report readiness: {err}");
    }
    info!("ingestion worker running, {} directories", dir_config.dirs.len());

    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
    let mut rescan = tokio::time::interval(config.dir_rescan_time);
    loop {
        tokio::select! {
            _ = rescan.tick() => {
                if fsa.is_stale()? {
                    fsa = fsa.reattach()?;
                }
                if fra.is_stale()? {
                    fra = fra.reattach()?;
                }
                for (dir_pos, entry) in dir_config.dirs.iter().enumerate() {
                    if let Err(err) =
                        scan_one_dir(work_dir, &dir_config, entry, dir_pos, &rules, &mut fsa, &mut fra)
                    {
                        warn!("scan of {} failed: {err}", entry.alias);
                    }
                }
            }
            _ = hangup.recv() => {
                info!("SIGHUP received, asking for a restart");
                return Ok(fdist_common::exit_code::RESTART_SIGHUP);
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {
                for opcode in commands.drain()? {
                    match opcode {
                        fifo::Opcode::Stop | fifo::Opcode::QuickStop | fifo::Opcode::Shutdown => {
                            info!("ingestion worker stopping");
                            return Ok(fdist_common::exit_code::SUCCESS);
                        }
                        fifo::Opcode::IsAlive => {
                            _ = fifo::send(&work_dir.cmd_fifo(), fifo::Opcode::AmgReady);
                        }
                        other => debug!("ignoring {other:?}"),
                    }
                }
            }
        }
    }
}

fn mask_groups(entry: &DirEntry) -> Vec<MaskGroup> {
    if entry.file_masks.is_empty() {
        vec![MaskGroup::new(vec!["*".to_string()])]
    } else {
        entry
            .file_masks
            .iter()
            .map(|group| MaskGroup::new(group.clone()))
            .collect()
    }
}

/// One scan pass over one source directory: collect, transform, queue.
fn scan_one_dir(
    work_dir: &WorkDir,
    dir_config: &DirConfig,
    entry: &DirEntry,
    dir_pos: usize,
    rules: &RuleBook,
    fsa: &mut Arena<HostRecord>,
    fra: &mut Arena<DirRecord>,
) -> anyhow::Result<()> {
    let source = watch_path(work_dir, entry);
    let masks = mask_groups(entry);
    let accept_dot_files = entry.accept_dot_files;

    let mut collected = Vec::new();
    let mut collected_bytes = 0u64;
    let entries = match std::fs::read_dir(&source) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for dirent in entries {
        let dirent = dirent?;
        let name = dirent.file_name().to_string_lossy().into_owned();
        let meta = match dirent.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                warn!("can't access {name}: {err}");
                continue;
            }
        };
        if !meta.is_file() {
            continue;
        }
        if !fdist_options::check_name(&name, accept_dot_files, &masks) {
            continue;
        }
        collected.push((name, meta.len()));
        collected_bytes += meta.len();
    }
    if collected.is_empty() {
        return Ok(());
    }

    let staging = stage_batch(work_dir, entry, &source, &collected)?;
    debug!(
        "collected {} files ({collected_bytes} bytes) from {}",
        collected.len(),
        entry.alias
    );

    // Directory bookkeeping under the directory lock.
    {
        let _guard = fra.lock_record(dir_pos, LockMode::Exclusive)?;
        let record = fra.get_mut(dir_pos)?;
        record.files_received += collected.len() as u32;
        record.bytes_received += collected_bytes;
    }

    let mut batch = Batch::from_dir(&staging)?;
    let options = parse_options(&entry.options);
    let ctx = PipelineContext {
        rules,
        counter_file: work_dir.counter_file(),
        crc_dir: work_dir.crc_dir(),
        job_name: entry.alias.clone(),
    };
    let meta = run_pipeline(&mut batch, &options, &ctx)?;

    if batch.files_to_send() == 0 {
        debug!("pipeline consumed the whole batch of {}", entry.alias);
        std::fs::remove_dir_all(&staging)?;
        return Ok(());
    }

    JobManifest::new(&entry.host, &entry.alias, &meta).write(&staging)?;

    // The host owns a queue counter so the supervisor can see depth.
    if let Some(host_pos) = dir_config.host_index(&entry.host) {
        let _guard = fsa.lock_record(host_pos, LockMode::Exclusive)?;
        let record = fsa.get_mut(host_pos)?;
        record.jobs_queued += 1;
    } else {
        warn!("batch for unknown host {} left unqueued", entry.host);
    }
    Ok(())
}

/// Move the collected files out of the source directory into a fresh
/// staging directory under the outgoing spool.
fn stage_batch(
    work_dir: &WorkDir,
    entry: &DirEntry,
    source: &Path,
    collected: &[(String, u64)],
) -> anyhow::Result<PathBuf> {
    let staging = work_dir.outgoing_dir().join(format!(
        "{}_{}_{}",
        entry.host,
        entry.alias,
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
    ));
    std::fs::create_dir_all(&staging)?;
    for (name, _) in collected {
        let from = source.join(name);
        let to = staging.join(name);
        if let Err(err) = std::fs::rename(&from, &to) {
            // Cross-device sources fall back to copy-and-unlink.
            if err.raw_os_error() == Some(libc::EXDEV) {
                std::fs::copy(&from, &to)?;
                std::fs::remove_file(&from)?;
            } else {
                warn!("failed to move {name} into the batch: {err}");
            }
        }
    }
    Ok(staging)
}

/// True when the directory policy wants a full on-disk recount.
pub fn wants_full_recount(record: &DirRecord, now: i64, rescan_secs: i64) -> bool {
    record.fsa_pos != -1
        && record.flag_set(dir_flag::MAX_COPIED)
        && (now - record.last_retrieval) < 2 * rescan_secs
}

// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! The supervisor: brings the worker family up in order, keeps it alive,
//! enforces the global back-pressure, and takes it down again in one
//! piece.

use crate::dirconfig::DirConfig;
use crate::hostcheck;
use crate::spawn::{self, ExitClass};
use crate::system_data::SystemData;
use crate::workers::{self, WorkerDef, AMG, SYSTEM_LOG};
use fdist_common::config::Config;
use fdist_common::event::{self, EventAction};
use fdist_common::layout::WorkDir;
use fdist_common::fifo::{self, Opcode};
use fdist_status::records::feature_flag;
use fdist_status::{
    proc_state, ActiveFile, Arena, DirRecord, HostRecord, StatusRecord, NO_OF_PROCESS,
};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Main loop cadence.
pub const RESCAN_TIME: Duration = Duration::from_secs(10);
/// How long `claim` watches a prior daemon's heartbeat.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(25);
/// Grace period for workers during shutdown.
const MAX_SHUTDOWN_TIME: Duration = Duration::from_secs(30);
const FULL_DIR_CHECK_INTERVAL: i64 = 300;
const ACTION_DIR_CHECK_INTERVAL: i64 = 60;

/// Link-count head room on the outgoing spool.
pub const STOP_AMG_THRESHOLD: i64 = 100;
pub const START_AMG_THRESHOLD: i64 = 300;
/// Directories of the spool that are always there.
pub const DIRS_IN_FILE_DIR: i64 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Startup,
    NoneRunning,
    All,
    AmgOnly,
    FdOnly,
}

/// The decision of one back-pressure evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureAction {
    StopAmg,
    StartAmg,
    Leave,
}

/// Pure decision function so the thresholds stay testable: stop the
/// ingestion above the high water mark, restart it below the low one.
pub fn evaluate_backpressure(
    nlink: i64,
    link_max: i64,
    stop_threshold: i64,
    start_threshold: i64,
    reserved_dirs: i64,
    amg_alive: bool,
    auto_amg_stop: bool,
) -> BackpressureAction {
    if nlink > link_max - stop_threshold - reserved_dirs && amg_alive {
        BackpressureAction::StopAmg
    } else if auto_amg_stop && !amg_alive && nlink <= link_max - start_threshold {
        BackpressureAction::StartAmg
    } else {
        BackpressureAction::Leave
    }
}

pub struct Supervisor {
    work_dir: WorkDir,
    config: Config,
    commands: fifo::CommandReader,
    active: ActiveFile,
    status: Arena<StatusRecord>,
    fsa: Arena<HostRecord>,
    fra: Arena<DirRecord>,
    pids: [i32; NO_OF_PROCESS],
    state: SupervisorState,
    auto_amg_stop: bool,
    saved_cores: u32,
    link_max: i64,
    month_check_time: i64,
    full_dir_check_time: i64,
    action_dir_check_time: i64,
    action_dir_mtime: i64,
    current_month: u32,
}

impl Supervisor {
    /// Acquire the working directory and bring the whole family up.
    pub fn start(work_dir: WorkDir) -> anyhow::Result<Supervisor> {
        work_dir.ensure_subtree()?;
        let config = Config::load(&work_dir.config_file());
        let active = ActiveFile::claim(&work_dir.active_file(), HEARTBEAT_TIMEOUT)?;

        let dir_config = DirConfig::load(&work_dir.root().join("etc/DIR_CONFIG.json"));
        let mut status: Arena<StatusRecord> = Arena::create(&work_dir.status_file(), 1, 0)?;
        let fsa = dir_config.build_fsa(&work_dir.fsa_file())?;
        let fra = dir_config.build_fra(
            &work_dir.fra_file(),
            config.max_copied_files,
            config.max_copied_file_size,
        )?;

        let now = chrono::Utc::now();
        {
            let record = status.get_mut(0)?;
            if let Some(data) = SystemData::load(&work_dir.system_data_file()) {
                data.restore_into(record);
            }
            record.start_time = now.timestamp();
            record.set_work_dir(&work_dir.root().to_string_lossy());
            let hostname = nix::unistd::gethostname()?;
            record.set_hostname(&hostname.to_string_lossy());
            record.user_id = nix::unistd::getuid().as_raw();
        }

        let link_max = nix::unistd::pathconf(
            &work_dir.outgoing_dir(),
            nix::unistd::PathconfVar::LINK_MAX,
        )
        .ok()
        .flatten()
        .unwrap_or(8_i64); // POSIX _POSIX_LINK_MAX

        let commands = fifo::CommandReader::open(&work_dir.cmd_fifo())?;
        let mut supervisor = Supervisor {
            work_dir,
            config,
            commands,
            active,
            status,
            fsa,
            fra,
            pids: [0; NO_OF_PROCESS],
            state: SupervisorState::Startup,
            auto_amg_stop: false,
            saved_cores: 0,
            link_max,
            month_check_time: (now.timestamp() / 86_400) * 86_400 + 86_400,
            full_dir_check_time: 0,
            action_dir_check_time: 0,
            action_dir_mtime: 0,
            current_month: chrono::Datelike::month(&now),
        };

        for def in workers::WORKERS {
            fifo::create(&supervisor.worker_fifo(def))?;
            supervisor.start_worker(def)?;
        }
        supervisor.state = SupervisorState::All;

        info!(
            "=================> STARTUP <================= (pid {})",
            std::process::id()
        );
        Ok(supervisor)
    }

    fn worker_fifo(&self, def: &WorkerDef) -> std::path::PathBuf {
        // The movers keep their classic upper-case fifo names.
        match def.name {
            "amg" => self.work_dir.worker_cmd_fifo("AMG"),
            "fd" => self.work_dir.worker_cmd_fifo("FD"),
            name => self.work_dir.worker_cmd_fifo(name),
        }
    }

    fn start_worker(&mut self, def: &WorkerDef) -> anyhow::Result<()> {
        let pid = spawn::make_process(def.name, self.work_dir.root())?;
        self.pids[def.slot] = pid;
        self.active.record_pid(def.slot, pid)?;
        self.status.get_mut(0)?.proc_status[def.slot] = proc_state::ON;
        Ok(())
    }

    fn amg_alive(&self) -> bool {
        workers::by_name(AMG)
            .map(|def| self.pids[def.slot] > 0)
            .unwrap_or(false)
    }

    /// Run until shutdown is requested, then take everything down.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(RESCAN_TIME);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.tick()? {
                        break;
                    }
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT, shutting down");
                    break;
                }
            }
        }
        self.shutdown().await
    }

    /// One pass of the main loop. Returns true when shutdown was asked
    /// for.
    pub fn tick(&mut self) -> anyhow::Result<bool> {
        self.active.tick()?;
        self.active.sync()?;

        if self.active.shutdown_requested()? {
            info!("shutdown bit is set, shutting down");
            return Ok(true);
        }

        let now = chrono::Utc::now().timestamp();
        self.reap_and_restart()?;
        self.daily_bookkeeping(now)?;
        self.full_dir_check(now)?;
        self.action_dir_check(now)?;
        self.backpressure_check()?;

        let warn_disabled = self.fsa.feature_flags() & feature_flag::DISABLE_HOST_WARN_TIME != 0;
        if warn_disabled {
            hostcheck::clear_warn_bits(&mut self.fsa)?;
        }
        hostcheck::check_hosts(
            &mut self.fsa,
            &self.work_dir,
            self.link_max,
            warn_disabled,
            now,
        )?;
        fdist_status::reconcile(&self.fsa, &mut self.status)?;

        self.drain_commands()
    }

    fn reap_and_restart(&mut self) -> anyhow::Result<()> {
        for (pid, class) in spawn::reap_children() {
            let Some(slot) = self.pids.iter().position(|&p| p == pid.as_raw()) else {
                debug!("reaped unmanaged pid {pid}");
                continue;
            };
            let Some(def) = workers::by_slot(slot) else {
                continue;
            };
            self.pids[slot] = 0;
            self.active.clear_pid(slot)?;
            match class {
                ExitClass::Normal => {
                    info!("<INIT> normal termination of process {}", def.name);
                    self.status.get_mut(0)?.proc_status[slot] = proc_state::STOPPED;
                }
                ExitClass::UserStop => {
                    self.status.get_mut(0)?.proc_status[slot] = proc_state::STOPPED;
                }
                ExitClass::WantsRestart => {
                    info!("<INIT> restarting {} on its own request", def.name);
                    self.start_worker(def)?;
                }
                ExitClass::Died => {
                    error!("<INIT> process {} has died!", def.name);
                    self.status.get_mut(0)?.proc_status[slot] = proc_state::OFF;
                    spawn::save_core_file(
                        self.work_dir.root(),
                        def.name,
                        &mut self.saved_cores,
                        self.config.saved_core_files,
                    );
                    if def.critical {
                        self.start_worker(def)?;
                        info!("<INIT> have restarted {}", def.name);
                    }
                }
            }
        }
        Ok(())
    }

    /// Once a day flush the rolling counters, and mark month rollovers
    /// in the log.
    fn daily_bookkeeping(&mut self, now: i64) -> anyhow::Result<()> {
        if now <= self.month_check_time {
            return Ok(());
        }
        let status = self.status.get_mut(0)?;
        debug!(
            "fork() syscalls AMG: {} FD: {} => {}",
            status.amg_fork_counter,
            status.fd_fork_counter,
            status.amg_fork_counter + status.fd_fork_counter
        );
        status.amg_fork_counter = 0;
        status.fd_fork_counter = 0;
        debug!("burst counter      : {}", status.burst_counter);
        status.burst_counter = 0;
        debug!("max queue length   : {}", status.max_queue_length);
        status.max_queue_length = 0;
        debug!("directories scanned: {}", status.dir_scans);
        status.dir_scans = 0;
        status.rotate_histories();

        let month = chrono::Datelike::month(&chrono::Utc::now());
        if month != self.current_month {
            info!(
                "=================> {} <=================",
                chrono::Utc::now().format("%B %Y")
            );
            self.current_month = month;
        }
        self.month_check_time = (now / 86_400) * 86_400 + 86_400;
        SystemData::capture(self.status.get(0)?).save(&self.work_dir.system_data_file());
        Ok(())
    }

    /// Recount on-disk files for directories that cap their intake.
    fn full_dir_check(&mut self, now: i64) -> anyhow::Result<()> {
        if now <= self.full_dir_check_time {
            return Ok(());
        }
        let rescan_secs = self.config.dir_rescan_time.as_secs() as i64;
        for index in 0..self.fra.count() {
            let record = self.fra.get(index)?;
            if !crate::amg::wants_full_recount(record, now, rescan_secs) {
                continue;
            }
            let url = record.url().to_string();
            let (files, bytes) = count_files(std::path::Path::new(&url));
            let record = self.fra.get_mut(index)?;
            record.files_in_dir = files;
            record.bytes_in_dir = bytes;
            self.active.tick()?;
            // Bail out if the scans take too long.
            if chrono::Utc::now().timestamp() - now > 30 {
                break;
            }
        }
        self.full_dir_check_time =
            (now / FULL_DIR_CHECK_INTERVAL) * FULL_DIR_CHECK_INTERVAL + FULL_DIR_CHECK_INTERVAL;
        Ok(())
    }

    fn action_dir_check(&mut self, now: i64) -> anyhow::Result<()> {
        if now <= self.action_dir_check_time {
            return Ok(());
        }
        self.action_dir_mtime =
            hostcheck::refresh_success_actions(&mut self.fsa, &self.work_dir, self.action_dir_mtime)?;
        self.action_dir_check_time = (now / ACTION_DIR_CHECK_INTERVAL) * ACTION_DIR_CHECK_INTERVAL
            + ACTION_DIR_CHECK_INTERVAL;
        Ok(())
    }

    /// The link count of the outgoing spool is the back-pressure signal.
    fn backpressure_check(&mut self) -> anyhow::Result<()> {
        let nlink = match std::fs::metadata(self.work_dir.outgoing_dir()) {
            Ok(meta) => std::os::unix::fs::MetadataExt::nlink(&meta) as i64,
            Err(err) => {
                // Possibly network storage having a moment; not fatal.
                error!("failed to stat the outgoing spool: {err}");
                return Ok(());
            }
        };
        match evaluate_backpressure(
            nlink,
            self.link_max,
            STOP_AMG_THRESHOLD,
            START_AMG_THRESHOLD,
            DIRS_IN_FILE_DIR,
            self.amg_alive(),
            self.auto_amg_stop,
        ) {
            BackpressureAction::StopAmg => {
                error!("have stopped AMG, due to too many jobs in system!");
                info!(
                    "will start AMG again when the job counter is less than {}",
                    self.link_max - START_AMG_THRESHOLD + 1
                );
                event::emit(
                    EventAction::AmgStop,
                    "global",
                    format_args!("too many jobs ({nlink}) in system"),
                );
                self.auto_amg_stop = true;
                if let Err(err) = self.send_worker(AMG, Opcode::Stop) {
                    warn!("was not able to stop AMG: {err}");
                }
            }
            BackpressureAction::StartAmg => {
                if let Some(def) = workers::by_name(AMG) {
                    self.start_worker(def)?;
                    error!("have started AMG, that was stopped due to too many jobs in the system!");
                    event::emit(EventAction::AmgStart, "global", format_args!("spool drained"));
                }
                self.auto_amg_stop = false;
            }
            BackpressureAction::Leave => {}
        }
        Ok(())
    }

    fn send_worker(&self, name: &str, opcode: Opcode) -> std::io::Result<()> {
        let def = workers::by_name(name).expect("worker names are static");
        fifo::send(&self.worker_fifo(def), opcode)
    }

    /// Drain the supervisor command fifo. Returns true on SHUTDOWN.
    fn drain_commands(&mut self) -> anyhow::Result<bool> {
        for opcode in self.commands.drain()? {
            self.active.tick()?;
            match opcode {
                Opcode::Shutdown => {
                    info!("shutdown requested via command fifo");
                    return Ok(true);
                }
                Opcode::Stop => {
                    _ = self.send_worker(AMG, Opcode::Stop);
                    _ = self.send_worker("fd", Opcode::Stop);
                    self.state = SupervisorState::NoneRunning;
                }
                Opcode::StopAmg => {
                    _ = self.send_worker(AMG, Opcode::Stop);
                    self.state = match self.state {
                        SupervisorState::All => SupervisorState::FdOnly,
                        _ => SupervisorState::NoneRunning,
                    };
                }
                Opcode::StopFd => {
                    _ = self.send_worker("fd", Opcode::Stop);
                    self.state = match self.state {
                        SupervisorState::All => SupervisorState::AmgOnly,
                        _ => SupervisorState::NoneRunning,
                    };
                }
                Opcode::StartAmg => {
                    if !self.amg_alive() {
                        if let Some(def) = workers::by_name(AMG) {
                            self.start_worker(def)?;
                        }
                    }
                    self.state = match self.state {
                        SupervisorState::FdOnly => SupervisorState::All,
                        _ => SupervisorState::AmgOnly,
                    };
                }
                Opcode::StartFd => {
                    if let Some(def) = workers::by_name("fd") {
                        if self.pids[def.slot] == 0 {
                            self.start_worker(def)?;
                        }
                    }
                    self.state = match self.state {
                        SupervisorState::AmgOnly => SupervisorState::All,
                        _ => SupervisorState::FdOnly,
                    };
                }
                Opcode::AmgReady | Opcode::FdReady => {
                    debug!("{opcode:?} received");
                    if self.state == SupervisorState::Startup {
                        self.state = SupervisorState::All;
                    }
                }
                Opcode::IsAlive => {
                    _ = fifo::send(&self.work_dir.cmd_fifo(), Opcode::Ackn);
                }
                other => debug!("ignoring {other:?} on the supervisor fifo"),
            }
        }
        Ok(false)
    }

    /// Orderly teardown: movers first, the system log sink last.
    async fn shutdown(mut self) -> anyhow::Result<()> {
        info!("initiating shutdown");
        for name in [AMG, "fd"] {
            if let Some(def) = workers::by_name(name) {
                if self.pids[def.slot] > 0 {
                    self.status.get_mut(0)?.proc_status[def.slot] = proc_state::SHUTDOWN;
                    _ = self.send_worker(name, Opcode::Stop);
                }
            }
        }
        for def in workers::WORKERS {
            if def.name != SYSTEM_LOG && self.pids[def.slot] > 0 {
                _ = fifo::send(&self.worker_fifo(def), Opcode::Stop);
            }
        }

        let deadline = tokio::time::Instant::now() + MAX_SHUTDOWN_TIME;
        while tokio::time::Instant::now() < deadline {
            for (pid, _) in spawn::reap_children() {
                if let Some(slot) = self.pids.iter().position(|&p| p == pid.as_raw()) {
                    self.pids[slot] = 0;
                    self.active.clear_pid(slot)?;
                }
            }
            self.active.tick()?;
            let movers_done = [AMG, "fd"].iter().all(|name| {
                workers::by_name(name)
                    .map(|def| self.pids[def.slot] == 0)
                    .unwrap_or(true)
            });
            if movers_done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        // Anything still standing gets the signal treatment.
        for def in workers::WORKERS {
            if def.name == SYSTEM_LOG {
                continue;
            }
            let pid = self.pids[def.slot];
            if pid > 0 {
                warn!("{} ignored the stop, signalling pid {pid}", def.name);
                spawn::send_term(pid);
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        for (pid, _) in spawn::reap_children() {
            if let Some(slot) = self.pids.iter().position(|&p| p == pid.as_raw()) {
                self.pids[slot] = 0;
            }
        }
        for def in workers::WORKERS {
            if def.name != SYSTEM_LOG && self.pids[def.slot] > 0 {
                spawn::send_kill(self.pids[def.slot]);
            }
        }

        let syslog = workers::by_name(SYSTEM_LOG)
            .filter(|def| self.pids[def.slot] > 0)
            .map(|def| self.worker_fifo(def));

        SystemData::capture(self.status.get(0)?).save(&self.work_dir.system_data_file());
        // Clearing the hostname tells external watchers we are gone.
        self.status.get_mut(0)?.clear_hostname();
        self.status.detach(true)?;

        // The system log sink drains last, with a short grace window.
        if let Some(syslog_fifo) = syslog {
            _ = fifo::send(&syslog_fifo, Opcode::Stop);
            tokio::time::sleep(Duration::from_millis(500)).await;
            _ = spawn::reap_children();
        }

        drop(self.active); // unlinks the marker
        info!("shutdown complete");
        Ok(())
    }
}

/// Count regular files and their bytes below one directory.
fn count_files(dir: &std::path::Path) -> (i32, i64) {
    let mut files = 0;
    let mut bytes = 0;
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    files += 1;
                    bytes += meta.len() as i64;
                }
            }
        }
    }
    (files, bytes)
}

/// Ask a running supervisor to shut down, for the `fdistd stop` surface.
pub fn request_shutdown(work_dir: &WorkDir) -> anyhow::Result<()> {
    fifo::send(&work_dir.cmd_fifo(), Opcode::Shutdown)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backpressure_thresholds() {
        // The literal scenario: LINK_MAX 64, stop threshold 4, 6 reserved
        // directories, 55 spool subdirectories (57 links on the dir).
        assert_eq!(
            evaluate_backpressure(57, 64, 4, 100, 6, true, false),
            BackpressureAction::StopAmg
        );
        // At exactly the boundary the ingestion still runs.
        assert_eq!(
            evaluate_backpressure(54, 64, 4, 100, 6, true, false),
            BackpressureAction::Leave
        );
        // Once auto-stopped, a drained spool restarts it.
        assert_eq!(
            evaluate_backpressure(10, 164, 4, 100, 6, false, true),
            BackpressureAction::StartAmg
        );
        // At exactly link_max - start_threshold it comes back.
        assert_eq!(
            evaluate_backpressure(64, 164, 4, 100, 6, false, true),
            BackpressureAction::StartAmg
        );
        // One link above, it stays down.
        assert_eq!(
            evaluate_backpressure(65, 164, 4, 100, 6, false, true),
            BackpressureAction::Leave
        );
        // Not auto-stopped means nothing to restart.
        assert_eq!(
            evaluate_backpressure(10, 164, 4, 100, 6, false, false),
            BackpressureAction::Leave
        );
    }

    #[test]
    fn test_count_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"12345").unwrap();
        std::fs::write(dir.path().join("b"), b"1").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        assert_eq!(count_files(dir.path()), (2, 6));
        assert_eq!(count_files(&dir.path().join("missing")), (0, 0));
    }
}

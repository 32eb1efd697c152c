// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, Subcommand};
use fdist_common::config::Config;
use fdist_common::layout::WorkDir;
use fdist_daemon::{afdd, amg, archive, fd, logsink, supervisor, workers};
use std::path::PathBuf;
use tracing::error;

#[derive(Parser)]
#[command(name = "fdistd", about = "Automatic file distribution daemon")]
struct Cli {
    /// Working directory of the daemon family.
    #[arg(short = 'w', long = "work-dir", global = true)]
    work_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run one managed worker (used by the supervisor, not operators).
    #[command(hide = true)]
    Worker { name: String },
    /// Ask a running daemon to shut down.
    Stop,
}

fn resolve_work_dir(cli: &Cli) -> WorkDir {
    let root = cli
        .work_dir
        .clone()
        .or_else(|| std::env::var_os("FDIST_WORK_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));
    WorkDir::new(root)
}

/// SIGSEGV/SIGBUS dump one line and abort so a core file exists.
extern "C" fn fault_handler(_signum: libc::c_int) {
    const MESSAGE: &[u8] = b"fatal: memory fault, aborting for a core dump\n";
    // Safety: write() and abort() are async-signal-safe.
    unsafe {
        libc::write(2, MESSAGE.as_ptr() as *const libc::c_void, MESSAGE.len());
        libc::abort();
    }
}

fn install_fault_handlers() {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    let fault = SigAction::new(
        SigHandler::Handler(fault_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // Safety: the handler only uses async-signal-safe calls.
    unsafe {
        _ = sigaction(Signal::SIGSEGV, &fault);
        _ = sigaction(Signal::SIGBUS, &fault);
        // The supervisor ignores SIGHUP; workers install their own.
        _ = sigaction(Signal::SIGHUP, &ignore);
    }
}

fn main() {
    let cli = Cli::parse();
    let work_dir = resolve_work_dir(&cli);

    match cli.command {
        Some(Command::Worker { name }) => {
            std::process::exit(worker_main(&work_dir, &name));
        }
        Some(Command::Stop) => {
            if let Err(err) = supervisor::request_shutdown(&work_dir) {
                eprintln!("failed to request shutdown: {err}");
                std::process::exit(1);
            }
        }
        None => {
            std::process::exit(supervisor_main(work_dir));
        }
    }
}

fn supervisor_main(work_dir: WorkDir) -> i32 {
    install_fault_handlers();
    if work_dir.ensure_subtree().is_ok() {
        _ = fdist_common::log::init_file(&work_dir.log_dir(), "DAEMON_LOG");
    } else {
        _ = fdist_common::log::init_stderr();
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return 1;
        }
    };
    runtime.block_on(async {
        let supervisor = match supervisor::Supervisor::start(work_dir) {
            Ok(supervisor) => supervisor,
            Err(err) => {
                error!("startup failed: {err}");
                eprintln!("startup failed: {err}");
                return 1;
            }
        };
        match supervisor.run().await {
            Ok(()) => 0,
            Err(err) => {
                error!("supervisor failed: {err}");
                1
            }
        }
    })
}

fn worker_main(work_dir: &WorkDir, name: &str) -> i32 {
    install_fault_handlers();
    // Workers receive SIGHUP as a restart request.
    {
        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        // Safety: restoring the default disposition only.
        unsafe {
            _ = sigaction(Signal::SIGHUP, &default);
        }
    }
    _ = fdist_common::log::init_file(&work_dir.log_dir(), "DAEMON_LOG");

    let Some(def) = workers::by_name(name) else {
        eprintln!("unknown worker {name}");
        return 1;
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return 1;
        }
    };
    let result = runtime.block_on(async {
        if def.log_sink {
            return logsink::run(work_dir, def.name).await;
        }
        match def.name {
            workers::AMG => amg::run(work_dir).await,
            workers::FD => fd::run(work_dir).await,
            workers::ARCHIVE_WATCH => archive::run(work_dir).await,
            workers::AFDD => {
                let config = Config::load(&work_dir.config_file());
                afdd::run(work_dir, config.tcp_port).await
            }
            other => {
                error!("no implementation for worker {other}");
                Ok(1)
            }
        }
    });
    match result {
        Ok(code) => code,
        Err(err) => {
            error!("worker {name} failed: {err}");
            1
        }
    }
}

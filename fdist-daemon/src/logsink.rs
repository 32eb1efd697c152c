// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! Log sink workers: drain a named pipe into a rolling text log.
//!
//! Every other process writes complete lines into the sink's fifo; the
//! sink owns the log file. That keeps concurrent writers from
//! interleaving partial lines and gives the supervisor one process to
//! restart when a disk fills up.

use fdist_common::fifo;
use fdist_common::layout::WorkDir;
use std::io::Write;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

/// Rotate when the log grows past this many bytes.
const MAX_LOG_SIZE: u64 = 4 * 1024 * 1024;

pub fn fifo_path(work_dir: &WorkDir, sink: &str) -> PathBuf {
    work_dir.root().join(format!("fifo/{}_FIFO", sink.to_ascii_uppercase()))
}

pub fn log_path(work_dir: &WorkDir, sink: &str) -> PathBuf {
    work_dir.log_dir().join(sink.to_ascii_uppercase())
}

/// Run one sink until a STOP arrives on its command fifo.
pub async fn run(work_dir: &WorkDir, sink: &str) -> anyhow::Result<i32> {
    let input_path = fifo_path(work_dir, sink);
    fifo::create(&input_path)?;
    let mut input = tokio::net::unix::pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(&input_path)?;
    let mut commands = fifo::CommandReader::open(&work_dir.worker_cmd_fifo(sink))?;

    let mut output = open_log(work_dir, sink)?;
    let mut written = output.metadata().map(|m| m.len()).unwrap_or(0);
    info!("{sink} sink draining {}", input_path.display());

    let mut buf = vec![0u8; 8192];
    let mut poll = tokio::time::interval(std::time::Duration::from_millis(500));
    loop {
        tokio::select! {
            read = input.read(&mut buf) => {
                match read {
                    Ok(0) => {}
                    Ok(n) => {
                        if let Err(err) = output.write_all(&buf[..n]) {
                            warn!("failed to append to {sink} log: {err}");
                        }
                        written += n as u64;
                        if written > MAX_LOG_SIZE {
                            output = rotate(work_dir, sink, output)?;
                            written = 0;
                        }
                    }
                    Err(err) => {
                        warn!("error reading {sink} fifo: {err}");
                        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    }
                }
            }
            _ = poll.tick() => {
                _ = output.flush();
                for opcode in commands.drain()? {
                    match opcode {
                        fifo::Opcode::Stop | fifo::Opcode::QuickStop | fifo::Opcode::Shutdown => {
                            info!("{sink} sink stopping");
                            _ = output.flush();
                            return Ok(fdist_common::exit_code::SUCCESS);
                        }
                        fifo::Opcode::IsAlive => {}
                        other => warn!("{sink} sink ignoring {other:?}"),
                    }
                }
            }
        }
    }
}

fn open_log(work_dir: &WorkDir, sink: &str) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path(work_dir, sink))
}

/// Shift `LOG` to `LOG.0`, dropping any older `LOG.0`.
fn rotate(
    work_dir: &WorkDir,
    sink: &str,
    current: std::fs::File,
) -> std::io::Result<std::fs::File> {
    drop(current);
    let path = log_path(work_dir, sink);
    let aged = path.with_extension("0");
    if let Err(err) = std::fs::rename(&path, &aged) {
        warn!("failed to rotate {sink} log: {err}");
    }
    open_log(work_dir, sink)
}

/// Append one line to a sink's fifo from any process of the family.
pub fn write_line(work_dir: &WorkDir, sink: &str, line: &str) {
    let path = fifo_path(work_dir, sink);
    let send = || -> std::io::Result<()> {
        use std::os::unix::fs::OpenOptionsExt;
        let mut fifo = std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)?;
        writeln!(fifo, "{line}")
    };
    if let Err(err) = send() {
        // The sink may be restarting; the line is lost but the caller
        // must not block on logging.
        tracing::debug!("dropped a line for the {sink} sink: {err}");
    }
}

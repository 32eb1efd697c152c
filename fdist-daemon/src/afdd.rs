// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! The TCP status responder: a one-line-per-command peephole into the
//! running daemon for scripts and monitoring.

use fdist_common::fifo;
use fdist_common::layout::WorkDir;
use fdist_status::{Arena, StatusRecord};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub async fn run(work_dir: &WorkDir, port: u16) -> anyhow::Result<i32> {
    let mut commands = fifo::CommandReader::open(&work_dir.worker_cmd_fifo("afdd"))?;
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!("status responder listening on port {port}");

    let mut poll = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        debug!("status connection from {peer}");
                        let status_file = work_dir.status_file();
                        tokio::spawn(async move {
                            if let Err(err) = serve(socket, &status_file).await {
                                debug!("status connection ended: {err}");
                            }
                        });
                    }
                    Err(err) => warn!("accept() failed: {err}"),
                }
            }
            _ = poll.tick() => {
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

async fn serve(socket: TcpStream, status_file: &std::path::Path) -> anyhow::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "STAT" => {
                let reply = match Arena::<StatusRecord>::attach(status_file) {
                    Ok(arena) => {
                        let status = *arena.get(0)?;
                        format!(
                            "UP {} jobs_in_queue {} max_queue {}\n",
                            status.hostname(),
                            status.jobs_in_queue,
                            status.max_queue_length
                        )
                    }
                    Err(err) => format!("NO STATUS: {err}\n"),
                };
                write_half.write_all(reply.as_bytes()).await?;
            }
            "PING" => write_half.write_all(b"PONG\n").await?,
            "QUIT" | "" => break,
            other => {
                write_half
                    .write_all(format!("UNKNOWN COMMAND {other}\n").as_bytes())
                    .await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_ping_and_stat() {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = WorkDir::new(dir.path());
        work_dir.ensure_subtree().unwrap();
        let mut status: Arena<StatusRecord> =
            Arena::create(&work_dir.status_file(), 1, 0).unwrap();
        status.get_mut(0).unwrap().set_hostname("teststand");
        status.get_mut(0).unwrap().jobs_in_queue = 7;
        drop(status);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let server_dir = work_dir.clone();
        tokio::spawn(async move {
            _ = run(&server_dir, port).await;
        });
        tokio::time::sleep(Duration::from_millis(300)).await;

        let mut socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        socket.write_all(b"PING\nSTAT\nQUIT\n").await.unwrap();
        let mut reply = String::new();
        socket.read_to_string(&mut reply).await.unwrap();
        assert!(reply.contains("PONG"));
        assert!(reply.contains("teststand"));
        assert!(reply.contains("jobs_in_queue 7"));
    }
}

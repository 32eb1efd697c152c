// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! Single-byte command protocol over named pipes.
//!
//! Each supervisor/worker pair shares one fifo per direction. Messages are
//! single opcode bytes; anything unknown on the wire is reported, not
//! silently dropped, so a protocol skew between binaries is visible in the
//! logs.

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Stop = b'S',
    QuickStop = b'Q',
    Shutdown = b'X',
    Ackn = b'A',
    StartAmg = b'a',
    StartFd = b'f',
    StopAmg = b'm',
    StopFd = b'd',
    AmgReady = b'R',
    FdReady = b'r',
    IsAlive = b'i',
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        Some(match byte {
            b'S' => Opcode::Stop,
            b'Q' => Opcode::QuickStop,
            b'X' => Opcode::Shutdown,
            b'A' => Opcode::Ackn,
            b'a' => Opcode::StartAmg,
            b'f' => Opcode::StartFd,
            b'm' => Opcode::StopAmg,
            b'd' => Opcode::StopFd,
            b'R' => Opcode::AmgReady,
            b'r' => Opcode::FdReady,
            b'i' => Opcode::IsAlive,
            _ => return None,
        })
    }
}

/// Create the fifo if it does not exist yet. An existing fifo is reused;
/// an existing non-fifo at the path is an error.
pub fn create(path: &Path) -> io::Result<()> {
    match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => {
            let meta = std::fs::metadata(path)?;
            if std::os::unix::fs::FileTypeExt::is_fifo(&meta.file_type()) {
                Ok(())
            } else {
                Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a fifo", path.display()),
                ))
            }
        }
        Err(err) => Err(io::Error::from_raw_os_error(err as i32)),
    }
}

/// Reader end of a command fifo. Opened read-write so the descriptor stays
/// valid while no writer is attached, and non-blocking so the supervisor's
/// poll never stalls on an empty pipe.
#[derive(Debug)]
pub struct CommandReader {
    file: File,
}

impl CommandReader {
    pub fn open(path: &Path) -> io::Result<CommandReader> {
        create(path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        Ok(CommandReader { file })
    }

    /// Drain every opcode currently buffered in the pipe.
    pub fn drain(&mut self) -> io::Result<Vec<Opcode>> {
        let mut buf = [0u8; 64];
        let mut out = Vec::new();
        loop {
            match self.file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for &byte in &buf[..n] {
                        match Opcode::from_byte(byte) {
                            Some(op) => out.push(op),
                            None => {
                                tracing::warn!("unknown opcode byte 0x{byte:02x} on command fifo")
                            }
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }
}

/// Send a single opcode. The fifo is opened per send; a missing reader
/// (ENXIO) is surfaced so the caller can decide whether the peer matters.
pub fn send(path: &Path, opcode: Opcode) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    file.write_all(&[opcode as u8])
}

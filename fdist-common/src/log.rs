// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! Log setup for the daemon family.
//!
//! Workers log through `tracing`; the classic sign taxonomy (`INFO`,
//! `CONFIG`, `WARN`, `ERROR`, `FATAL`, `DEBUG`, `OFFLINE`) maps onto
//! tracing levels, with `CONFIG` and `OFFLINE` carried as an explicit
//! `sign` field since they have no level of their own.

use std::io;
use std::path::Path;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSign {
    Info,
    Config,
    Warn,
    Error,
    Fatal,
    Debug,
    Offline,
}

impl LogSign {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSign::Info => "I",
            LogSign::Config => "C",
            LogSign::Warn => "W",
            LogSign::Error => "E",
            LogSign::Fatal => "F",
            LogSign::Debug => "D",
            LogSign::Offline => "O",
        }
    }
}

/// Install the global subscriber writing to stderr. Used by workers whose
/// stderr the supervisor redirects into the log sink.
pub fn init_stderr() -> Result<(), Box<dyn std::error::Error>> {
    tracing_log::LogTracer::init()?;
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Install the global subscriber appending to a file under the log
/// directory. The supervisor itself uses this.
pub fn init_file(log_dir: &Path, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing_log::LogTracer::init()?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(name))?;
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

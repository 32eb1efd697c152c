// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! The distribution daemon: the supervisor process and the worker family
//! it manages (ingestion, transfer, log sinks, archive watcher, status
//! responder).

pub mod afdd;
pub mod amg;
pub mod archive;
pub mod dirconfig;
pub mod fd;
pub mod hostcheck;
pub mod job;
pub mod logsink;
pub mod spawn;
pub mod supervisor;
pub mod system_data;
pub mod workers;

pub use supervisor::Supervisor;

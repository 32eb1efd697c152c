// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! The fixed set of managed subprocesses.
//!
//! Slot order is startup order: log sinks first so everybody has a place
//! to write, then the archive watcher, then the movers, then the status
//! responder. The slot index doubles as the position in the process
//! table and in the global status record.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerDef {
    /// Slot in the process table and the global status record.
    pub slot: usize,
    /// Name used on the command line and in the logs.
    pub name: &'static str,
    /// Critical workers are restarted unconditionally when they die.
    pub critical: bool,
    /// Log sinks drain a fifo; they get their fifo created up front.
    pub log_sink: bool,
}

pub const AMG: &str = "amg";
pub const FD: &str = "fd";
pub const SYSTEM_LOG: &str = "system_log";
pub const EVENT_LOG: &str = "event_log";
pub const RECEIVE_LOG: &str = "receive_log";
pub const TRANSFER_LOG: &str = "transfer_log";
pub const TRANSFER_DEBUG_LOG: &str = "transfer_debug_log";
pub const ARCHIVE_WATCH: &str = "archive_watch";
pub const AFDD: &str = "afdd";

/// Startup order. The movers come after everything they depend on.
pub const WORKERS: &[WorkerDef] = &[
    WorkerDef { slot: 2, name: SYSTEM_LOG, critical: true, log_sink: true },
    WorkerDef { slot: 3, name: EVENT_LOG, critical: true, log_sink: true },
    WorkerDef { slot: 4, name: RECEIVE_LOG, critical: true, log_sink: true },
    WorkerDef { slot: 5, name: TRANSFER_LOG, critical: true, log_sink: true },
    WorkerDef { slot: 6, name: TRANSFER_DEBUG_LOG, critical: true, log_sink: true },
    WorkerDef { slot: 7, name: ARCHIVE_WATCH, critical: true, log_sink: false },
    WorkerDef { slot: 0, name: AMG, critical: false, log_sink: false },
    WorkerDef { slot: 1, name: FD, critical: true, log_sink: false },
    WorkerDef { slot: 8, name: AFDD, critical: true, log_sink: false },
];

pub fn by_name(name: &str) -> Option<&'static WorkerDef> {
    WORKERS.iter().find(|def| def.name == name)
}

pub fn by_slot(slot: usize) -> Option<&'static WorkerDef> {
    WORKERS.iter().find(|def| def.slot == slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdist_status::NO_OF_PROCESS;

    #[test]
    fn test_slots_are_unique_and_in_range() {
        let mut seen = std::collections::HashSet::new();
        for def in WORKERS {
            assert!(def.slot < NO_OF_PROCESS, "{} slot out of range", def.name);
            assert!(seen.insert(def.slot), "{} reuses a slot", def.name);
        }
    }

    #[test]
    fn test_log_sinks_start_before_movers() {
        let first_mover = WORKERS.iter().position(|def| def.name == AMG).unwrap();
        for (index, def) in WORKERS.iter().enumerate() {
            if def.log_sink {
                assert!(index < first_mover, "{} starts after the movers", def.name);
            }
        }
    }

    #[test]
    fn test_lookup() {
        assert_eq!(by_name("amg").unwrap().slot, 0);
        assert_eq!(by_slot(1).unwrap().name, "fd");
        assert!(by_name("nope").is_none());
    }
}

// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! Stable event codes for operator-visible state transitions.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    ErrorStart,
    ErrorEnd,
    WarnTimeSet,
    WarnTimeUnset,
    StopQueue,
    StartQueue,
    AmgStop,
    AmgStart,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::ErrorStart => "ERROR_START",
            EventAction::ErrorEnd => "ERROR_END",
            EventAction::WarnTimeSet => "WARN_TIME_SET",
            EventAction::WarnTimeUnset => "WARN_TIME_UNSET",
            EventAction::StopQueue => "STOP_QUEUE",
            EventAction::StartQueue => "START_QUEUE",
            EventAction::AmgStop => "AMG_STOP",
            EventAction::AmgStart => "AMG_START",
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emit an event line. Events carry a fixed `event=` prefix so external
/// tooling can grep the log stream for them.
pub fn emit(action: EventAction, subject: &str, detail: fmt::Arguments<'_>) {
    tracing::info!(event = action.as_str(), subject, "{detail}");
}

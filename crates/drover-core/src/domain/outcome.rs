//! Outcome model: what a raw wait status means for scheduling.
//!
//! Workers report the unix wait status as-is; interpretation lives here so
//! both sides agree on it.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use serde::{Deserialize, Serialize};

/// Wait status reported when the agent could not start the task at all
/// (exit code 127, like a shell).
pub const SPAWN_FAILED_STATUS: i32 = 127 << 8;

/// Status booked for an attempt whose worker vanished without reporting.
/// Reads as "killed by SIGKILL".
pub const WORKER_LOST_STATUS: i32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Success,
    Failure,
}

/// Decoded wait status of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub raw: i32,
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn from_raw(raw: i32) -> Self {
        let status = ExitStatus::from_raw(raw);
        Self {
            raw,
            code: status.code(),
            signal: status.signal(),
        }
    }

    /// Success means a normal exit with code 0. Signals are failures.
    pub fn kind(&self) -> OutcomeKind {
        match self.code {
            Some(0) => OutcomeKind::Success,
            _ => OutcomeKind::Failure,
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind() == OutcomeKind::Success
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(sig)) => format!("killed by signal {sig}"),
            (None, None) => format!("raw status {}", self.raw),
        }
    }
}

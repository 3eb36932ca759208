//! Protocol vocabulary shared by the coordinator and the worker agent.
//!
//! Sequence (all numbers are u64 frames):
//!
//! ```text
//! handshake  W: job id
//!            C: slot ordinal, working dir
//!            W: 1 (dir ok) | 0 (mismatch, connection ends)
//!            C: temp-file base
//!            W: stdout path, stderr path, meta path
//! idle       W: 0            C: 0 + assignment json  (W: start record json)
//!                            C: 1 (wakeup, W sends 0 again)
//!                            C: 2 (terminate)
//! finished   W: 1, wait status, run record json      C: 0
//! running    W: 2                                     C: 0
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::{Command, GroupId, TaskRef};

pub const ACK: u64 = 0;
pub const CWD_OK: u64 = 1;
pub const CWD_MISMATCH: u64 = 0;

/// First frame of every steady-state exchange, sent by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Finished,
    Running,
    Unknown(u64),
}

impl WorkerStatus {
    pub fn from_wire(value: u64) -> Self {
        match value {
            0 => WorkerStatus::Idle,
            1 => WorkerStatus::Finished,
            2 => WorkerStatus::Running,
            other => WorkerStatus::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u64 {
        match self {
            WorkerStatus::Idle => 0,
            WorkerStatus::Finished => 1,
            WorkerStatus::Running => 2,
            WorkerStatus::Unknown(v) => v,
        }
    }
}

/// Coordinator's answer to an idle report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleReply {
    Assign,
    Wakeup,
    Terminate,
}

impl IdleReply {
    pub fn from_wire(value: u64) -> Option<Self> {
        match value {
            0 => Some(IdleReply::Assign),
            1 => Some(IdleReply::Wakeup),
            2 => Some(IdleReply::Terminate),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u64 {
        match self {
            IdleReply::Assign => 0,
            IdleReply::Wakeup => 1,
            IdleReply::Terminate => 2,
        }
    }
}

/// Task payload sent with `IdleReply::Assign`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub group: GroupId,
    pub task: u32,
    /// 1-based number of the attempt being started.
    pub attempt: u32,
    pub command: Command,
}

impl Assignment {
    pub fn task_ref(&self) -> TaskRef {
        TaskRef::new(self.group, self.task)
    }
}

/// Per-slot capture files, derived from the temp-file base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturePaths {
    pub out: PathBuf,
    pub err: PathBuf,
    pub meta: PathBuf,
}

impl CapturePaths {
    pub fn from_base(base: &Path) -> Self {
        let base = base.to_string_lossy();
        Self {
            out: PathBuf::from(format!("{base}_out.data")),
            err: PathBuf::from(format!("{base}_err.data")),
            meta: PathBuf::from(format!("{base}.meta")),
        }
    }
}

/// Wait statuses travel as the u32 bit pattern widened to u64.
pub fn status_to_wire(status: i32) -> u64 {
    status as u32 as u64
}

pub fn status_from_wire(value: u64) -> i32 {
    value as u32 as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, WorkerStatus::Idle)]
    #[case(1, WorkerStatus::Finished)]
    #[case(2, WorkerStatus::Running)]
    #[case(9, WorkerStatus::Unknown(9))]
    fn worker_status_codes(#[case] raw: u64, #[case] status: WorkerStatus) {
        assert_eq!(WorkerStatus::from_wire(raw), status);
        assert_eq!(status.to_wire(), raw);
    }

    #[test]
    fn idle_reply_rejects_unknown_codes() {
        assert_eq!(IdleReply::from_wire(1), Some(IdleReply::Wakeup));
        assert_eq!(IdleReply::from_wire(3), None);
    }

    #[test]
    fn negative_status_survives_widening() {
        assert_eq!(status_from_wire(status_to_wire(-1)), -1);
        assert_eq!(status_from_wire(status_to_wire(256)), 256);
    }

    #[test]
    fn capture_paths_follow_base() {
        let paths = CapturePaths::from_base(Path::new("/scratch/run_3"));
        assert_eq!(paths.out, PathBuf::from("/scratch/run_3_out.data"));
        assert_eq!(paths.err, PathBuf::from("/scratch/run_3_err.data"));
        assert_eq!(paths.meta, PathBuf::from("/scratch/run_3.meta"));
    }
}

//! Run record: one line of execution history per finished attempt.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{GroupId, RunId, SlotId};
use super::outcome::ExitOutcome;

/// A single attempt of a task, with byte ranges into the shared capture files.
///
/// Written once to the meta log and never mutated afterwards. The worker
/// sends a partial record when a task starts (no end offsets, no status)
/// and the final one when it finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub group: GroupId,
    pub task: u32,
    pub attempt: u32,
    pub slot: SlotId,

    pub out_path: PathBuf,
    pub err_path: PathBuf,
    pub out_start: u64,
    pub out_end: Option<u64>,
    pub err_start: u64,
    pub err_end: Option<u64>,

    /// Raw wait status.
    pub status: Option<i32>,

    /// Script file written for `Command::Script` tasks.
    pub script: Option<PathBuf>,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn outcome(&self) -> Option<ExitOutcome> {
        self.status.map(ExitOutcome::from_raw)
    }

    pub fn finish(&mut self, status: i32, out_end: u64, err_end: u64) {
        self.status = Some(status);
        self.out_end = Some(out_end);
        self.err_end = Some(err_end);
        self.finished_at = Some(Utc::now());
    }

    pub fn stdout_len(&self) -> Option<u64> {
        self.out_end.map(|end| end.saturating_sub(self.out_start))
    }

    pub fn stderr_len(&self) -> Option<u64> {
        self.err_end.map(|end| end.saturating_sub(self.err_start))
    }
}

#[cfg(test)]
pub(crate) fn sample_record(group: u32, task: u32) -> RunRecord {
    RunRecord {
        run_id: RunId::generate(),
        group: GroupId(group),
        task,
        attempt: 1,
        slot: SlotId(0),
        out_path: PathBuf::from("tmp_0_out.data"),
        err_path: PathBuf::from("tmp_0_err.data"),
        out_start: 10,
        out_end: None,
        err_start: 4,
        err_end: None,
        status: None,
        script: None,
        started_at: Utc::now(),
        finished_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_fills_end_offsets() {
        let mut record = sample_record(1, 0);
        assert_eq!(record.stdout_len(), None);

        record.finish(0, 42, 4);
        assert_eq!(record.stdout_len(), Some(32));
        assert_eq!(record.stderr_len(), Some(0));
        assert!(record.outcome().unwrap().is_success());
        assert!(record.finished_at.is_some());
    }

    #[test]
    fn record_json_roundtrip() {
        let record = sample_record(2, 5);
        let line = serde_json::to_string(&record).unwrap();
        let back: RunRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back, record);
    }
}

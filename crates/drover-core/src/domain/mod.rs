//! Domain model (ids, tasks, groups, outcomes, run records).

pub mod ids;
pub mod outcome;
pub mod run_record;
pub mod task;

pub use ids::{ExternalJobId, GroupId, RunId, SlotId, TaskRef};
pub use outcome::{ExitOutcome, OutcomeKind, SPAWN_FAILED_STATUS, WORKER_LOST_STATUS};
pub use run_record::RunRecord;
pub use task::{Command, Task, TaskGroup};

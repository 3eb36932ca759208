//! Retry policy: decides what a failed attempt means for the pipeline.

use crate::domain::Task;

/// The next action after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Attempts remain: put the task back into Ready.
    Requeue { attempts: u32, limit: u32 },

    /// Out of attempts: the pipeline run is failed.
    GiveUp { attempts: u32, limit: u32 },

    /// Out of attempts, but the task is best-effort: record it as completed.
    Forgive { attempts: u32, limit: u32 },
}

/// Attempt-bound retry policy.
///
/// The budget is per coordinator run: `failures` counts the failed attempts
/// of this run only (including the one being decided), so a resumed graph
/// gives every unfinished task a fresh set of attempts. `task.attempts` is
/// the lifetime counter and plays no part in the decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy;

impl RetryPolicy {
    pub fn decide(&self, task: &Task, group_max_attempts: u32, failures: u32) -> Decision {
        let limit = task.attempt_limit(group_max_attempts);
        let attempts = failures;
        if attempts < limit {
            Decision::Requeue { attempts, limit }
        } else if task.ignore_failure {
            Decision::Forgive { attempts, limit }
        } else {
            Decision::GiveUp { attempts, limit }
        }
    }
}

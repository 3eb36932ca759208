//! Progress views: what the coordinator logs and what `status` prints.

use serde::{Deserialize, Serialize};

use crate::domain::{GroupId, TaskGroup};
use crate::queue::DependencyEngine;

/// Scheduler counters, logged whenever they change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounts {
    pub ready: usize,
    pub running: usize,
    pub unfinished: u64,
}

impl ProgressCounts {
    pub fn of(engine: &DependencyEngine) -> Self {
        Self {
            ready: engine.ready_len(),
            running: engine.running_len(),
            unfinished: engine.unfinished_total(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupProgress {
    pub group: GroupId,
    pub tasks: usize,
    pub completed: usize,
    /// Tasks with at least one failed attempt that are still not completed.
    pub failing: usize,
    pub dependencies: Vec<GroupId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSummary {
    pub groups: usize,
    pub groups_complete: usize,
    pub tasks: usize,
    pub completed: usize,
    pub per_group: Vec<GroupProgress>,
}

impl GraphSummary {
    pub fn of(groups: &[TaskGroup]) -> Self {
        let per_group: Vec<GroupProgress> = groups
            .iter()
            .map(|g| GroupProgress {
                group: g.id,
                tasks: g.tasks.len(),
                completed: g.tasks.len() - g.unfinished(),
                failing: g
                    .tasks
                    .iter()
                    .filter(|t| !t.completed && t.attempts > 0)
                    .count(),
                dependencies: g.dependencies.clone(),
            })
            .collect();
        Self {
            groups: groups.len(),
            groups_complete: groups.iter().filter(|g| g.is_complete()).count(),
            tasks: per_group.iter().map(|p| p.tasks).sum(),
            completed: per_group.iter().map(|p| p.completed).sum(),
            per_group,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Command, Task};

    fn task(completed: bool, attempts: u32) -> Task {
        let mut t = Task::new(Command::Exec {
            argv: vec!["true".into()],
        });
        t.completed = completed;
        t.attempts = attempts;
        t
    }

    #[test]
    fn summary_counts_completion_and_failures() {
        let a = TaskGroup::new(GroupId(0), vec![task(true, 1), task(true, 2)]);
        let mut b = TaskGroup::new(GroupId(1), vec![task(false, 1), task(false, 0), task(true, 1)]);
        b.dependencies = vec![GroupId(0)];

        let summary = GraphSummary::of(&[a, b]);
        assert_eq!(summary.groups, 2);
        assert_eq!(summary.groups_complete, 1);
        assert_eq!((summary.tasks, summary.completed), (5, 3));
        assert_eq!(summary.per_group[1].failing, 1);
        assert_eq!(summary.per_group[1].dependencies, vec![GroupId(0)]);
    }

    #[test]
    fn progress_reflects_engine_sets() {
        let groups = vec![TaskGroup::new(GroupId(0), vec![task(false, 0), task(false, 0)])];
        let mut engine = DependencyEngine::from_groups(&groups);
        let first = engine.pop_ready().unwrap();
        engine.start(first, false);

        assert_eq!(
            ProgressCounts::of(&engine),
            ProgressCounts {
                ready: 1,
                running: 1,
                unfinished: 2
            }
        );
    }
}

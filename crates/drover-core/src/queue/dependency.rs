//! Dependency engine: group counters plus the Ready / Running sets.
//!
//! Design:
//! - `missing[g]`: number of g's dependency groups that are not yet complete
//! - `unfinished[g]`: number of g's tasks not yet completed
//! - Invariant: Ready ∩ Running = ∅
//! - A group is activated (its tasks enter Ready) exactly once, when
//!   `missing` reaches zero. Groups with `missing == 0` at load are active.

use std::collections::BTreeSet;

use crate::domain::{GroupId, TaskGroup, TaskRef};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct GroupCounters {
    missing: u32,
    unfinished: u32,
}

/// Scheduling state derived from the graph mirror.
///
/// The engine never touches `Task` records; callers own the mirror and pass
/// it in when activation needs to enumerate a group's tasks.
#[derive(Debug, Default)]
pub struct DependencyEngine {
    counters: Vec<GroupCounters>,
    reverse: Vec<Vec<GroupId>>,
    ready: BTreeSet<TaskRef>,
    running: BTreeSet<TaskRef>,
    deep_sleep_running: usize,
}

impl DependencyEngine {
    /// Build counters from the loaded graph and seed Ready.
    pub fn from_groups(groups: &[TaskGroup]) -> Self {
        let mut counters: Vec<GroupCounters> = groups
            .iter()
            .map(|g| GroupCounters {
                missing: 0,
                unfinished: g.unfinished() as u32,
            })
            .collect();
        let reverse: Vec<Vec<GroupId>> = groups
            .iter()
            .map(|g| g.reverse_dependencies.clone())
            .collect();

        for (index, group) in groups.iter().enumerate() {
            if counters[index].unfinished == 0 {
                continue;
            }
            for rdep in &group.reverse_dependencies {
                if let Some(c) = counters.get_mut(rdep.index()) {
                    c.missing += 1;
                }
            }
        }

        let mut engine = Self {
            counters,
            reverse,
            ..Self::default()
        };
        for group in groups {
            if engine.counters[group.id.index()].missing == 0 {
                engine.ready.extend(group.pending_refs());
            }
        }
        engine
    }

    /// Next task to hand out, in `(group, task)` order.
    pub fn pop_ready(&mut self) -> Option<TaskRef> {
        self.ready.pop_first()
    }

    /// Record an assignment. Returns false if the task was already running.
    pub fn start(&mut self, task: TaskRef, deep_sleep: bool) -> bool {
        self.ready.remove(&task);
        if !self.running.insert(task) {
            return false;
        }
        if deep_sleep {
            self.deep_sleep_running += 1;
        }
        true
    }

    /// The task left its slot (finished, failed, or the worker vanished).
    pub fn finish(&mut self, task: TaskRef, deep_sleep: bool) -> bool {
        if !self.running.remove(&task) {
            return false;
        }
        if deep_sleep {
            self.deep_sleep_running = self.deep_sleep_running.saturating_sub(1);
        }
        true
    }

    /// Put a failed task back into Ready for another attempt.
    pub fn requeue(&mut self, task: TaskRef) {
        if !self.running.contains(&task) {
            self.ready.insert(task);
        }
    }

    /// Terminal success of one task of `group`. Activates downstream groups
    /// whose last missing dependency this was, and returns how many tasks
    /// entered Ready as a result.
    pub fn complete(&mut self, group: GroupId, groups: &[TaskGroup]) -> usize {
        let Some(counters) = self.counters.get_mut(group.index()) else {
            return 0;
        };
        if counters.unfinished == 0 {
            return 0;
        }
        counters.unfinished -= 1;
        if counters.unfinished > 0 {
            return 0;
        }

        let mut newly_ready = 0;
        let downstream = self.reverse[group.index()].clone();
        for rdep in downstream {
            let Some(c) = self.counters.get_mut(rdep.index()) else {
                continue;
            };
            c.missing = c.missing.saturating_sub(1);
            if c.missing == 0 {
                if let Some(target) = groups.get(rdep.index()) {
                    let before = self.ready.len();
                    self.ready.extend(target.pending_refs());
                    newly_ready += self.ready.len() - before;
                }
            }
        }
        newly_ready
    }

    pub fn missing(&self, group: GroupId) -> Option<u32> {
        self.counters.get(group.index()).map(|c| c.missing)
    }

    pub fn unfinished(&self, group: GroupId) -> Option<u32> {
        self.counters.get(group.index()).map(|c| c.unfinished)
    }

    pub fn unfinished_total(&self) -> u64 {
        self.counters.iter().map(|c| c.unfinished as u64).sum()
    }

    pub fn is_ready(&self, task: &TaskRef) -> bool {
        self.ready.contains(task)
    }

    pub fn is_running(&self, task: &TaskRef) -> bool {
        self.running.contains(task)
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn deep_sleep_running(&self) -> usize {
        self.deep_sleep_running
    }

    /// No ready work, and everything still running is expected to block.
    /// Also true when nothing runs at all.
    pub fn only_deep_sleepers_left(&self) -> bool {
        self.ready.is_empty() && self.deep_sleep_running == self.running.len()
    }

    /// Both sets empty: the main loop is done.
    pub fn is_drained(&self) -> bool {
        self.ready.is_empty() && self.running.is_empty()
    }
}

//! Task / TaskGroup: the records persisted in the graph file.
//!
//! These types are encoded with bincode on disk and with JSON on the wire,
//! so they avoid serde attributes that only one of the two formats supports
//! (internally tagged enums, `skip_serializing_if`).

use serde::{Deserialize, Serialize};

use super::{GroupId, TaskRef};

/// What a task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Run a program directly. `argv[0]` is looked up on `PATH`.
    Exec { argv: Vec<String> },

    /// A shell script body. The agent writes it to a file and runs it with bash.
    Script { body: String },

    /// A named executor from the agent's registry.
    Module { name: String, args: Vec<String> },
}

impl Command {
    /// Short label for logs.
    pub fn label(&self) -> String {
        match self {
            Command::Exec { argv } => argv.first().cloned().unwrap_or_default(),
            Command::Script { .. } => "script".to_string(),
            Command::Module { name, .. } => format!("module:{name}"),
        }
    }
}

/// One executable unit.
///
/// Owned by its [`TaskGroup`]; only the coordinator mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub command: Command,

    /// Number of finished attempts (success or failure).
    pub attempts: u32,

    /// Overrides the group's limit when set.
    pub max_attempts: Option<u32>,

    pub completed: bool,
    pub ignore_failure: bool,

    /// Expected to block for a long time. Idle workers are retired rather
    /// than kept polling when only such tasks are running.
    pub deep_sleep: bool,

    /// Raw wait status of the last attempt.
    pub last_status: Option<i32>,
}

impl Task {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            attempts: 0,
            max_attempts: None,
            completed: false,
            ignore_failure: false,
            deep_sleep: false,
            last_status: None,
        }
    }

    /// Effective attempt limit given the owning group's default.
    pub fn attempt_limit(&self, group_default: u32) -> u32 {
        self.max_attempts.unwrap_or(group_default).max(1)
    }

    pub fn mark_completed(&mut self, status: i32) {
        self.attempts += 1;
        self.completed = true;
        self.last_status = Some(status);
    }

    pub fn record_failure(&mut self, status: i32) {
        self.attempts += 1;
        self.last_status = Some(status);
    }
}

/// Ordered tasks sharing resource hints and a dependency list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub id: GroupId,
    pub tasks: Vec<Task>,

    /// Groups that must fully complete first. Sorted, unique.
    pub dependencies: Vec<GroupId>,

    /// Groups listing this one as a dependency. Derived at build time.
    pub reverse_dependencies: Vec<GroupId>,

    pub threads: u32,
    pub memory_mb: u64,
    pub max_attempts: u32,
}

impl TaskGroup {
    pub fn new(id: GroupId, tasks: Vec<Task>) -> Self {
        Self {
            id,
            tasks,
            dependencies: Vec::new(),
            reverse_dependencies: Vec::new(),
            threads: 1,
            memory_mb: 0,
            max_attempts: 1,
        }
    }

    pub fn unfinished(&self) -> usize {
        self.tasks.iter().filter(|t| !t.completed).count()
    }

    pub fn is_complete(&self) -> bool {
        self.unfinished() == 0
    }

    pub fn task(&self, index: u32) -> Option<&Task> {
        self.tasks.get(index as usize)
    }

    pub fn task_mut(&mut self, index: u32) -> Option<&mut Task> {
        self.tasks.get_mut(index as usize)
    }

    /// References to every not-yet-completed task, in task order.
    pub fn pending_refs(&self) -> impl Iterator<Item = TaskRef> + '_ {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.completed)
            .map(|(i, _)| TaskRef::new(self.id, i as u32))
    }
}

//! Domain identifiers (strongly-typed IDs).
//!
//! グラフ内の位置は密な整数で表す（GroupId / task index）。
//! ファイル上のオフセット表をそのまま添字で引けるようにするため。
//! 実行ごとの記録だけは ULID を使い、ノードをまたいで衝突しないようにする。

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Index of a task group inside the graph file.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl GroupId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// (group, task) pair. Ordering is lexicographic, which is what the
/// Ready set relies on for reproducible assignment order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskRef {
    pub group: GroupId,
    pub task: u32,
}

impl TaskRef {
    pub fn new(group: GroupId, task: u32) -> Self {
        Self { group, task }
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/t{}", self.group, self.task)
    }
}

/// Ordinal of a worker slot in the coordinator's slot table.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Job id handed out by the batch scheduler for a launched worker.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalJobId(pub u64);

impl fmt::Display for ExternalJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Identifier of one execution attempt, as written to the meta log.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(Ulid);

impl RunId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl From<Ulid> for RunId {
    fn from(ulid: Ulid) -> Self {
        Self(ulid)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_refs_sort_by_group_then_task() {
        let mut refs = vec![
            TaskRef::new(GroupId(2), 0),
            TaskRef::new(GroupId(1), 3),
            TaskRef::new(GroupId(1), 1),
        ];
        refs.sort();
        assert_eq!(
            refs,
            vec![
                TaskRef::new(GroupId(1), 1),
                TaskRef::new(GroupId(1), 3),
                TaskRef::new(GroupId(2), 0),
            ]
        );
    }

    #[test]
    fn display_prefixes() {
        assert_eq!(TaskRef::new(GroupId(4), 2).to_string(), "g4/t2");
        assert_eq!(SlotId(7).to_string(), "slot-7");
        assert_eq!(ExternalJobId(123).to_string(), "job-123");
        assert!(RunId::generate().to_string().starts_with("run-"));
    }

    #[test]
    fn run_ids_survive_json() {
        let id = RunId::generate();
        let serialized = serde_json::to_string(&id).unwrap();
        let deserialized: RunId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(id, deserialized);
    }
}

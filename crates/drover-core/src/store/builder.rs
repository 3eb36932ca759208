//! GraphBuilder - JSON のグループ定義から TaskGroup 列を組み立てる
//!
//! 依存はグループ番号（入力配列の添字）で書く。ここで
//! - 依存をソート・重複除去
//! - 逆依存を導出
//! - 未知の依存 / 自己依存 / 循環 を拒否
//! してから GraphStore::create に渡す。

use std::collections::VecDeque;

use serde::Deserialize;

use crate::domain::{Command, GroupId, Task, TaskGroup};

#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    pub command: Command,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub ignore_failure: bool,
    #[serde(default)]
    pub deep_sleep: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupSpec {
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub dependencies: Vec<u32>,
    #[serde(default = "default_one")]
    pub threads: u32,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default = "default_one")]
    pub max_attempts: u32,
}

fn default_one() -> u32 {
    1
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("group {group} depends on unknown group {dependency}")]
    UnknownDependency { group: GroupId, dependency: u32 },

    #[error("group {0} depends on itself")]
    SelfDependency(GroupId),

    #[error("dependency cycle through groups {0:?}")]
    Cycle(Vec<GroupId>),
}

pub fn build_groups(specs: Vec<GroupSpec>) -> Result<Vec<TaskGroup>, BuildError> {
    let count = specs.len();
    let mut groups: Vec<TaskGroup> = Vec::with_capacity(count);

    for (index, spec) in specs.into_iter().enumerate() {
        let id = GroupId(index as u32);
        let mut dependencies = Vec::with_capacity(spec.dependencies.len());
        for dep in spec.dependencies {
            if dep as usize >= count {
                return Err(BuildError::UnknownDependency {
                    group: id,
                    dependency: dep,
                });
            }
            if dep as usize == index {
                return Err(BuildError::SelfDependency(id));
            }
            dependencies.push(GroupId(dep));
        }
        dependencies.sort();
        dependencies.dedup();

        let tasks = spec
            .tasks
            .into_iter()
            .map(|t| {
                let mut task = Task::new(t.command);
                task.max_attempts = t.max_attempts;
                task.ignore_failure = t.ignore_failure;
                task.deep_sleep = t.deep_sleep;
                task
            })
            .collect();

        let mut group = TaskGroup::new(id, tasks);
        group.dependencies = dependencies;
        group.threads = spec.threads.max(1);
        group.memory_mb = spec.memory_mb;
        group.max_attempts = spec.max_attempts.max(1);
        groups.push(group);
    }

    for index in 0..count {
        let deps = groups[index].dependencies.clone();
        for dep in deps {
            groups[dep.index()].reverse_dependencies.push(GroupId(index as u32));
        }
    }

    if let Some(cycle) = find_cycle(&groups) {
        return Err(BuildError::Cycle(cycle));
    }
    Ok(groups)
}

/// Kahn's algorithm over group dependencies. Returns the groups left with
/// unresolved dependencies (every cycle plus whatever hangs off one).
pub fn find_cycle(groups: &[TaskGroup]) -> Option<Vec<GroupId>> {
    let mut indegree: Vec<usize> = groups.iter().map(|g| g.dependencies.len()).collect();
    let mut queue: VecDeque<usize> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| i)
        .collect();

    let mut visited = 0;
    while let Some(index) = queue.pop_front() {
        visited += 1;
        for rdep in &groups[index].reverse_dependencies {
            let slot = &mut indegree[rdep.index()];
            *slot -= 1;
            if *slot == 0 {
                queue.push_back(rdep.index());
            }
        }
    }

    if visited == groups.len() {
        return None;
    }
    Some(
        indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d > 0)
            .map(|(i, _)| GroupId(i as u32))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Vec<GroupSpec> {
        serde_json::from_str(json).unwrap()
    }

    const TASK: &str = r#"{"command":{"exec":{"argv":["true"]}}}"#;

    fn groups_json(deps: &[&[u32]]) -> String {
        let items: Vec<String> = deps
            .iter()
            .map(|d| format!(r#"{{"tasks":[{TASK}],"dependencies":{d:?}}}"#))
            .collect();
        format!("[{}]", items.join(","))
    }

    #[test]
    fn reverse_dependencies_are_derived() {
        // diamond: 0 -> {1, 2} -> 3
        let groups = build_groups(parse(&groups_json(&[&[], &[0], &[0], &[2, 1, 1]]))).unwrap();

        assert_eq!(groups[3].dependencies, vec![GroupId(1), GroupId(2)]);
        assert_eq!(groups[0].reverse_dependencies, vec![GroupId(1), GroupId(2)]);
        assert_eq!(groups[1].reverse_dependencies, vec![GroupId(3)]);
        assert!(groups[3].reverse_dependencies.is_empty());
    }

    #[test]
    fn defaults_apply() {
        let groups = build_groups(parse(&groups_json(&[&[]]))).unwrap();
        assert_eq!(groups[0].threads, 1);
        assert_eq!(groups[0].max_attempts, 1);
        assert!(!groups[0].tasks[0].ignore_failure);
    }

    #[test]
    fn unknown_dependency() {
        let err = build_groups(parse(&groups_json(&[&[5]]))).unwrap_err();
        assert_eq!(
            err,
            BuildError::UnknownDependency {
                group: GroupId(0),
                dependency: 5
            }
        );
    }

    #[test]
    fn self_dependency() {
        let err = build_groups(parse(&groups_json(&[&[], &[1]]))).unwrap_err();
        assert_eq!(err, BuildError::SelfDependency(GroupId(1)));
    }

    #[test]
    fn cycle_is_reported() {
        // 0 -> 1 -> 2 -> 1
        let err = build_groups(parse(&groups_json(&[&[], &[0, 2], &[1]]))).unwrap_err();
        assert_eq!(err, BuildError::Cycle(vec![GroupId(1), GroupId(2)]));
    }
}

//! End-to-end: a coordinator on loopback TCP driving in-process agents.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use drover_core::agent::{Agent, AgentConfig, ExecutorRegistry};
use drover_core::app::{Coordinator, CoordinatorConfig, RunReport};
use drover_core::domain::{ExitOutcome, ExternalJobId, GroupId, RunRecord, TaskRef};
use drover_core::ports::{LaunchError, LaunchRequest, Launcher};
use drover_core::store::{GraphStore, GroupSpec, build_groups, meta, meta_path};
use serde_json::json;
use tokio::net::TcpListener;

/// Starts each worker as a task in this process.
#[derive(Default)]
struct InProcessLauncher {
    next: AtomicU64,
}

#[async_trait]
impl Launcher for InProcessLauncher {
    fn name(&self) -> &'static str {
        "in-process"
    }

    async fn launch(&self, req: &LaunchRequest) -> Result<ExternalJobId, LaunchError> {
        let job_id = ExternalJobId(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        let mut config = AgentConfig::new(
            req.coordinator_host.clone(),
            req.coordinator_port,
            job_id,
            req.working_dir.clone(),
        );
        config.heartbeat = Duration::from_millis(200);
        let agent = Agent::new(config, ExecutorRegistry::with_builtins());
        tokio::spawn(async move {
            let _ = agent.run().await;
        });
        Ok(job_id)
    }
}

async fn run_pipeline(dir: &Path, groups: serde_json::Value, workers: usize) -> RunReport {
    let specs: Vec<GroupSpec> = serde_json::from_value(groups).unwrap();
    let graph = dir.join("pipe.graph");
    GraphStore::create(&graph, build_groups(specs).unwrap()).unwrap();

    let config = CoordinatorConfig {
        workers,
        tmp_prefix: Some(dir.join("slot")),
        bind_host: "127.0.0.1".into(),
        advertise_host: Some("127.0.0.1".into()),
        tick_ms: 100,
        working_dir: dir.to_path_buf(),
        ..CoordinatorConfig::default()
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let coordinator = Coordinator::open(
        config,
        &graph,
        Arc::new(InProcessLauncher::default()),
        &ExecutorRegistry::with_builtins(),
    )
    .unwrap();

    tokio::time::timeout(Duration::from_secs(60), coordinator.run(listener))
        .await
        .expect("pipeline did not finish")
        .unwrap()
}

fn records(dir: &Path) -> Vec<RunRecord> {
    meta::read_all(&meta_path(&dir.join("pipe.graph"))).unwrap()
}

fn stdout_of(record: &RunRecord) -> String {
    let bytes = std::fs::read(&record.out_path).unwrap();
    let start = record.out_start as usize;
    let end = record.out_end.unwrap() as usize;
    String::from_utf8(bytes[start..end].to_vec()).unwrap()
}

fn exec(cmd: &str) -> serde_json::Value {
    json!({ "exec": { "argv": ["sh", "-c", cmd] } })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn downstream_group_sees_upstream_output() {
    let dir = tempfile::tempdir().unwrap();
    let report = run_pipeline(
        dir.path(),
        json!([
            { "tasks": [{ "command": exec("echo a > a.txt") }] },
            { "tasks": [{ "command": exec("test -f a.txt && echo b") }], "dependencies": [0] }
        ]),
        1,
    )
    .await;

    assert!(!report.failed);
    assert_eq!((report.tasks, report.completed), (2, 2));

    let records = records(dir.path());
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].group, GroupId(0));
    assert_eq!(records[1].group, GroupId(1));
    assert_eq!(stdout_of(&records[1]), "b\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_task_stops_after_max_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let report = run_pipeline(
        dir.path(),
        json!([{ "tasks": [{ "command": exec("exit 3") }], "max_attempts": 2 }]),
        1,
    )
    .await;

    assert!(report.failed);
    assert_eq!(report.failed_tasks, vec![TaskRef::new(GroupId(0), 0)]);

    let store = GraphStore::open(dir.path().join("pipe.graph")).unwrap();
    let task = &store.groups()[0].tasks[0];
    assert_eq!(task.attempts, 2);
    assert!(!task.completed);
    assert_eq!(ExitOutcome::from_raw(task.last_status.unwrap()).code, Some(3));

    let attempts: Vec<u32> = records(dir.path()).iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ignored_failure_lets_the_pipeline_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let report = run_pipeline(
        dir.path(),
        json!([
            { "tasks": [{ "command": exec("exit 1"), "ignore_failure": true }] },
            { "tasks": [{ "command": exec("true") }], "dependencies": [0] }
        ]),
        1,
    )
    .await;

    assert!(!report.failed);
    assert_eq!(report.completed, 2);
    let store = GraphStore::open(dir.path().join("pipe.graph")).unwrap();
    assert!(store.groups().iter().all(|g| g.is_complete()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scripts_on_several_workers_keep_their_byte_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let tasks: Vec<serde_json::Value> = (0..6)
        .map(|n| json!({ "command": { "script": { "body": format!("echo task-{n}\n") } } }))
        .collect();
    let report = run_pipeline(dir.path(), json!([{ "tasks": tasks }]), 2).await;

    assert!(!report.failed);
    assert_eq!(report.completed, 6);

    let records = records(dir.path());
    assert_eq!(records.len(), 6);
    for record in &records {
        assert_eq!(stdout_of(record), format!("task-{}\n", record.task));
        assert!(!record.script.as_ref().unwrap().exists());
    }
}

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use drover_core::agent::{Agent, AgentConfig, ExecutorRegistry};
use drover_core::app::{Coordinator, CoordinatorConfig};
use drover_core::domain::ExternalJobId;
use drover_core::impls::{LocalLauncher, SbatchLauncher};
use drover_core::observability::GraphSummary;
use drover_core::ports::Launcher;
use drover_core::store::{GraphStore, GroupSpec, build_groups, journal_path};

#[derive(Parser, Debug)]
#[command(name = "drover", version, about = "Run a task-group graph on batch-scheduled workers")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Coordinate a graph until every task has settled.
    Run(RunArgs),
    /// Worker agent; started by the launcher, not by hand.
    Worker(WorkerArgs),
    /// Build a graph file from a JSON list of groups.
    Compile { input: PathBuf, graph: PathBuf },
    /// Print per-group completion of a graph file.
    Status {
        graph: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LauncherKind {
    Sbatch,
    Local,
}

#[derive(Args, Debug)]
struct RunArgs {
    graph: PathBuf,

    /// TOML file with coordinator settings; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    worker_threads: Option<u32>,

    /// Memory per worker in MB.
    #[arg(long = "worker-mem")]
    worker_mem: Option<u64>,

    /// Wall time per worker in minutes.
    #[arg(long = "worker-time")]
    worker_time: Option<u64>,

    #[arg(long)]
    partition: Option<String>,

    #[arg(short = 'T', long)]
    tmp_prefix: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LauncherKind::Sbatch)]
    launcher: LauncherKind,

    /// Host workers connect back to.
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    bind: Option<String>,

    #[arg(long)]
    port: Option<u16>,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    host: String,
    port: u16,

    #[arg(long, env = "SLURM_JOB_ID")]
    job_id: u64,

    #[arg(long, default_value_t = 60)]
    heartbeat_secs: u64,

    #[arg(long, default_value_t = 10)]
    kill_grace_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Cmd::Run(args) => run(args).await,
        Cmd::Worker(args) => worker(args).await,
        Cmd::Compile { input, graph } => compile(&input, &graph),
        Cmd::Status { graph, json } => status(&graph, json),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn coordinator_config(args: &RunArgs) -> anyhow::Result<CoordinatorConfig> {
    let mut config = match &args.config {
        Some(path) => CoordinatorConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CoordinatorConfig::default(),
    };

    if let Some(v) = args.workers {
        config.workers = v;
    }
    if let Some(v) = args.worker_threads {
        config.worker_threads = Some(v);
    }
    if let Some(v) = args.worker_mem {
        config.worker_mem_mb = v;
    }
    if let Some(v) = args.worker_time {
        config.worker_time_min = v;
    }
    if let Some(v) = &args.partition {
        config.partition = v.clone();
    }
    if let Some(v) = &args.tmp_prefix {
        config.tmp_prefix = Some(v.clone());
    }
    if let Some(v) = &args.host {
        config.advertise_host = Some(v.clone());
    }
    if let Some(v) = &args.bind {
        config.bind_host = v.clone();
    }
    if let Some(v) = args.port {
        config.port = v;
    }

    config.working_dir = std::env::current_dir().context("reading working directory")?;
    Ok(config)
}

async fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let config = coordinator_config(&args)?;
    let exe = std::env::current_exe().context("locating the drover binary")?;
    let launcher: Arc<dyn Launcher> = match args.launcher {
        LauncherKind::Sbatch => Arc::new(SbatchLauncher::new(vec![
            exe.to_string_lossy().into_owned(),
            "worker".to_string(),
        ])),
        LauncherKind::Local => Arc::new(LocalLauncher::new(exe, vec!["worker".to_string()])),
    };

    let listener = TcpListener::bind((config.bind_host.as_str(), config.port))
        .await
        .with_context(|| format!("binding {}:{}", config.bind_host, config.port))?;
    let coordinator = Coordinator::open(config, &args.graph, launcher, &ExecutorRegistry::with_builtins())
        .with_context(|| format!("opening {}", args.graph.display()))?;

    let report = coordinator.run(listener).await?;
    if report.failed {
        for task in &report.failed_tasks {
            warn!(%task, "task exhausted its attempts");
        }
        return Ok(ExitCode::FAILURE);
    }
    info!(completed = report.completed, "pipeline finished");
    Ok(ExitCode::SUCCESS)
}

async fn worker(args: WorkerArgs) -> anyhow::Result<ExitCode> {
    let working_dir = std::env::current_dir().context("reading working directory")?;
    let mut config = AgentConfig::new(args.host, args.port, ExternalJobId(args.job_id), working_dir);
    config.heartbeat = Duration::from_secs(args.heartbeat_secs.max(1));
    config.kill_grace = Duration::from_secs(args.kill_grace_secs);

    let agent = Agent::new(config, ExecutorRegistry::with_builtins());
    let summary = agent.run().await.context("worker agent stopped")?;
    info!(tasks = summary.tasks_run, failed = summary.tasks_failed, "worker done");
    Ok(ExitCode::SUCCESS)
}

fn compile(input: &Path, graph: &Path) -> anyhow::Result<ExitCode> {
    let text = std::fs::read_to_string(input).with_context(|| format!("reading {}", input.display()))?;
    let specs: Vec<GroupSpec> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", input.display()))?;
    let groups = build_groups(specs)?;
    let store = GraphStore::create(graph, groups).with_context(|| format!("writing {}", graph.display()))?;
    info!(groups = store.len(), tasks = store.task_count(), graph = %graph.display(), "graph written");
    Ok(ExitCode::SUCCESS)
}

fn status(graph: &Path, json: bool) -> anyhow::Result<ExitCode> {
    if journal_path(graph).exists() {
        warn!("an unapplied journal exists; the next run will replay it first");
    }
    let store = GraphStore::open(graph).with_context(|| format!("opening {}", graph.display()))?;
    let summary = GraphSummary::of(store.groups());

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "{}/{} tasks completed, {}/{} groups complete",
            summary.completed, summary.tasks, summary.groups_complete, summary.groups
        );
        for g in &summary.per_group {
            println!(
                "{:>6}  {:>5}/{:<5}  failing={:<4} deps={:?}",
                g.group.to_string(),
                g.completed,
                g.tasks,
                g.failing,
                g.dependencies.iter().map(|d| d.0).collect::<Vec<_>>()
            );
        }
    }
    let done = summary.completed == summary.tasks;
    Ok(if done { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn run_args(argv: &[&str]) -> RunArgs {
        let mut full = vec!["drover", "run"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Cmd::Run(args) => args,
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[rstest]
    #[case::defaults(&["g.graph"], 16, "haswell", LauncherKind::Sbatch)]
    #[case::flags(&["g.graph", "--workers", "4", "--partition", "short", "--launcher", "local"], 4, "short", LauncherKind::Local)]
    fn run_flags(
        #[case] argv: &[&str],
        #[case] workers: usize,
        #[case] partition: &str,
        #[case] launcher: LauncherKind,
    ) {
        let args = run_args(argv);
        let config = coordinator_config(&args).unwrap();
        assert_eq!(config.workers, workers);
        assert_eq!(config.partition, partition);
        assert_eq!(args.launcher, launcher);
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drover.toml");
        std::fs::write(&path, "workers = 8\nworker_mem_mb = 1000\npartition = \"long\"\n").unwrap();

        let args = run_args(&[
            "g.graph",
            "--config",
            path.to_str().unwrap(),
            "--workers",
            "2",
            "-T",
            "/scratch/tmp",
        ]);
        let config = coordinator_config(&args).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.worker_mem_mb, 1000);
        assert_eq!(config.partition, "long");
        assert_eq!(config.tmp_prefix, Some(PathBuf::from("/scratch/tmp")));
        assert_eq!(config.working_dir, std::env::current_dir().unwrap());
    }

    #[test]
    fn worker_takes_job_id_flag() {
        let cli = Cli::try_parse_from(["drover", "worker", "head01", "4000", "--job-id", "77"]).unwrap();
        let Cmd::Worker(args) = cli.command else {
            panic!("expected worker");
        };
        assert_eq!((args.host.as_str(), args.port, args.job_id), ("head01", 4000, 77));
        assert_eq!(args.heartbeat_secs, 60);
    }

    #[test]
    fn compile_then_status() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("groups.json");
        let graph = dir.path().join("pipe.graph");
        std::fs::write(
            &input,
            r#"[
                {"tasks": [{"command": {"exec": {"argv": ["true"]}}}]},
                {"tasks": [{"command": {"script": {"body": "echo hi"}}}], "dependencies": [0]}
            ]"#,
        )
        .unwrap();

        assert_eq!(compile(&input, &graph).unwrap(), ExitCode::SUCCESS);
        let store = GraphStore::open(&graph).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(status(&graph, true).unwrap(), ExitCode::FAILURE);
    }

    #[test]
    fn compile_rejects_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("groups.json");
        std::fs::write(
            &input,
            r#"[
                {"tasks": [], "dependencies": [1]},
                {"tasks": [], "dependencies": [0]}
            ]"#,
        )
        .unwrap();
        assert!(compile(&input, &dir.path().join("g")).is_err());
    }
}

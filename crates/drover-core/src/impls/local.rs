//! LocalLauncher - ワーカーを同じマシンのプロセスとして起動する
//!
//! クラスタなしで動かすとき用。外部ジョブ ID は連番で払い出す。

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::debug;

use crate::domain::ExternalJobId;
use crate::ports::{LaunchError, LaunchRequest, Launcher};

pub struct LocalLauncher {
    program: PathBuf,
    args: Vec<String>,
    next_id: AtomicU64,
}

impl LocalLauncher {
    /// `program args.. <host> <port> --job-id <id>` is spawned per launch.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl Launcher for LocalLauncher {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn launch(&self, req: &LaunchRequest) -> Result<ExternalJobId, LaunchError> {
        let job_id = ExternalJobId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut log_name = req.tmp_base.as_os_str().to_owned();
        log_name.push(".worker.log");
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(PathBuf::from(log_name))?;

        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(&req.coordinator_host)
            .arg(req.coordinator_port.to_string())
            .arg("--job-id")
            .arg(job_id.0.to_string())
            .current_dir(&req.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        debug!(slot = %req.slot, %job_id, pid = ?child.id(), "local worker spawned");
        // detached: the worker exits on its own when told to terminate
        drop(child);
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SlotId;

    fn request(dir: &std::path::Path) -> LaunchRequest {
        LaunchRequest {
            slot: SlotId(0),
            coordinator_host: "127.0.0.1".into(),
            coordinator_port: 1,
            threads: 1,
            memory_mb: 0,
            time_minutes: 1,
            partition: String::new(),
            tmp_base: dir.join("run_0"),
            working_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn hands_out_sequential_job_ids() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = LocalLauncher::new("true", Vec::new());

        let first = launcher.launch(&request(dir.path())).await.unwrap();
        let second = launcher.launch(&request(dir.path())).await.unwrap();
        assert_eq!(first, ExternalJobId(1));
        assert_eq!(second, ExternalJobId(2));
        assert!(dir.path().join("run_0.worker.log").exists());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = LocalLauncher::new("/nonexistent/drover-worker", Vec::new());
        let err = launcher.launch(&request(dir.path())).await.unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }
}

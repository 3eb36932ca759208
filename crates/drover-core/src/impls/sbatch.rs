//! SbatchLauncher - SLURM の `sbatch` でワーカーを投入する
//!
//! 1. `<tmp_base>.sbatch` にジョブスクリプトを書く
//! 2. `sbatch <script>` を実行
//! 3. "Submitted batch job <id>" から外部ジョブ ID を取り出す
//! 4. スクリプトを消す

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::domain::ExternalJobId;
use crate::ports::{LaunchError, LaunchRequest, Launcher};

pub struct SbatchLauncher {
    program: String,
    worker_command: Vec<String>,
}

impl SbatchLauncher {
    /// `worker_command` is the agent invocation without host and port,
    /// e.g. `["/opt/drover/bin/drover", "worker"]`.
    pub fn new(worker_command: Vec<String>) -> Self {
        Self {
            program: "sbatch".to_string(),
            worker_command,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn render_script(&self, req: &LaunchRequest) -> String {
        let base = req.tmp_base.to_string_lossy();
        let mut command: Vec<String> = self.worker_command.iter().map(|w| shell_quote(w)).collect();
        command.push(shell_quote(&req.coordinator_host));
        command.push(req.coordinator_port.to_string());

        let mut script = String::new();
        script.push_str("#!/bin/bash\n");
        script.push_str(&format!("#SBATCH --job-name=worker_{}\n", req.slot.0));
        script.push_str(&format!("#SBATCH --output={base}.slurm.out\n"));
        script.push_str("#SBATCH --ntasks=1\n");
        script.push_str(&format!("#SBATCH --time={}\n", req.time_minutes));
        script.push_str(&format!("#SBATCH --mem={}\n", req.memory_mb));
        script.push_str(&format!("#SBATCH --cpus-per-task={}\n", req.threads));
        if !req.partition.is_empty() {
            script.push_str(&format!("#SBATCH --partition={}\n", req.partition));
        }
        script.push_str(&format!(
            "cd {}\n",
            shell_quote(&req.working_dir.to_string_lossy())
        ));
        script.push_str(&format!("srun {}\n", command.join(" ")));
        script
    }

    fn script_path(req: &LaunchRequest) -> PathBuf {
        let mut name = req.tmp_base.as_os_str().to_owned();
        name.push(".sbatch");
        PathBuf::from(name)
    }
}

#[async_trait]
impl Launcher for SbatchLauncher {
    fn name(&self) -> &'static str {
        "sbatch"
    }

    async fn launch(&self, req: &LaunchRequest) -> Result<ExternalJobId, LaunchError> {
        let script = Self::script_path(req);
        tokio::fs::write(&script, self.render_script(req)).await?;

        let output = tokio::process::Command::new(&self.program)
            .arg(&script)
            .current_dir(&req.working_dir)
            .output()
            .await;

        if let Err(e) = tokio::fs::remove_file(&script).await {
            warn!(path = %script.display(), error = %e, "could not remove job script");
        }

        let output = output.map_err(|source| LaunchError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(LaunchError::Rejected {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let job_id = parse_submission(&stdout)?;
        debug!(slot = %req.slot, %job_id, "worker submitted");
        Ok(job_id)
    }
}

/// Extract the id from `Submitted batch job <id>`.
pub fn parse_submission(stdout: &str) -> Result<ExternalJobId, LaunchError> {
    stdout
        .lines()
        .find_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            match tokens.as_slice() {
                ["Submitted", "batch", "job", id, ..] => id.parse().ok(),
                _ => None,
            }
        })
        .map(ExternalJobId)
        .ok_or_else(|| LaunchError::UnparsableReply(stdout.trim().to_string()))
}

fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

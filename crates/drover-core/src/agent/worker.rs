use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tracing::{debug, info, warn};

use super::capture::{join_pump, open_capture, pump};
use super::process;
use super::registry::ExecutorRegistry;
use super::{AgentConfig, AgentError, AgentSummary};
use crate::domain::{Command, ExitOutcome, RunId, RunRecord, SPAWN_FAILED_STATUS, SlotId};
use crate::store::MetaLog;
use crate::wire::{
    ACK, Assignment, CWD_MISMATCH, CWD_OK, CapturePaths, FrameStream, IdleReply, WorkerStatus,
    status_to_wire,
};

/// State established by the handshake; lives until the connection ends.
pub(super) struct Session {
    slot: SlotId,
    tmp_base: PathBuf,
    paths: CapturePaths,
    meta: MetaLog,
}

impl Session {
    pub(super) async fn handshake<S>(
        config: &AgentConfig,
        wire: &mut FrameStream<S>,
    ) -> Result<Self, AgentError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        wire.send_u64(config.job_id.0).await?;
        let slot = SlotId(wire.recv_u64().await? as usize);
        let expected = PathBuf::from(wire.recv_string().await?);

        if !same_dir(&expected, &config.working_dir) {
            wire.send_u64(CWD_MISMATCH).await?;
            return Err(AgentError::WorkingDirMismatch {
                expected,
                actual: config.working_dir.clone(),
            });
        }
        wire.send_u64(CWD_OK).await?;

        let tmp_base = PathBuf::from(wire.recv_string().await?);
        let paths = CapturePaths::from_base(&tmp_base);
        wire.send_str(&paths.out.to_string_lossy()).await?;
        wire.send_str(&paths.err.to_string_lossy()).await?;
        wire.send_str(&paths.meta.to_string_lossy()).await?;

        let meta = MetaLog::open(&paths.meta)?;
        info!(%slot, tmp_base = %tmp_base.display(), "handshake complete");
        Ok(Self {
            slot,
            tmp_base,
            paths,
            meta,
        })
    }

    pub(super) async fn serve<S>(
        &mut self,
        config: &AgentConfig,
        registry: &ExecutorRegistry,
        wire: &mut FrameStream<S>,
    ) -> Result<AgentSummary, AgentError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut summary = AgentSummary::default();
        loop {
            wire.send_u64(WorkerStatus::Idle.to_wire()).await?;
            let reply = wire.recv_u64().await?;
            match IdleReply::from_wire(reply) {
                Some(IdleReply::Assign) => {
                    let assignment: Assignment = wire.recv_json().await?;
                    let succeeded = self.run_task(config, registry, wire, &assignment).await?;
                    summary.tasks_run += 1;
                    if !succeeded {
                        summary.tasks_failed += 1;
                    }
                }
                Some(IdleReply::Wakeup) => debug!("woken up"),
                Some(IdleReply::Terminate) => {
                    info!(tasks = summary.tasks_run, "terminate received");
                    return Ok(summary);
                }
                None => {
                    return Err(AgentError::Protocol(format!("unexpected idle reply {reply}")));
                }
            }
        }
    }

    /// RUNNING state. Returns whether the task succeeded.
    async fn run_task<S>(
        &mut self,
        config: &AgentConfig,
        registry: &ExecutorRegistry,
        wire: &mut FrameStream<S>,
        assignment: &Assignment,
    ) -> Result<bool, AgentError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let script_path = self.script_path(assignment);
        let script = matches!(assignment.command, Command::Script { .. }).then(|| script_path.clone());

        let out = open_capture(&self.paths.out).await?;
        let mut err = open_capture(&self.paths.err).await?;
        let mut record = RunRecord {
            run_id: RunId::generate(),
            group: assignment.group,
            task: assignment.task,
            attempt: assignment.attempt,
            slot: self.slot,
            out_path: self.paths.out.clone(),
            err_path: self.paths.err.clone(),
            out_start: out.start,
            out_end: None,
            err_start: err.start,
            err_end: None,
            status: None,
            script: script.clone(),
            started_at: Utc::now(),
            finished_at: None,
        };

        let spawned = prepare_and_spawn(registry, assignment, &script_path, &config.working_dir).await;
        wire.send_json(&record).await?;
        info!(task = %assignment.task_ref(), attempt = assignment.attempt, "task started");

        let (raw, out_bytes, err_bytes) = match spawned {
            Err(reason) => {
                warn!(task = %assignment.task_ref(), %reason, "task could not be started");
                let line = format!("drover: {reason}\n");
                err.file
                    .write_all(line.as_bytes())
                    .await
                    .map_err(|source| AgentError::StreamIo {
                        stream: "stderr",
                        source,
                    })?;
                (SPAWN_FAILED_STATUS, 0, line.len() as u64)
            }
            Ok(mut child) => {
                let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
                    let _ = process::terminate(&mut child, config.kill_grace).await;
                    return Err(AgentError::Protocol("child pipes were not captured".into()));
                };
                let out_pump = pump(stdout, out.file, "stdout", false);
                let err_pump = pump(stderr, err.file, "stderr", true);

                let status = match wait_with_heartbeat(config, wire, &mut child).await {
                    Ok(status) => status,
                    Err(e) => {
                        warn!(error = %e, "aborting running task");
                        if let Err(kill_err) = process::terminate(&mut child, config.kill_grace).await {
                            warn!(error = %kill_err, "could not stop task");
                        }
                        out_pump.abort();
                        err_pump.abort();
                        return Err(e);
                    }
                };
                let out_bytes = join_pump(out_pump, "stdout").await?;
                let err_bytes = join_pump(err_pump, "stderr").await?;
                (status.into_raw(), out_bytes, err_bytes)
            }
        };

        record.finish(raw, record.out_start + out_bytes, record.err_start + err_bytes);
        self.meta.append(&record)?;

        let outcome = ExitOutcome::from_raw(raw);
        if outcome.is_success() {
            if let Some(path) = &script {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    warn!(path = %path.display(), error = %e, "could not remove task script");
                }
            }
        }
        info!(task = %assignment.task_ref(), outcome = %outcome.describe(), "task finished");

        wire.send_u64(WorkerStatus::Finished.to_wire()).await?;
        wire.send_u64(status_to_wire(raw)).await?;
        wire.send_json(&record).await?;
        expect_ack(wire).await?;
        Ok(outcome.is_success())
    }

    fn script_path(&self, assignment: &Assignment) -> PathBuf {
        let base = self.tmp_base.to_string_lossy();
        PathBuf::from(format!("{base}_{}_{}.sh", assignment.group.0, assignment.task))
    }
}

async fn prepare_and_spawn(
    registry: &ExecutorRegistry,
    assignment: &Assignment,
    script_path: &Path,
    working_dir: &Path,
) -> Result<Child, String> {
    let invocation = registry
        .resolve(&assignment.command, script_path)
        .map_err(|e| e.to_string())?;
    if let Command::Script { body } = &assignment.command {
        tokio::fs::write(script_path, body)
            .await
            .map_err(|e| format!("writing {}: {e}", script_path.display()))?;
    }
    process::spawn(&invocation, working_dir).map_err(|e| format!("spawning {}: {e}", invocation.program))
}

/// Bounded waits on the child; every expiry is a still-running report.
async fn wait_with_heartbeat<S>(
    config: &AgentConfig,
    wire: &mut FrameStream<S>,
    child: &mut Child,
) -> Result<std::process::ExitStatus, AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match tokio::time::timeout(config.heartbeat, child.wait()).await {
            Ok(status) => return status.map_err(AgentError::Wait),
            Err(_) => {
                wire.send_u64(WorkerStatus::Running.to_wire()).await?;
                expect_ack(wire).await?;
            }
        }
    }
}

async fn expect_ack<S>(wire: &mut FrameStream<S>) -> Result<(), AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ack = wire.recv_u64().await?;
    if ack != ACK {
        return Err(AgentError::Protocol(format!("expected ack, got {ack}")));
    }
    Ok(())
}

fn same_dir(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

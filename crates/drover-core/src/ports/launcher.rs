//! Launcher port - ワーカーを外部スケジューラに投入する
//!
//! 「リソースのヒントを渡して、外部ジョブ ID をもらう」だけの契約。
//! 失敗時のリトライは呼び出し側（coordinator の restart set）が受け持つ。

use std::path::PathBuf;

use async_trait::async_trait;

use crate::domain::{ExternalJobId, SlotId};

/// Everything a launcher needs to start one worker agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub slot: SlotId,
    /// Address the worker connects back to.
    pub coordinator_host: String,
    pub coordinator_port: u16,
    pub threads: u32,
    pub memory_mb: u64,
    pub time_minutes: u64,
    pub partition: String,
    /// Per-slot temp-file base; launchers put their own scratch files next to it.
    pub tmp_base: PathBuf,
    pub working_dir: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("submission rejected ({status}): {stderr}")]
    Rejected { status: String, stderr: String },

    #[error("could not parse job id from submission reply: {0:?}")]
    UnparsableReply(String),

    #[error("launcher i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque "submit job, get an external job id" operation.
#[async_trait]
pub trait Launcher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn launch(&self, request: &LaunchRequest) -> Result<ExternalJobId, LaunchError>;
}

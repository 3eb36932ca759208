//! Worker agent: connects to the coordinator once, then alternates between
//! IDLE (ask for work) and RUNNING (one subprocess, output captured).

pub mod capture;
pub mod process;
pub mod registry;
mod worker;

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::info;

use crate::domain::ExternalJobId;
use crate::store::MetaError;
use crate::wire::{FrameStream, WireError};

pub use registry::{Executor, ExecutorRegistry, Invocation, RegistryError, required_modules};

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("cannot reach coordinator at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("working directory mismatch: coordinator runs in {expected}, agent in {actual}")]
    WorkingDirMismatch { expected: PathBuf, actual: PathBuf },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("capture file {path}: {source}")]
    Capture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{stream} pump failed: {source}")]
    StreamIo {
        stream: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("waiting for task: {0}")]
    Wait(#[source] std::io::Error),

    #[error(transparent)]
    Meta(#[from] MetaError),
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub host: String,
    pub port: u16,
    pub job_id: ExternalJobId,
    /// How long to wait on a task before sending a still-running report.
    pub heartbeat: Duration,
    pub kill_grace: Duration,
    pub working_dir: PathBuf,
}

impl AgentConfig {
    pub fn new(host: impl Into<String>, port: u16, job_id: ExternalJobId, working_dir: PathBuf) -> Self {
        Self {
            host: host.into(),
            port,
            job_id,
            heartbeat: DEFAULT_HEARTBEAT,
            kill_grace: DEFAULT_KILL_GRACE,
            working_dir,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AgentSummary {
    pub tasks_run: usize,
    pub tasks_failed: usize,
}

pub struct Agent {
    config: AgentConfig,
    registry: ExecutorRegistry,
}

impl Agent {
    pub fn new(config: AgentConfig, registry: ExecutorRegistry) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Connect and serve until the coordinator says terminate.
    pub async fn run(&self) -> Result<AgentSummary, AgentError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| AgentError::Connect {
                addr: addr.clone(),
                source,
            })?;
        stream
            .set_nodelay(true)
            .map_err(|source| AgentError::Connect {
                addr: addr.clone(),
                source,
            })?;
        info!(%addr, job_id = %self.config.job_id, "connected to coordinator");

        let mut wire = FrameStream::new(stream);
        self.serve(&mut wire).await
    }

    /// Protocol loop over an established connection.
    pub async fn serve<S>(&self, wire: &mut FrameStream<S>) -> Result<AgentSummary, AgentError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut session = worker::Session::handshake(&self.config, wire).await?;
        session.serve(&self.config, &self.registry, wire).await
    }
}

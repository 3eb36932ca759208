//! Connection actor - 1 ソケット 1 タスク
//!
//! バイトの読み書きだけを担当し、判断はすべて event loop に聞く。
//! - worker からの報告を `ConnEvent` に変換して loop へ送る
//! - loop からの `Directive` を 1 つ待ってから worker に返す
//! - directive の送り手が drop されたら（slot reset）接続を閉じる

use std::fmt;
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::domain::{ExternalJobId, RunRecord, SlotId};
use crate::wire::{
    ACK, Assignment, CWD_MISMATCH, CWD_OK, CapturePaths, FrameStream, IdleReply, WireError,
    WorkerStatus, status_from_wire,
};

/// Loop-assigned identity of one accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What the loop tells a connection to send next.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Assign(Assignment),
    Wakeup,
    Terminate,
    Ack,
}

/// Handshake answer for a recognised job id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    pub slot: SlotId,
    pub working_dir: PathBuf,
    pub tmp_base: PathBuf,
}

/// Steady-state report from a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    Idle,
    Finished { status: i32, record: RunRecord },
    Running,
}

#[derive(Debug)]
pub enum ConnEvent {
    Hello {
        conn: ConnId,
        job_id: ExternalJobId,
        directives: mpsc::UnboundedSender<Directive>,
        reply: oneshot::Sender<Option<Welcome>>,
    },
    Registered {
        conn: ConnId,
        capture: CapturePaths,
    },
    /// Start-of-task record sent right after an assignment.
    Started {
        conn: ConnId,
        record: RunRecord,
    },
    Report {
        conn: ConnId,
        report: Report,
    },
    Closed {
        conn: ConnId,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("event loop is gone")]
    LoopGone,

    #[error("unknown job id {0}")]
    Rejected(ExternalJobId),

    #[error("worker reported a working directory mismatch")]
    DirMismatch,

    #[error("unexpected {what} value {value}")]
    Protocol { what: &'static str, value: u64 },

    #[error("slot was reset")]
    Released,
}

/// Run one connection to completion and report why it ended.
pub async fn serve_connection<S>(conn: ConnId, stream: S, events: mpsc::UnboundedSender<ConnEvent>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut wire = FrameStream::new(stream);
    let reason = match drive(conn, &mut wire, &events).await {
        Ok(()) => "terminated".to_string(),
        Err(e) => e.to_string(),
    };
    debug!(%conn, %reason, "connection closed");
    let _ = events.send(ConnEvent::Closed { conn, reason });
}

async fn drive<S>(
    conn: ConnId,
    wire: &mut FrameStream<S>,
    events: &mpsc::UnboundedSender<ConnEvent>,
) -> Result<(), ConnError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let send = |event: ConnEvent| events.send(event).map_err(|_| ConnError::LoopGone);

    let job_id = ExternalJobId(wire.recv_u64().await?);
    let (directives, mut inbox) = mpsc::unbounded_channel();
    let (reply, welcome) = oneshot::channel();
    send(ConnEvent::Hello {
        conn,
        job_id,
        directives,
        reply,
    })?;
    let welcome = welcome
        .await
        .map_err(|_| ConnError::LoopGone)?
        .ok_or(ConnError::Rejected(job_id))?;

    wire.send_u64(welcome.slot.0 as u64).await?;
    wire.send_str(&welcome.working_dir.to_string_lossy()).await?;
    match wire.recv_u64().await? {
        CWD_OK => {}
        CWD_MISMATCH => return Err(ConnError::DirMismatch),
        value => {
            return Err(ConnError::Protocol {
                what: "directory check",
                value,
            });
        }
    }
    wire.send_str(&welcome.tmp_base.to_string_lossy()).await?;
    let capture = CapturePaths {
        out: PathBuf::from(wire.recv_string().await?),
        err: PathBuf::from(wire.recv_string().await?),
        meta: PathBuf::from(wire.recv_string().await?),
    };
    send(ConnEvent::Registered { conn, capture })?;

    loop {
        let report = match WorkerStatus::from_wire(wire.recv_u64().await?) {
            WorkerStatus::Idle => Report::Idle,
            WorkerStatus::Finished => {
                let status = status_from_wire(wire.recv_u64().await?);
                let record = wire.recv_json().await?;
                Report::Finished { status, record }
            }
            WorkerStatus::Running => Report::Running,
            WorkerStatus::Unknown(value) => {
                return Err(ConnError::Protocol {
                    what: "worker status",
                    value,
                });
            }
        };
        send(ConnEvent::Report { conn, report })?;

        match inbox.recv().await.ok_or(ConnError::Released)? {
            Directive::Assign(assignment) => {
                wire.send_u64(IdleReply::Assign.to_wire()).await?;
                wire.send_json(&assignment).await?;
                let record = wire.recv_json().await?;
                send(ConnEvent::Started { conn, record })?;
            }
            Directive::Wakeup => wire.send_u64(IdleReply::Wakeup.to_wire()).await?,
            Directive::Terminate => {
                wire.send_u64(IdleReply::Terminate.to_wire()).await?;
                return Ok(());
            }
            Directive::Ack => wire.send_u64(ACK).await?,
        }
    }
}

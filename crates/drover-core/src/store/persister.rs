//! Persister - グラフ更新を裏で書き込む専用ワーカー
//!
//! - event loop は `enqueue()` するだけで disk I/O を待たない
//! - `flush_threshold` 件たまったら journal → apply → journal 削除
//! - shutdown: sender を落とす → 残りを flush → join
//!
//! 書き込みに失敗したらワーカーは止まる。以降の `enqueue()` は
//! `WorkerGone` になり、原因は `shutdown()` が返す。

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::graph::WriteRequest;
use super::journal::{self, JournalError};

pub const DEFAULT_FLUSH_THRESHOLD: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("persister worker has stopped")]
    WorkerGone,

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("persister worker panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PersistStats {
    pub batches: usize,
    pub writes: usize,
}

pub struct Persister {
    tx: mpsc::UnboundedSender<WriteRequest>,
    handle: JoinHandle<Result<PersistStats, JournalError>>,
}

impl Persister {
    /// Start the worker on the blocking pool. Must be called inside a tokio runtime.
    pub fn spawn(graph: PathBuf, flush_threshold: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let threshold = flush_threshold.max(1);
        let handle = tokio::task::spawn_blocking(move || run_worker(&graph, threshold, rx));
        Self { tx, handle }
    }

    pub fn enqueue(&self, write: WriteRequest) -> Result<(), PersistError> {
        self.tx.send(write).map_err(|_| PersistError::WorkerGone)
    }

    /// Drain-then-join. Returns the first write failure, if any.
    pub async fn shutdown(self) -> Result<PersistStats, PersistError> {
        let Persister { tx, handle } = self;
        drop(tx);
        Ok(handle.await??)
    }
}

fn run_worker(
    graph: &Path,
    threshold: usize,
    mut rx: mpsc::UnboundedReceiver<WriteRequest>,
) -> Result<PersistStats, JournalError> {
    let mut stats = PersistStats::default();
    let mut pending = Vec::with_capacity(threshold);

    while let Some(write) = rx.blocking_recv() {
        pending.push(write);
        if pending.len() >= threshold {
            flush(graph, &mut pending, &mut stats)?;
        }
    }
    if !pending.is_empty() {
        flush(graph, &mut pending, &mut stats)?;
    }
    debug!(batches = stats.batches, writes = stats.writes, "persister drained");
    Ok(stats)
}

fn flush(
    graph: &Path,
    pending: &mut Vec<WriteRequest>,
    stats: &mut PersistStats,
) -> Result<(), JournalError> {
    let result = journal::write_batch(graph, pending)
        .and_then(|_| journal::apply_batch(graph, pending))
        .and_then(|_| journal::remove(graph));
    if let Err(e) = &result {
        error!(error = %e, writes = pending.len(), "persisting batch failed");
    }
    result?;
    stats.batches += 1;
    stats.writes += pending.len();
    pending.clear();
    Ok(())
}

//! Stream capture: copy a child's stdout/stderr into append-only files.
//!
//! Byte ranges are what make the shared capture files usable later, so the
//! start offset is the file length before the task starts and the end
//! offset is start + bytes copied, read after the pump has drained.

use std::path::Path;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

use super::AgentError;

const PUMP_BUF: usize = 16 * 1024;

/// One capture file opened for appending, with the offset the next byte lands at.
pub struct CaptureTarget {
    pub file: File,
    pub start: u64,
}

pub async fn open_capture(path: &Path) -> Result<CaptureTarget, AgentError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|source| AgentError::Capture {
            path: path.to_path_buf(),
            source,
        })?;
    let start = file
        .metadata()
        .await
        .map_err(|source| AgentError::Capture {
            path: path.to_path_buf(),
            source,
        })?
        .len();
    Ok(CaptureTarget { file, start })
}

/// Spawn a copier. Resolves to the number of bytes written.
///
/// `flush_each` writes through after every chunk (used for stderr so
/// diagnostics are visible while the task runs).
pub fn pump<R>(
    mut rd: R,
    mut target: File,
    label: &'static str,
    flush_each: bool,
) -> JoinHandle<Result<u64, AgentError>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; PUMP_BUF];
        let mut total = 0u64;
        loop {
            let n = rd
                .read(&mut buf)
                .await
                .map_err(|source| AgentError::StreamIo { stream: label, source })?;
            if n == 0 {
                break;
            }
            target
                .write_all(&buf[..n])
                .await
                .map_err(|source| AgentError::StreamIo { stream: label, source })?;
            if flush_each {
                target
                    .flush()
                    .await
                    .map_err(|source| AgentError::StreamIo { stream: label, source })?;
            }
            total += n as u64;
        }
        target
            .flush()
            .await
            .map_err(|source| AgentError::StreamIo { stream: label, source })?;
        Ok(total)
    })
}

/// Wait for a copier and fold a panicked task into an error.
pub async fn join_pump(
    handle: JoinHandle<Result<u64, AgentError>>,
    label: &'static str,
) -> Result<u64, AgentError> {
    handle.await.map_err(|e| AgentError::StreamIo {
        stream: label,
        source: std::io::Error::other(e),
    })?
}

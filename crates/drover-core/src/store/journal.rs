//! Write-ahead journal for graph updates.
//!
//! A batch is durably recorded in `<graph>.journal` before any byte of the
//! graph file is touched, and the journal is deleted only after the batch
//! has been applied and synced. Finding a journal at startup therefore
//! means "the last batch may be half-applied": it is verified and replayed.
//!
//! Renames and deletes are followed by an fsync of the containing directory.
//!
//! File layout: `u64 len | bincode(Vec<WriteRequest>) | u64 len | sha256 hex`.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::graph::{StoreError, WriteRequest, apply_writes};

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("journal truncated while reading {0}")]
    Truncated(&'static str),

    #[error("journal encoding: {0}")]
    Codec(#[from] bincode::Error),

    #[error("journal checksum mismatch: stored {stored}, computed {computed}")]
    ChecksumMismatch { stored: String, computed: String },

    #[error("applying journal: {0}")]
    Apply(#[from] StoreError),
}

/// Result of the startup check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// No journal found: the previous run shut down cleanly.
    Clean,
    /// A journal was verified, replayed and removed.
    Replayed { writes: usize },
}

pub fn journal_path(graph: &Path) -> PathBuf {
    let mut name = graph.as_os_str().to_owned();
    name.push(".journal");
    PathBuf::from(name)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

/// Durably record a batch. Written to a temporary name and renamed, so a
/// crash mid-write never leaves a partial journal behind.
pub fn write_batch(graph: &Path, batch: &[WriteRequest]) -> Result<PathBuf, JournalError> {
    let path = journal_path(graph);
    let payload = bincode::serialize(batch)?;
    let checksum = sha256_hex(&payload);

    let mut bytes = Vec::with_capacity(16 + payload.len() + checksum.len());
    bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&payload);
    bytes.extend_from_slice(&(checksum.len() as u64).to_le_bytes());
    bytes.extend_from_slice(checksum.as_bytes());

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let io_err = |source| JournalError::Io {
        path: path.clone(),
        source,
    };
    let mut file = File::create(&tmp).map_err(io_err)?;
    file.write_all(&bytes).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    fs::rename(&tmp, &path).map_err(io_err)?;
    // the rename is only durable once the directory entry is
    sync_parent(&path)?;

    debug!(path = %path.display(), writes = batch.len(), "journal written");
    Ok(path)
}

/// Load, parse and verify a journal file.
pub fn read_batch(path: &Path) -> Result<Vec<WriteRequest>, JournalError> {
    let bytes = fs::read(path).map_err(|source| JournalError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut cursor = bytes.as_slice();
    let payload = take_frame(&mut cursor, "payload")?;
    let stored = take_frame(&mut cursor, "checksum")?;
    let stored = String::from_utf8_lossy(stored).into_owned();

    let computed = sha256_hex(payload);
    if stored != computed {
        return Err(JournalError::ChecksumMismatch { stored, computed });
    }
    Ok(bincode::deserialize(payload)?)
}

/// Overwrite the graph with a verified batch.
pub fn apply_batch(graph: &Path, batch: &[WriteRequest]) -> Result<(), JournalError> {
    apply_writes(graph, batch)?;
    Ok(())
}

pub fn remove(graph: &Path) -> Result<(), JournalError> {
    let path = journal_path(graph);
    match fs::remove_file(&path) {
        Ok(()) => sync_parent(&path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(JournalError::Io { path, source }),
    }
}

/// fsync the directory holding `path`, making a rename or unlink durable.
pub(crate) fn sync_parent(path: &Path) -> Result<(), JournalError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|source| JournalError::Io {
            path: dir.to_path_buf(),
            source,
        })
}

/// Startup check. Any error here must stop the coordinator.
pub fn recover(graph: &Path) -> Result<Recovery, JournalError> {
    let path = journal_path(graph);
    if !path.exists() {
        return Ok(Recovery::Clean);
    }

    info!(path = %path.display(), "found journal from an interrupted run");
    let batch = read_batch(&path)?;
    apply_batch(graph, &batch)?;
    remove(graph)?;
    info!(writes = batch.len(), "journal replayed");
    Ok(Recovery::Replayed {
        writes: batch.len(),
    })
}

fn take_frame<'a>(cursor: &mut &'a [u8], what: &'static str) -> Result<&'a [u8], JournalError> {
    if cursor.len() < 8 {
        return Err(JournalError::Truncated(what));
    }
    let (len_bytes, rest) = cursor.split_at(8);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(len_bytes);
    let len = u64::from_le_bytes(buf) as usize;
    if rest.len() < len {
        return Err(JournalError::Truncated(what));
    }
    let (frame, rest) = rest.split_at(len);
    *cursor = rest;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::GroupId;
    use crate::store::graph::GraphStore;
    use crate::store::graph::fixtures::chain;

    fn completed_update(store: &mut GraphStore, group: GroupId) -> WriteRequest {
        store.group_mut(group).unwrap().tasks[0].mark_completed(0);
        store.encode_update(group).unwrap()
    }

    #[test]
    fn missing_journal_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let graph = dir.path().join("graph.bin");
        GraphStore::create(&graph, chain()).unwrap();
        assert_eq!(recover(&graph).unwrap(), Recovery::Clean);
    }

    #[test]
    fn applying_twice_equals_applying_once() {
        let dir = tempfile::tempdir().unwrap();
        let graph = dir.path().join("graph.bin");
        let mut store = GraphStore::create(&graph, chain()).unwrap();
        let batch = vec![
            completed_update(&mut store, GroupId(0)),
            completed_update(&mut store, GroupId(1)),
        ];

        apply_batch(&graph, &batch).unwrap();
        let once = fs::read(&graph).unwrap();
        apply_batch(&graph, &batch).unwrap();
        let twice = fs::read(&graph).unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn crash_before_apply_converges_on_restart() {
        let dir = tempfile::tempdir().unwrap();
        let graph = dir.path().join("graph.bin");
        let mut store = GraphStore::create(&graph, chain()).unwrap();
        let batch = vec![completed_update(&mut store, GroupId(0))];

        // reference: an uninterrupted run
        let reference = dir.path().join("reference.bin");
        fs::copy(&graph, &reference).unwrap();
        apply_batch(&reference, &batch).unwrap();

        // journal written, then the process dies
        write_batch(&graph, &batch).unwrap();
        assert!(journal_path(&graph).exists());

        assert_eq!(recover(&graph).unwrap(), Recovery::Replayed { writes: 1 });
        assert!(!journal_path(&graph).exists());
        assert_eq!(fs::read(&graph).unwrap(), fs::read(&reference).unwrap());

        let reopened = GraphStore::open(&graph).unwrap();
        assert!(reopened.group(GroupId(0)).unwrap().tasks[0].completed);
    }

    #[test]
    fn crash_after_apply_before_delete_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let graph = dir.path().join("graph.bin");
        let mut store = GraphStore::create(&graph, chain()).unwrap();
        let batch = vec![completed_update(&mut store, GroupId(1))];

        write_batch(&graph, &batch).unwrap();
        apply_batch(&graph, &batch).unwrap();
        let applied = fs::read(&graph).unwrap();

        recover(&graph).unwrap();
        assert_eq!(fs::read(&graph).unwrap(), applied);
        assert!(!journal_path(&graph).exists());
    }

    #[test]
    fn checksum_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let graph = dir.path().join("graph.bin");
        let mut store = GraphStore::create(&graph, chain()).unwrap();
        let original = fs::read(&graph).unwrap();
        let batch = vec![completed_update(&mut store, GroupId(0))];

        let path = write_batch(&graph, &batch).unwrap();
        let mut bytes = fs::read(&path).unwrap();
        bytes[12] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let err = recover(&graph).unwrap_err();
        assert!(matches!(err, JournalError::ChecksumMismatch { .. }));
        // nothing applied, journal kept for the operator
        assert_eq!(fs::read(&graph).unwrap(), original);
        assert!(path.exists());
    }

    #[test]
    fn truncated_journal_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let graph = dir.path().join("graph.bin");
        GraphStore::create(&graph, chain()).unwrap();
        fs::write(journal_path(&graph), [1u8, 0, 0]).unwrap();

        assert!(matches!(
            recover(&graph),
            Err(JournalError::Truncated("payload"))
        ));
    }

    #[test]
    fn written_journal_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let graph = dir.path().join("pipe.graph");
        let mut store = GraphStore::create(&graph, chain()).unwrap();
        let write = completed_update(&mut store, GroupId(0));

        let path = write_batch(&graph, &[write]).unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("pipe.graph.journal.tmp").exists());

        remove(&graph).unwrap();
        assert!(!path.exists());
        // a second remove is a no-op
        remove(&graph).unwrap();
    }

    #[test]
    fn parent_sync_handles_bare_names() {
        sync_parent(Path::new("pipe.graph.journal")).unwrap();
        let dir = tempfile::tempdir().unwrap();
        sync_parent(&dir.path().join("x.journal")).unwrap();
        assert!(matches!(
            sync_parent(&dir.path().join("missing/x.journal")),
            Err(JournalError::Io { .. })
        ));
    }

    #[test]
    fn journal_name_appends_suffix() {
        assert_eq!(
            journal_path(Path::new("/data/run.graph")),
            PathBuf::from("/data/run.graph.journal")
        );
    }
}

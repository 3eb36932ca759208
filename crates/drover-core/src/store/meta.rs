//! Append-only meta log of run records (one JSON document per line).

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::domain::RunRecord;

#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("meta log i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("encoding run record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("meta log line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

pub fn meta_path(graph: &Path) -> PathBuf {
    let mut name = graph.as_os_str().to_owned();
    name.push(".meta");
    PathBuf::from(name)
}

pub struct MetaLog {
    path: PathBuf,
    file: File,
}

impl MetaLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, MetaError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| MetaError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &RunRecord) -> Result<(), MetaError> {
        let mut line = serde_json::to_vec(record).map_err(MetaError::Encode)?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|_| self.file.flush())
            .map_err(|source| MetaError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

/// Read every record back, for tooling and tests.
pub fn read_all(path: &Path) -> Result<Vec<RunRecord>, MetaError> {
    let io_err = |source| MetaError::Io {
        path: path.to_path_buf(),
        source,
    };
    let reader = BufReader::new(File::open(path).map_err(io_err)?);
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(io_err)?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| MetaError::Parse {
            line: index + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}

//! Graph file: descriptor table + fixed-capacity group blobs.
//!
//! ```text
//! "DRVG" | u32 version | bincode(Vec<GroupDescriptor>) | slot 0 | slot 1 | ...
//! slot = u64 len | bincode(TaskGroup) | zero padding up to `capacity`
//! ```
//!
//! Updates overwrite a slot in place, so an encoded group must never outgrow
//! the capacity reserved when the file was created.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::{GroupId, TaskGroup};

const MAGIC: &[u8; 4] = b"DRVG";
const FORMAT_VERSION: u32 = 1;
const PREAMBLE_LEN: usize = 8;

/// Bytes reserved beyond the initial encoding, per slot and per task.
/// A task grows by at most 4 bytes (`last_status` going from None to Some).
const SLOT_RESERVE: u64 = 64;
const TASK_RESERVE: u64 = 8;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("graph i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a graph file (bad magic)")]
    BadMagic,

    #[error("unsupported graph format version {0}")]
    UnsupportedVersion(u32),

    #[error("graph encoding: {0}")]
    Codec(#[from] bincode::Error),

    #[error("unknown group {0}")]
    UnknownGroup(GroupId),

    #[error("group {group} needs {needed} bytes but its slot holds {capacity}")]
    SlotOverflow {
        group: GroupId,
        needed: u64,
        capacity: u64,
    },

    #[error("corrupt graph file: {0}")]
    Corrupt(String),
}

/// Where a group's blob lives and how large it may grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    pub offset: u64,
    pub capacity: u64,
    pub rdep_count: u64,
}

/// A pending in-place overwrite of one group slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub group: GroupId,
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// On-disk graph plus its in-memory mirror.
#[derive(Debug)]
pub struct GraphStore {
    path: PathBuf,
    descriptors: Vec<GroupDescriptor>,
    groups: Vec<TaskGroup>,
}

impl GraphStore {
    /// Write a fresh graph file. `groups[i].id` must be `GroupId(i)`.
    pub fn create(path: impl Into<PathBuf>, groups: Vec<TaskGroup>) -> Result<Self, StoreError> {
        let path = path.into();
        for (index, group) in groups.iter().enumerate() {
            if group.id.index() != index {
                return Err(StoreError::Corrupt(format!(
                    "group at position {index} has id {}",
                    group.id
                )));
            }
        }

        let slots = groups
            .iter()
            .map(encode_slot)
            .collect::<Result<Vec<_>, _>>()?;

        let mut descriptors: Vec<GroupDescriptor> = groups
            .iter()
            .zip(&slots)
            .map(|(group, slot)| GroupDescriptor {
                offset: 0,
                capacity: slot.len() as u64 + SLOT_RESERVE + TASK_RESERVE * group.tasks.len() as u64,
                rdep_count: group.reverse_dependencies.len() as u64,
            })
            .collect();

        // descriptor encoding is fixed-width, so the size does not depend on offsets
        let mut offset = PREAMBLE_LEN as u64 + bincode::serialized_size(&descriptors)?;
        for desc in descriptors.iter_mut() {
            desc.offset = offset;
            offset += desc.capacity;
        }

        let file = File::create(&path)?;
        let mut out = BufWriter::new(file);
        out.write_all(MAGIC)?;
        out.write_all(&FORMAT_VERSION.to_le_bytes())?;
        out.write_all(&bincode::serialize(&descriptors)?)?;
        for (desc, slot) in descriptors.iter().zip(&slots) {
            out.write_all(slot)?;
            let padding = desc.capacity as usize - slot.len();
            out.write_all(&vec![0u8; padding])?;
        }
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        Ok(Self {
            path,
            descriptors,
            groups,
        })
    }

    /// Load the descriptor table and every group into memory.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let bytes = fs::read(&path)?;
        if bytes.len() < PREAMBLE_LEN || &bytes[..4] != MAGIC {
            return Err(StoreError::BadMagic);
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion(version));
        }

        let descriptors: Vec<GroupDescriptor> = bincode::deserialize(&bytes[PREAMBLE_LEN..])?;
        let mut groups = Vec::with_capacity(descriptors.len());
        for (index, desc) in descriptors.iter().enumerate() {
            let group = decode_slot(&bytes, desc)?;
            if group.id.index() != index {
                return Err(StoreError::Corrupt(format!(
                    "slot {index} holds group {}",
                    group.id
                )));
            }
            groups.push(group);
        }

        Ok(Self {
            path,
            descriptors,
            groups,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups(&self) -> &[TaskGroup] {
        &self.groups
    }

    pub fn group(&self, id: GroupId) -> Option<&TaskGroup> {
        self.groups.get(id.index())
    }

    pub fn group_mut(&mut self, id: GroupId) -> Option<&mut TaskGroup> {
        self.groups.get_mut(id.index())
    }

    pub fn descriptor(&self, id: GroupId) -> Option<&GroupDescriptor> {
        self.descriptors.get(id.index())
    }

    /// Snapshot the in-memory group as an overwrite of its slot.
    pub fn encode_update(&self, id: GroupId) -> Result<WriteRequest, StoreError> {
        let group = self.group(id).ok_or(StoreError::UnknownGroup(id))?;
        let desc = self.descriptor(id).ok_or(StoreError::UnknownGroup(id))?;
        let bytes = encode_slot(group)?;
        if bytes.len() as u64 > desc.capacity {
            return Err(StoreError::SlotOverflow {
                group: id,
                needed: bytes.len() as u64,
                capacity: desc.capacity,
            });
        }
        Ok(WriteRequest {
            group: id,
            offset: desc.offset,
            bytes,
        })
    }

    /// Largest thread hint over all groups (default worker size).
    pub fn max_threads(&self) -> u32 {
        self.groups.iter().map(|g| g.threads).max().unwrap_or(1).max(1)
    }

    pub fn task_count(&self) -> usize {
        self.groups.iter().map(|g| g.tasks.len()).sum()
    }

    pub fn completed_count(&self) -> usize {
        self.groups
            .iter()
            .map(|g| g.tasks.len() - g.unfinished())
            .sum()
    }
}

/// Overwrite slots in place and fsync. Pure overwrite-by-offset, so running
/// the same batch twice leaves the file identical.
pub fn apply_writes(path: &Path, writes: &[WriteRequest]) -> Result<(), StoreError> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    for write in writes {
        file.seek(SeekFrom::Start(write.offset))?;
        file.write_all(&write.bytes)?;
    }
    file.sync_all()?;
    Ok(())
}

fn encode_slot(group: &TaskGroup) -> Result<Vec<u8>, StoreError> {
    let body = bincode::serialize(group)?;
    let mut slot = Vec::with_capacity(8 + body.len());
    slot.extend_from_slice(&(body.len() as u64).to_le_bytes());
    slot.extend_from_slice(&body);
    Ok(slot)
}

fn decode_slot(bytes: &[u8], desc: &GroupDescriptor) -> Result<TaskGroup, StoreError> {
    let start = desc.offset as usize;
    let end = start
        .checked_add(desc.capacity as usize)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| StoreError::Corrupt(format!("slot at {} runs past end of file", desc.offset)))?;
    let slot = &bytes[start..end];
    if slot.len() < 8 {
        return Err(StoreError::Corrupt(format!("slot at {} too small", desc.offset)));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&slot[..8]);
    let len = u64::from_le_bytes(len_bytes) as usize;
    if 8 + len > slot.len() {
        return Err(StoreError::Corrupt(format!(
            "blob of {len} bytes overflows slot at {}",
            desc.offset
        )));
    }
    Ok(bincode::deserialize(&slot[8..8 + len])?)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::domain::{Command, GroupId, Task, TaskGroup};

    pub fn sh(cmd: &str) -> Command {
        Command::Exec {
            argv: vec!["sh".into(), "-c".into(), cmd.into()],
        }
    }

    /// A -> B chain: group 1 depends on group 0, one task each.
    pub fn chain() -> Vec<TaskGroup> {
        let mut a = TaskGroup::new(GroupId(0), vec![Task::new(sh("true"))]);
        let mut b = TaskGroup::new(GroupId(1), vec![Task::new(sh("true"))]);
        b.dependencies = vec![GroupId(0)];
        a.reverse_dependencies = vec![GroupId(1)];
        a.threads = 2;
        b.threads = 4;
        vec![a, b]
    }
}

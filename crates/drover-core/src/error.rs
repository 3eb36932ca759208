use thiserror::Error;

use crate::agent::RegistryError;
use crate::domain::TaskRef;
use crate::store::{JournalError, MetaError, PersistError, StoreError};

/// Anything that stops the coordinator.
///
/// Task failures never show up here; they are scheduling outcomes.
#[derive(Debug, Error)]
pub enum DroverError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("journal recovery failed: {0}")]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("meta log: {0}")]
    Meta(#[from] MetaError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("coordinator i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("task {0} is not in the graph")]
    UnknownTask(TaskRef),
}

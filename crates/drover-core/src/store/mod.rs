//! Durable state: graph file, write-ahead journal, background persister,
//! and the run-record meta log.

pub mod builder;
pub mod graph;
pub mod journal;
pub mod meta;
pub mod persister;

pub use builder::{BuildError, GroupSpec, TaskSpec, build_groups};
pub use graph::{GraphStore, GroupDescriptor, StoreError, WriteRequest, apply_writes};
pub use journal::{JournalError, Recovery, journal_path};
pub use meta::{MetaError, MetaLog, meta_path};
pub use persister::{DEFAULT_FLUSH_THRESHOLD, PersistError, PersistStats, Persister};

//! Dataset backend trait and implementations for vm-state

mod memory;
mod zfs_cli;

pub use memory::{FailOn, MemoryBackend};
pub use zfs_cli::ZfsCliBackend;

use crate::error::Result;
use std::path::Path;

/// A filesystem dataset as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetEntry {
    /// Fully-qualified dataset name, e.g. `microvms/storage/states/alpha`
    pub name: String,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

/// A snapshot as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    /// `dataset@snapshot`
    pub full_name: String,
    /// Seconds since the Unix epoch
    pub creation: u64,
    pub referenced_bytes: u64,
}

/// The copy-on-write storage vocabulary vm-state relies on.
///
/// Every name is fully qualified. Implementations surface failures verbatim
/// and never retry; existence checks belong to the caller.
pub trait DatasetBackend {
    /// Whether a filesystem dataset exists
    fn exists(&self, dataset: &str) -> Result<bool>;

    /// Create an empty dataset mounted at `mountpoint`
    fn create(&self, dataset: &str, mountpoint: &Path) -> Result<()>;

    /// Destroy a dataset or snapshot; `recursive` also destroys descendants
    /// and snapshots
    fn destroy(&self, name: &str, recursive: bool) -> Result<()>;

    /// Create `dataset@name`
    fn snapshot(&self, snapshot: &str) -> Result<()>;

    /// Create a dataset dependent on `snapshot`, mounted at `mountpoint`, with
    /// the given user properties set as part of the clone
    fn clone_snapshot(
        &self,
        snapshot: &str,
        dataset: &str,
        mountpoint: &Path,
        properties: &[(&str, &str)],
    ) -> Result<()>;

    /// Sever a clone's dependency on its origin snapshot.
    ///
    /// The origin snapshot, and every older snapshot of the origin's dataset,
    /// moves to the promoted dataset; the former parent becomes a clone of the
    /// moved origin snapshot.
    fn promote(&self, dataset: &str) -> Result<()>;

    /// Value of a user property set locally on `dataset`, `None` when unset
    fn property(&self, dataset: &str, name: &str) -> Result<Option<String>>;

    /// Remove a user property from `dataset`
    fn clear_property(&self, dataset: &str, name: &str) -> Result<()>;

    /// The origin snapshot of a clone, `None` for independent datasets
    fn origin(&self, dataset: &str) -> Result<Option<String>>;

    /// Used and available bytes of one dataset
    fn usage(&self, dataset: &str) -> Result<DatasetEntry>;

    /// Immediate child datasets of `parent`, excluding `parent` and snapshots
    fn children(&self, parent: &str) -> Result<Vec<DatasetEntry>>;

    /// Snapshots of `dataset`, or of it and all descendants when `recursive`
    fn snapshots(&self, dataset: &str, recursive: bool) -> Result<Vec<SnapshotEntry>>;
}

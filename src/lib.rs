//! vm-state: Manage portable MicroVM states
//!
//! Slots are fixed network identities, each run as one VM unit. States are
//! copy-on-write datasets holding a VM's disk. A slot uses whichever state is
//! assigned to it through a symlinked backing file, so states can be
//! snapshotted, cloned, restored and moved between slots without rebuilding
//! VM images.
//!
//! Storage sits behind [`DatasetBackend`] and the init system behind
//! [`UnitControl`]; [`VmStateManager`] composes both with the assignment
//! record and the slot links.

pub mod assignments;
pub mod backend;
pub mod config;
pub mod error;
pub mod indirection;
pub mod manager;
pub mod ownership;
pub mod store;
pub mod types;
pub mod vm;

pub use backend::DatasetBackend;
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use manager::{ReconcileReport, VmStateManager};
pub use types::{
    Slot, SlotAssignment, SlotSet, Snapshot, SnapshotInfo, State, StateInfo, VmInfo, VmStatus,
};
pub use vm::UnitControl;

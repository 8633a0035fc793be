//! Error types for vm-state

use crate::types::{Slot, State};
use thiserror::Error;

/// Result type alias for vm-state operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during vm-state operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("State '{0}' already exists")]
    StateAlreadyExists(State),

    #[error("State '{0}' does not exist")]
    StateNotFound(State),

    #[error("State '{state}' is assigned to {slot}. Reassign it first.")]
    StateInUse { state: State, slot: Slot },

    #[error("Snapshot '{0}' not found")]
    SnapshotNotFound(String),

    #[error("Invalid slot '{0}'")]
    InvalidSlot(String),

    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("Command failed: {command}\nstderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Dataset backend error: {0}")]
    Backend(String),

    #[error("Unit control error: {0}")]
    Systemd(String),

    #[error("Cannot set ownership on {path}: {reason}")]
    Ownership { path: String, reason: String },

    #[error("{operation} failed after completing [{}]: {source}", .completed.join(", "))]
    PartialFailure {
        operation: String,
        completed: Vec<&'static str>,
        #[source]
        source: Box<Error>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("System call failed: {0}")]
    Nix(#[from] nix::Error),

    #[error("Permission denied: must run as root")]
    PermissionDenied,

    #[error("{0}")]
    Other(String),
}

/// Coarse classification of an [`Error`], stable across backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InUse,
    InvalidSlot,
    InvalidName,
    BackendFailure,
    PartialFailure,
    Io,
    Config,
    PermissionDenied,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::StateNotFound(_) | Error::SnapshotNotFound(_) => ErrorKind::NotFound,
            Error::StateAlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::StateInUse { .. } => ErrorKind::InUse,
            Error::InvalidSlot(_) => ErrorKind::InvalidSlot,
            Error::InvalidName { .. } => ErrorKind::InvalidName,
            Error::CommandFailed { .. }
            | Error::Backend(_)
            | Error::Systemd(_)
            | Error::Ownership { .. }
            | Error::Nix(_)
            | Error::Other(_) => ErrorKind::BackendFailure,
            Error::PartialFailure { .. } => ErrorKind::PartialFailure,
            Error::Io(_) | Error::Json(_) => ErrorKind::Io,
            Error::Config(_) => ErrorKind::Config,
            Error::PermissionDenied => ErrorKind::PermissionDenied,
        }
    }
}

/// Tracks the completed steps of a multi-step mutation so a failure after the
/// first step is reported as [`Error::PartialFailure`].
pub(crate) struct Steps {
    operation: String,
    completed: Vec<&'static str>,
}

impl Steps {
    pub(crate) fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            completed: Vec::new(),
        }
    }

    pub(crate) fn run<T>(
        &mut self,
        step: &'static str,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        match f() {
            Ok(value) => {
                self.completed.push(step);
                Ok(value)
            }
            Err(e) if self.completed.is_empty() => Err(e),
            Err(e) => Err(Error::PartialFailure {
                operation: self.operation.clone(),
                completed: self.completed.clone(),
                source: Box::new(e),
            }),
        }
    }
}

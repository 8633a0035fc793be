//! Core types for vm-state management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A slot represents a fixed network identity (slot1 = 10.1.0.2, etc.)
///
/// Slot names are `slot<N>` with `N` in 1..=254; the number selects the
/// subnet. Whether a slot is usable on this host is decided by [`SlotSet`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Slot {
    number: u8,
    name: String,
}

impl Slot {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into().to_lowercase();
        let number = name
            .strip_prefix("slot")
            .and_then(|n| n.parse::<u8>().ok())
            .filter(|n| (1..=254).contains(n))
            .ok_or_else(|| Error::InvalidSlot(name.clone()))?;
        Ok(Slot { number, name })
    }

    /// Get the slot's IP address
    pub fn ip(&self) -> String {
        format!("10.{}.0.2", self.number)
    }

    /// Get the systemd unit name, e.g. `microvm@slot1.service`
    pub fn unit_name(&self, prefix: &str) -> String {
        format!("{}{}.service", prefix, self.name)
    }

    /// Get the slot name as a string
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// The state a slot uses when nothing was assigned to it
    pub fn default_state(&self) -> State {
        State(self.name.clone())
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl FromStr for Slot {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Slot::new(s)
    }
}

impl TryFrom<String> for Slot {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Slot::new(s)
    }
}

impl From<Slot> for String {
    fn from(slot: Slot) -> String {
        slot.name
    }
}

/// The closed set of slots deployed on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSet(Vec<Slot>);

impl SlotSet {
    pub fn new(slots: Vec<Slot>) -> Self {
        let mut slots = slots;
        slots.sort();
        slots.dedup();
        SlotSet(slots)
    }

    /// Parse a list of slot names
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let slots = names
            .iter()
            .map(|n| Slot::new(n.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(SlotSet::new(slots))
    }

    pub fn contains(&self, slot: &Slot) -> bool {
        self.0.contains(slot)
    }

    /// Check that `slot` belongs to this set
    pub fn check(&self, slot: &Slot) -> Result<()> {
        if self.contains(slot) {
            Ok(())
        } else {
            Err(Error::InvalidSlot(slot.to_string()))
        }
    }

    /// Parse a slot name and check membership
    pub fn resolve(&self, name: &str) -> Result<Slot> {
        let slot = Slot::new(name)?;
        self.check(&slot)?;
        Ok(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Slot] {
        &self.0
    }
}

impl Default for SlotSet {
    fn default() -> Self {
        SlotSet((1..=5).map(|n| Slot { number: n, name: format!("slot{n}") }).collect())
    }
}

/// Validates a state or snapshot name. Names end up as ZFS dataset components
/// and command-line arguments.
fn validate_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("name cannot be empty")
    } else if name == "." || name == ".." {
        Some("name cannot be '.' or '..'")
    } else if name.contains('/') || name.contains('@') {
        Some("name cannot contain '/' or '@'")
    } else if name.chars().any(char::is_whitespace) {
        Some("name cannot contain whitespace")
    } else if name.starts_with('-') {
        Some("name cannot start with '-'")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(Error::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// A state name (portable data container)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct State(String);

impl State {
    /// Create a new state from a name
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(State(name))
    }

    /// Get the state name
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        State::new(s)
    }
}

impl TryFrom<String> for State {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        State::new(s)
    }
}

impl From<State> for String {
    fn from(state: State) -> String {
        state.0
    }
}

/// A snapshot name (the part after '@')
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Snapshot(String);

impl Snapshot {
    /// Create a new snapshot from a name
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Snapshot(name))
    }

    /// Get the snapshot name
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Snapshot {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Snapshot::new(s)
    }
}

/// Status of a slot's VM unit as reported by the init system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    Running,
    Stopped,
    Failed,
    Unknown,
}

impl VmStatus {
    /// Map a systemd `ActiveState` value
    pub fn from_active_state(active_state: &str) -> Self {
        match active_state.trim() {
            "active" | "activating" => VmStatus::Running,
            "inactive" | "deactivating" => VmStatus::Stopped,
            "failed" => VmStatus::Failed,
            _ => VmStatus::Unknown,
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmStatus::Running => "running",
            VmStatus::Stopped => "stopped",
            VmStatus::Failed => "failed",
            VmStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Information about a slot's VM
#[derive(Debug, Clone)]
pub struct VmInfo {
    pub slot: Slot,
    pub status: VmStatus,
    pub assigned_state: State,
    pub ip: String,
}

/// A slot and the state it currently uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAssignment {
    pub slot: Slot,
    pub state: State,
}

/// Information about a state
#[derive(Debug, Clone)]
pub struct StateInfo {
    pub state: State,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub zfs_dataset: String,
    pub mountpoint: PathBuf,
}

/// Information about a snapshot
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub state: State,
    pub snapshot: Snapshot,
    pub full_name: String,
    /// Seconds since the Unix epoch
    pub creation: u64,
    pub referenced_bytes: u64,
}

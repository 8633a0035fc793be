//! Slot-to-state assignment record
//!
//! The record is one JSON object mapping slot name to state name. A slot
//! missing from the object uses the state named after itself. Every update is a
//! whole-file read-modify-write done under an exclusive lock on a sidecar
//! `.lock` file, and the new content replaces the old file atomically.

use crate::error::{Error, Result};
use crate::types::{Slot, SlotAssignment, SlotSet, State};
use nix::fcntl::{flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Slot-to-state assignments stored in JSON
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Assignments(BTreeMap<String, String>);

impl Assignments {
    /// The state assigned to `slot`, defaulting to the slot's own name
    pub fn state_for(&self, slot: &Slot) -> Result<State> {
        match self.0.get(slot.as_str()) {
            Some(name) => State::new(name.as_str()),
            None => Ok(slot.default_state()),
        }
    }

    pub fn set(&mut self, slot: &Slot, state: &State) {
        self.0
            .insert(slot.as_str().to_string(), state.name().to_string());
    }
}

/// Exclusive lock held for the duration of a read-modify-write
struct AssignmentLock {
    _file: File,
}

impl AssignmentLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive)?;
        Ok(Self { _file: file })
    }
}

/// Persisted slot → state mapping
#[derive(Debug, Clone)]
pub struct AssignmentStore {
    path: PathBuf,
    slots: SlotSet,
}

impl AssignmentStore {
    pub fn new(path: impl Into<PathBuf>, slots: SlotSet) -> Self {
        Self {
            path: path.into(),
            slots,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Load assignments from file
    pub fn load(&self) -> Result<Assignments> {
        if self.path.exists() {
            let content = fs::read_to_string(&self.path)?;
            if content.trim().is_empty() {
                return Ok(Assignments::default());
            }
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(Assignments::default())
        }
    }

    fn save(&self, assignments: &Assignments) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        let content = serde_json::to_string_pretty(assignments)?;
        tmp.write_all(content.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Read-modify-write the record under the exclusive lock
    pub fn update<F>(&self, f: F) -> Result<Assignments>
    where
        F: FnOnce(&mut Assignments),
    {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let _lock = AssignmentLock::acquire(&self.lock_path())?;
        let mut assignments = self.load()?;
        f(&mut assignments);
        self.save(&assignments)?;
        Ok(assignments)
    }

    /// Get the state assigned to a slot
    pub fn get_slot_state(&self, slot: &Slot) -> Result<State> {
        self.slots.check(slot)?;
        self.load()?.state_for(slot)
    }

    /// Persist `slot → state`
    pub fn set_slot_state(&self, slot: &Slot, state: &State) -> Result<()> {
        self.slots.check(slot)?;
        self.update(|assignments| assignments.set(slot, state))?;
        debug!(slot = %slot, state = %state, "assignment recorded");
        Ok(())
    }

    /// One entry per configured slot
    pub fn list_assignments(&self) -> Result<Vec<SlotAssignment>> {
        let assignments = self.load()?;
        self.slots
            .iter()
            .map(|slot| {
                Ok(SlotAssignment {
                    slot: slot.clone(),
                    state: assignments.state_for(slot)?,
                })
            })
            .collect()
    }

    /// The first slot using `state`, if any
    pub fn is_state_in_use(&self, state: &State) -> Result<Option<Slot>> {
        Ok(self
            .list_assignments()?
            .into_iter()
            .find(|a| a.state == *state)
            .map(|a| a.slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn store(dir: &Path) -> AssignmentStore {
        AssignmentStore::new(dir.join("assignments.json"), SlotSet::default())
    }

    fn slot(name: &str) -> Slot {
        Slot::new(name).unwrap()
    }

    fn state(name: &str) -> State {
        State::new(name).unwrap()
    }

    #[test]
    fn unassigned_slot_uses_own_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        for s in SlotSet::default().iter() {
            assert_eq!(store.get_slot_state(s).unwrap().name(), s.as_str());
        }
    }

    #[test]
    fn assignment_persists_as_json_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.set_slot_state(&slot("slot2"), &state("alpha")).unwrap();

        assert_eq!(store.get_slot_state(&slot("slot2")).unwrap(), state("alpha"));
        let raw: BTreeMap<String, String> =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw.get("slot2").map(String::as_str), Some("alpha"));
        assert_eq!(raw.len(), 1);
    }

    #[test]
    fn update_preserves_other_slots() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.set_slot_state(&slot("slot1"), &state("a")).unwrap();
        store.set_slot_state(&slot("slot3"), &state("c")).unwrap();

        let listed = store.list_assignments().unwrap();
        assert_eq!(listed.len(), 5);
        assert_eq!(listed[0].state, state("a"));
        assert_eq!(listed[1].state, state("slot2"));
        assert_eq!(listed[2].state, state("c"));
    }

    #[test]
    fn in_use_scans_defaults_too() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert_eq!(store.is_state_in_use(&state("slot4")).unwrap(), Some(slot("slot4")));
        assert_eq!(store.is_state_in_use(&state("alpha")).unwrap(), None);

        store.set_slot_state(&slot("slot4"), &state("alpha")).unwrap();
        assert_eq!(store.is_state_in_use(&state("alpha")).unwrap(), Some(slot("slot4")));
        assert_eq!(store.is_state_in_use(&state("slot4")).unwrap(), None);
    }

    #[test]
    fn unknown_slot_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let err = store.set_slot_state(&slot("slot9"), &state("a")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSlot);
        assert!(!store.path().exists());
    }

    #[test]
    fn corrupt_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        fs::write(store.path(), "{not json").unwrap();
        assert_eq!(store.get_slot_state(&slot("slot1")).unwrap_err().kind(), ErrorKind::Io);
    }
}

//! State and snapshot management over a dataset backend

use crate::assignments::AssignmentStore;
use crate::backend::{DatasetBackend, SnapshotEntry};
use crate::config::{Config, Ownership};
use crate::error::{Error, Result, Steps};
use crate::ownership;
use crate::types::{Snapshot, SnapshotInfo, State, StateInfo};
use std::path::PathBuf;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// User property marking a clone whose clone/promote sequence has not finished
pub const PENDING_PROPERTY: &str = "vm-state:pending";

/// States are datasets named `<pool>/<dataset>/<state>` and mounted at
/// `<states_dir>/<state>`.
pub struct StateStore<B> {
    backend: B,
    assignments: AssignmentStore,
    base_dataset: String,
    states_dir: PathBuf,
    backing_file: String,
    ownership: Option<Ownership>,
}

impl<B: DatasetBackend> StateStore<B> {
    pub fn new(backend: B, config: &Config, assignments: AssignmentStore) -> Self {
        Self {
            backend,
            assignments,
            base_dataset: config.base_dataset(),
            states_dir: config.states_dir.clone(),
            backing_file: config.backing_file.clone(),
            ownership: config.ownership.clone(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Get the full dataset path for a state
    pub fn dataset_path(&self, state: &State) -> String {
        format!("{}/{}", self.base_dataset, state.name())
    }

    /// Get the mount directory of a state
    pub fn state_dir(&self, state: &State) -> PathBuf {
        self.states_dir.join(state.name())
    }

    /// Get the backing file path inside a state
    pub fn state_backing_file(&self, state: &State) -> PathBuf {
        self.state_dir(state).join(&self.backing_file)
    }

    /// Map a dataset name back to its state, `None` outside the namespace
    fn state_of_dataset(&self, dataset: &str) -> Option<State> {
        let rest = dataset.strip_prefix(&self.base_dataset)?.strip_prefix('/')?;
        if rest.contains('/') {
            return None;
        }
        State::new(rest).ok()
    }

    fn snapshot_info(&self, entry: SnapshotEntry) -> Option<SnapshotInfo> {
        let (dataset, snap_name) = entry.full_name.split_once('@')?;
        let state = self.state_of_dataset(dataset)?;
        let snapshot = Snapshot::new(snap_name).ok()?;
        Some(SnapshotInfo {
            state,
            snapshot,
            full_name: entry.full_name,
            creation: entry.creation,
            referenced_bytes: entry.referenced_bytes,
        })
    }

    /// Check if a state exists
    pub fn state_exists(&self, state: &State) -> Result<bool> {
        self.backend.exists(&self.dataset_path(state))
    }

    /// Create a new empty state
    #[instrument(skip(self))]
    pub fn create_state(&self, state: &State) -> Result<()> {
        if self.state_exists(state)? {
            return Err(Error::StateAlreadyExists(state.clone()));
        }

        let dataset = self.dataset_path(state);
        let mountpoint = self.state_dir(state);
        self.backend.create(&dataset, &mountpoint)?;
        ownership::apply(&mountpoint, self.ownership.as_ref())?;

        info!(dataset = %dataset, "state created");
        Ok(())
    }

    /// Delete a state and its snapshots. Refused while a slot uses the state
    /// unless `force` is set.
    #[instrument(skip(self))]
    pub fn delete_state(&self, state: &State, force: bool) -> Result<()> {
        if !self.state_exists(state)? {
            return Err(Error::StateNotFound(state.clone()));
        }

        if let Some(slot) = self.assignments.is_state_in_use(state)? {
            if !force {
                return Err(Error::StateInUse {
                    state: state.clone(),
                    slot,
                });
            }
            warn!(slot = %slot, "deleting state that is still assigned");
        }

        let dataset = self.dataset_path(state);

        // A promoted clone leaves its source depending on a snapshot that now
        // lives here; hand those snapshots back before destroying them.
        for (dependent, origin) in self.clones_of(&dataset)? {
            info!(dependent = %dependent, origin = %origin, "promoting dependent state");
            self.backend.promote(&self.dataset_path(&dependent))?;
        }

        // Delete all snapshots first
        for snap in self.backend.snapshots(&dataset, false)? {
            self.backend.destroy(&snap.full_name, false)?;
        }

        self.backend.destroy(&dataset, false)?;

        info!(dataset = %dataset, "state deleted");
        Ok(())
    }

    /// Clone a state to a new, independent state
    #[instrument(skip(self))]
    pub fn clone_state(&self, source: &State, destination: &State) -> Result<()> {
        if !self.state_exists(source)? {
            return Err(Error::StateNotFound(source.clone()));
        }
        if self.state_exists(destination)? {
            return Err(Error::StateAlreadyExists(destination.clone()));
        }

        let src_dataset = self.dataset_path(source);
        let clone_snap = format!(
            "{}@clone-for-{}-{}",
            src_dataset,
            destination.name(),
            Uuid::new_v4().simple()
        );

        let mut steps = Steps::new(format!("clone of '{}' to '{}'", source, destination));
        steps.run("snapshot", || self.backend.snapshot(&clone_snap))?;
        self.materialize(&mut steps, &clone_snap, destination)?;

        info!("state cloned");
        Ok(())
    }

    /// Clone `snapshot` into `destination`, promote it and fix ownership
    fn materialize(&self, steps: &mut Steps, snapshot: &str, destination: &State) -> Result<()> {
        let dst_dataset = self.dataset_path(destination);
        let dst_mountpoint = self.state_dir(destination);

        steps.run("clone", || {
            self.backend.clone_snapshot(
                snapshot,
                &dst_dataset,
                &dst_mountpoint,
                &[(PENDING_PROPERTY, "on")],
            )
        })?;
        steps.run("promote", || self.backend.promote(&dst_dataset))?;
        steps.run("set ownership", || {
            ownership::apply(&dst_mountpoint, self.ownership.as_ref())
        })?;
        steps.run("clear pending marker", || {
            self.backend.clear_property(&dst_dataset, PENDING_PROPERTY)
        })?;
        Ok(())
    }

    /// Get usage information for a state
    pub fn get_state_info(&self, state: &State) -> Result<StateInfo> {
        if !self.state_exists(state)? {
            return Err(Error::StateNotFound(state.clone()));
        }
        let entry = self.backend.usage(&self.dataset_path(state))?;
        Ok(StateInfo {
            state: state.clone(),
            used_bytes: entry.used_bytes,
            available_bytes: entry.available_bytes,
            zfs_dataset: entry.name,
            mountpoint: self.state_dir(state),
        })
    }

    /// List all states (immediate children of the base dataset)
    pub fn list_states(&self) -> Result<Vec<StateInfo>> {
        let mut states = Vec::new();
        for entry in self.backend.children(&self.base_dataset)? {
            let Some(state) = self.state_of_dataset(&entry.name) else {
                warn!(dataset = %entry.name, "skipping dataset with unusable state name");
                continue;
            };
            states.push(StateInfo {
                mountpoint: self.state_dir(&state),
                state,
                used_bytes: entry.used_bytes,
                available_bytes: entry.available_bytes,
                zfs_dataset: entry.name,
            });
        }
        Ok(states)
    }

    /// Create `state@snapshot`
    #[instrument(skip(self))]
    pub fn create_snapshot(&self, state: &State, snapshot: &Snapshot) -> Result<()> {
        if !self.state_exists(state)? {
            return Err(Error::StateNotFound(state.clone()));
        }
        let full_name = format!("{}@{}", self.dataset_path(state), snapshot.name());
        self.backend.snapshot(&full_name)?;
        info!(snapshot = %full_name, "snapshot created");
        Ok(())
    }

    /// Destroy `state@snapshot`; only the snapshot itself has to exist
    #[instrument(skip(self))]
    pub fn delete_snapshot(&self, state: &State, snapshot: &Snapshot) -> Result<()> {
        let full_name = format!("{}@{}", self.dataset_path(state), snapshot.name());
        self.backend.destroy(&full_name, false)?;
        info!(snapshot = %full_name, "snapshot deleted");
        Ok(())
    }

    /// Restore a snapshot, found by name in any state, to a new state
    #[instrument(skip(self))]
    pub fn restore_snapshot(&self, snapshot: &Snapshot, new_state: &State) -> Result<()> {
        let snap = self
            .find_snapshot(snapshot)?
            .ok_or_else(|| Error::SnapshotNotFound(snapshot.name().to_string()))?;

        if self.state_exists(new_state)? {
            return Err(Error::StateAlreadyExists(new_state.clone()));
        }

        let mut steps = Steps::new(format!(
            "restore of '{}' to '{}'",
            snap.full_name, new_state
        ));
        self.materialize(&mut steps, &snap.full_name, new_state)?;

        info!(from = %snap.full_name, "snapshot restored");
        Ok(())
    }

    /// List snapshots of one state, or of every state when `state` is `None`
    pub fn list_snapshots(&self, state: Option<&State>) -> Result<Vec<SnapshotInfo>> {
        let entries = match state {
            Some(state) => {
                if !self.state_exists(state)? {
                    return Err(Error::StateNotFound(state.clone()));
                }
                self.backend.snapshots(&self.dataset_path(state), false)?
            }
            None => self.backend.snapshots(&self.base_dataset, true)?,
        };
        Ok(entries
            .into_iter()
            .filter_map(|entry| self.snapshot_info(entry))
            .collect())
    }

    /// Find a snapshot by name across all states.
    ///
    /// When several states carry a snapshot with this name, the oldest one is
    /// returned and the ambiguity is logged.
    pub fn find_snapshot(&self, snapshot: &Snapshot) -> Result<Option<SnapshotInfo>> {
        let matches: Vec<SnapshotInfo> = self
            .list_snapshots(None)?
            .into_iter()
            .filter(|s| s.snapshot == *snapshot)
            .collect();

        if matches.len() > 1 {
            let candidates: Vec<&str> = matches.iter().map(|s| s.full_name.as_str()).collect();
            warn!(snapshot = %snapshot, ?candidates, "snapshot name is ambiguous, using oldest");
        }
        Ok(matches
            .into_iter()
            .min_by(|a, b| a.creation.cmp(&b.creation).then_with(|| a.full_name.cmp(&b.full_name))))
    }

    /// States whose origin is a snapshot of `dataset`
    fn clones_of(&self, dataset: &str) -> Result<Vec<(State, String)>> {
        let prefix = format!("{}@", dataset);
        let mut clones = Vec::new();
        for info in self.list_states()? {
            if let Some(origin) = self.backend.origin(&info.zfs_dataset)? {
                if origin.starts_with(&prefix) {
                    clones.push((info.state, origin));
                }
            }
        }
        Ok(clones)
    }

    /// States left behind by a clone or restore that failed after the clone
    /// step, i.e. still carrying the pending marker
    pub fn pending_clones(&self) -> Result<Vec<State>> {
        let mut pending = Vec::new();
        for info in self.list_states()? {
            if self.backend.property(&info.zfs_dataset, PENDING_PROPERTY)?.is_some() {
                pending.push(info.state);
            }
        }
        Ok(pending)
    }

    /// Finish an interrupted clone or restore: promote if the state still
    /// depends on its origin, fix ownership, then drop the pending marker
    #[instrument(skip(self))]
    pub fn complete_clone(&self, state: &State) -> Result<()> {
        let dataset = self.dataset_path(state);
        if self.backend.origin(&dataset)?.is_some() {
            self.backend.promote(&dataset)?;
        }
        ownership::apply(&self.state_dir(state), self.ownership.as_ref())?;
        self.backend.clear_property(&dataset, PENDING_PROPERTY)?;
        info!(dataset = %dataset, "pending clone completed");
        Ok(())
    }
}

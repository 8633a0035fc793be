//! Orchestration of states, assignments, slot links and VM units
//!
//! Mutations run in a fixed order: validate the slot, change datasets, record
//! the assignment, then re-point the slot link. A failure stops the sequence,
//! so the old data stays addressable and no assignment is recorded for data
//! that was never created. [`VmStateManager::reconcile`] repairs what a crash
//! between the later steps can leave behind.
//!
//! There is no internal locking beyond the assignment record's file lock;
//! callers serialize access.

use crate::assignments::AssignmentStore;
use crate::backend::{DatasetBackend, ZfsCliBackend};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::indirection::SlotLinks;
use crate::store::StateStore;
use crate::types::{
    Slot, SlotAssignment, SlotSet, Snapshot, SnapshotInfo, State, StateInfo, VmInfo, VmStatus,
};
use crate::vm::{Systemctl, UnitControl, VmController};
use std::thread;
use tracing::{info, instrument, warn};

/// What a [`VmStateManager::reconcile`] pass changed or could not fix
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Slots whose link was missing or pointed at another state
    pub relinked: Vec<Slot>,
    /// Slots whose assigned state does not exist, left untouched
    pub missing_states: Vec<(Slot, State)>,
    /// Unfinished clones that were promoted and unmarked
    pub completed_clones: Vec<State>,
    /// Repairs that failed, with the error message
    pub failed: Vec<(String, String)>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.relinked.is_empty()
            && self.missing_states.is_empty()
            && self.completed_clones.is_empty()
            && self.failed.is_empty()
    }
}

/// The host-side view of slots and states
pub struct VmStateManager<B, U> {
    config: Config,
    slots: SlotSet,
    assignments: AssignmentStore,
    store: StateStore<B>,
    links: SlotLinks,
    vms: VmController<U>,
}

impl VmStateManager<ZfsCliBackend, Systemctl> {
    /// Manager driving the `zfs` and `systemctl` tools named in `config`
    pub fn system(config: Config) -> Result<Self> {
        let backend = ZfsCliBackend::new(config.zfs_binary.clone());
        let units = Systemctl::new(config.systemctl_binary.clone());
        Self::new(config, backend, units)
    }
}

impl<B: DatasetBackend, U: UnitControl> VmStateManager<B, U> {
    pub fn new(config: Config, backend: B, units: U) -> Result<Self> {
        config.validate()?;
        let slots = config.slot_set()?;
        let assignments = AssignmentStore::new(&config.assignments_file, slots.clone());
        let store = StateStore::new(backend, &config, assignments.clone());
        let links = SlotLinks::new(
            &config.microvms_dir,
            config.backing_file.clone(),
            config.ownership.clone(),
        );
        let vms = VmController::new(units, slots.clone(), config.unit_prefix.clone());
        Ok(Self {
            config,
            slots,
            assignments,
            store,
            links,
            vms,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &StateStore<B> {
        &self.store
    }

    pub fn links(&self) -> &SlotLinks {
        &self.links
    }

    pub fn vms(&self) -> &VmController<U> {
        &self.vms
    }

    pub fn assignments(&self) -> &AssignmentStore {
        &self.assignments
    }

    // === Assignment ===

    pub fn get_slot_state(&self, slot: &Slot) -> Result<State> {
        self.assignments.get_slot_state(slot)
    }

    pub fn list_assignments(&self) -> Result<Vec<SlotAssignment>> {
        self.assignments.list_assignments()
    }

    pub fn is_state_in_use(&self, state: &State) -> Result<Option<Slot>> {
        self.assignments.is_state_in_use(state)
    }

    /// Assign a state to a slot, creating the state if needed. A running VM
    /// keeps its open disk until it is restarted.
    #[instrument(skip(self))]
    pub fn assign_state(&self, slot: &Slot, state: &State) -> Result<()> {
        self.slots.check(slot)?;

        if !self.store.state_exists(state)? {
            info!("state does not exist yet, creating it");
            self.store.create_state(state)?;
        }

        self.assignments.set_slot_state(slot, state)?;
        self.links
            .point(slot, &self.store.state_backing_file(state))?;

        info!("state assigned");
        Ok(())
    }

    /// Stop the slot if it runs, assign `state`, start the slot
    #[instrument(skip(self))]
    pub fn migrate(&self, state: &State, slot: &Slot) -> Result<()> {
        self.slots.check(slot)?;

        if self.vms.is_running(slot)? {
            self.vms.stop(slot)?;
            self.wait_until_stopped(slot)?;
        }

        self.assign_state(slot, state)?;
        self.vms.start(slot)
    }

    fn wait_until_stopped(&self, slot: &Slot) -> Result<()> {
        for _ in 0..self.config.stop_poll_attempts {
            if !self.vms.is_running(slot)? {
                return Ok(());
            }
            thread::sleep(self.config.stop_poll_interval());
        }
        if self.vms.is_running(slot)? {
            return Err(Error::Systemd(format!(
                "{} still running after {} status polls",
                slot, self.config.stop_poll_attempts
            )));
        }
        Ok(())
    }

    // === States ===

    pub fn create_state(&self, state: &State) -> Result<()> {
        self.store.create_state(state)
    }

    pub fn delete_state(&self, state: &State, force: bool) -> Result<()> {
        self.store.delete_state(state, force)
    }

    pub fn clone_state(&self, source: &State, destination: &State) -> Result<()> {
        self.store.clone_state(source, destination)
    }

    pub fn state_exists(&self, state: &State) -> Result<bool> {
        self.store.state_exists(state)
    }

    pub fn get_state_info(&self, state: &State) -> Result<StateInfo> {
        self.store.get_state_info(state)
    }

    pub fn list_states(&self) -> Result<Vec<StateInfo>> {
        self.store.list_states()
    }

    // === Snapshots ===

    pub fn create_snapshot(&self, state: &State, snapshot: &Snapshot) -> Result<()> {
        self.store.create_snapshot(state, snapshot)
    }

    /// Snapshot whichever state is assigned to `slot`
    pub fn snapshot_slot(&self, slot: &Slot, snapshot: &Snapshot) -> Result<State> {
        let state = self.get_slot_state(slot)?;
        if self.vms.is_running(slot)? {
            warn!(slot = %slot, "slot is running, snapshot will be crash-consistent");
        }
        self.store.create_snapshot(&state, snapshot)?;
        Ok(state)
    }

    pub fn delete_snapshot(&self, state: &State, snapshot: &Snapshot) -> Result<()> {
        self.store.delete_snapshot(state, snapshot)
    }

    pub fn restore_snapshot(&self, snapshot: &Snapshot, new_state: &State) -> Result<()> {
        self.store.restore_snapshot(snapshot, new_state)
    }

    pub fn list_snapshots(&self, state: Option<&State>) -> Result<Vec<SnapshotInfo>> {
        self.store.list_snapshots(state)
    }

    pub fn find_snapshot(&self, snapshot: &Snapshot) -> Result<Option<SnapshotInfo>> {
        self.store.find_snapshot(snapshot)
    }

    // === Slot control ===

    pub fn start(&self, slot: &Slot) -> Result<()> {
        self.vms.start(slot)
    }

    pub fn stop(&self, slot: &Slot) -> Result<()> {
        self.vms.stop(slot)
    }

    pub fn restart(&self, slot: &Slot) -> Result<()> {
        self.vms.restart(slot)
    }

    pub fn get_status(&self, slot: &Slot) -> Result<VmStatus> {
        self.vms.get_status(slot)
    }

    pub fn is_running(&self, slot: &Slot) -> Result<bool> {
        self.vms.is_running(slot)
    }

    /// Status, assigned state and address of one slot
    pub fn get_info(&self, slot: &Slot) -> Result<VmInfo> {
        let state = self.get_slot_state(slot)?;
        self.vms.get_info(slot, state)
    }

    /// [`Self::get_info`] for every configured slot
    pub fn list_slots(&self) -> Result<Vec<VmInfo>> {
        self.slots.iter().map(|slot| self.get_info(slot)).collect()
    }

    // === Repair ===

    /// Re-point stale slot links and finish clones left pending by failed
    /// clone or restore operations.
    #[instrument(skip(self))]
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for assignment in self.assignments.list_assignments()? {
            let SlotAssignment { slot, state } = assignment;
            let expected = self.store.state_backing_file(&state);
            if self.links.target(&slot)?.as_deref() == Some(expected.as_path()) {
                continue;
            }
            if !self.store.state_exists(&state)? {
                warn!(slot = %slot, state = %state, "assigned state does not exist");
                report.missing_states.push((slot, state));
                continue;
            }
            match self.links.point(&slot, &expected) {
                Ok(()) => {
                    info!(slot = %slot, state = %state, "slot relinked");
                    report.relinked.push(slot);
                }
                Err(e) => report.failed.push((slot.to_string(), e.to_string())),
            }
        }

        for state in self.store.pending_clones()? {
            warn!(state = %state, "found unfinished clone, completing");
            match self.store.complete_clone(&state) {
                Ok(()) => report.completed_clones.push(state),
                Err(e) => report.failed.push((state.to_string(), e.to_string())),
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FailOn, MemoryBackend};
    use crate::error::ErrorKind;
    use crate::vm::FakeUnits;
    use std::fs;
    use tempfile::TempDir;

    fn manager() -> (TempDir, VmStateManager<MemoryBackend, FakeUnits>) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::rooted_at(dir.path());
        let manager = VmStateManager::new(config, MemoryBackend::new(), FakeUnits::new()).unwrap();
        (dir, manager)
    }

    fn slot(name: &str) -> Slot {
        Slot::new(name).unwrap()
    }

    fn state(name: &str) -> State {
        State::new(name).unwrap()
    }

    #[test]
    fn assign_creates_state_and_links_slot() {
        let (_dir, m) = manager();
        let s1 = slot("slot1");
        let alpha = state("alpha");

        m.assign_state(&s1, &alpha).unwrap();

        assert!(m.state_exists(&alpha).unwrap());
        assert_eq!(m.get_slot_state(&s1).unwrap(), alpha);
        assert_eq!(
            m.links().target(&s1).unwrap(),
            Some(m.store().state_backing_file(&alpha))
        );
    }

    #[test]
    fn assign_to_unknown_slot_changes_nothing() {
        let (_dir, m) = manager();
        let err = m.assign_state(&slot("slot9"), &state("alpha")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSlot);
        assert!(!m.state_exists(&state("alpha")).unwrap());
    }

    #[test]
    fn failed_state_creation_leaves_assignment_untouched() {
        let (_dir, m) = manager();
        let s1 = slot("slot1");
        m.store().backend().fail_on(FailOn::Create);

        assert!(m.assign_state(&s1, &state("alpha")).is_err());
        assert_eq!(m.get_slot_state(&s1).unwrap(), state("slot1"));
        assert_eq!(m.links().target(&s1).unwrap(), None);
        assert!(!m.assignments().path().exists());
    }

    #[test]
    fn migrate_stops_assigns_and_starts() {
        let (_dir, m) = manager();
        let s2 = slot("slot2");
        m.start(&s2).unwrap();

        m.migrate(&state("beta"), &s2).unwrap();

        assert_eq!(m.get_slot_state(&s2).unwrap(), state("beta"));
        assert_eq!(m.get_status(&s2).unwrap(), VmStatus::Running);
        let verbs: Vec<&str> = m
            .vms()
            .units()
            .calls()
            .into_iter()
            .filter(|c| c.verb != "status")
            .map(|c| c.verb)
            .collect();
        assert_eq!(verbs, vec!["start", "stop", "start"]);
    }

    #[test]
    fn snapshot_slot_uses_assigned_state() {
        let (_dir, m) = manager();
        let s1 = slot("slot1");
        m.assign_state(&s1, &state("alpha")).unwrap();
        let snapped = m.snapshot_slot(&s1, &Snapshot::new("nightly").unwrap()).unwrap();
        assert_eq!(snapped, state("alpha"));
        assert_eq!(m.list_snapshots(Some(&snapped)).unwrap().len(), 1);
    }

    #[test]
    fn info_combines_assignment_and_status() {
        let (_dir, m) = manager();
        let s3 = slot("slot3");
        m.assign_state(&s3, &state("gamma")).unwrap();
        m.start(&s3).unwrap();

        let info = m.get_info(&s3).unwrap();
        assert_eq!(info.assigned_state, state("gamma"));
        assert_eq!(info.status, VmStatus::Running);
        assert_eq!(info.ip, "10.3.0.2");
        assert_eq!(m.list_slots().unwrap().len(), 5);
    }

    #[test]
    fn reconcile_relinks_after_interrupted_assign() {
        let (_dir, m) = manager();
        let s1 = slot("slot1");
        let alpha = state("alpha");
        m.create_state(&alpha).unwrap();
        // record written, link never swapped
        m.assignments().set_slot_state(&s1, &alpha).unwrap();

        let report = m.reconcile().unwrap();
        assert_eq!(report.relinked, vec![s1.clone()]);
        assert_eq!(
            m.links().target(&s1).unwrap(),
            Some(m.store().state_backing_file(&alpha))
        );
        // remaining slots default to states that were never created
        assert_eq!(report.missing_states.len(), 4);

        let again = m.reconcile().unwrap();
        assert!(again.relinked.is_empty());
    }

    #[test]
    fn reconcile_promotes_orphaned_clone() {
        let (_dir, m) = manager();
        let alpha = state("alpha");
        let beta = state("beta");
        m.create_state(&alpha).unwrap();
        fs::write(m.store().state_backing_file(&alpha), b"disk").unwrap();
        m.store().backend().fail_on(FailOn::Promote);
        assert_eq!(
            m.clone_state(&alpha, &beta).unwrap_err().kind(),
            ErrorKind::PartialFailure
        );

        let report = m.reconcile().unwrap();
        assert_eq!(report.completed_clones, vec![beta.clone()]);
        assert!(report.failed.is_empty());

        m.delete_state(&alpha, true).unwrap();
        assert_eq!(fs::read(m.store().state_backing_file(&beta)).unwrap(), b"disk");
    }

    #[test]
    fn reconcile_leaves_finished_clones_alone() {
        let (_dir, m) = manager();
        let golden = state("golden");
        let experiment = state("experiment");
        m.create_state(&golden).unwrap();
        m.clone_state(&golden, &experiment).unwrap();
        let backend = m.store().backend();
        let golden_origin = backend.origin(&m.store().dataset_path(&golden)).unwrap();

        for _ in 0..2 {
            let report = m.reconcile().unwrap();
            assert!(report.completed_clones.is_empty());
            assert!(report.failed.is_empty());
        }
        assert_eq!(backend.origin(&m.store().dataset_path(&experiment)).unwrap(), None);
        assert_eq!(backend.origin(&m.store().dataset_path(&golden)).unwrap(), golden_origin);

        m.delete_state(&golden, false).unwrap();
        assert!(m.state_exists(&experiment).unwrap());
    }

    #[test]
    fn reconcile_clears_marker_when_only_cleanup_failed() {
        let (_dir, m) = manager();
        let alpha = state("alpha");
        let beta = state("beta");
        m.create_state(&alpha).unwrap();
        m.store().backend().fail_on(FailOn::ClearProperty);
        let err = m.clone_state(&alpha, &beta).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PartialFailure);

        let report = m.reconcile().unwrap();
        assert_eq!(report.completed_clones, vec![beta.clone()]);
        assert_eq!(m.store().backend().origin(&m.store().dataset_path(&beta)).unwrap(), None);
        assert!(m.store().pending_clones().unwrap().is_empty());
    }
}

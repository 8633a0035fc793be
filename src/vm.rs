//! VM lifecycle control through the init system
//!
//! Each slot runs as one unit (`microvm@<slot>.service`). The controller only
//! asks the init system to start, stop or restart that unit and reads back its
//! `ActiveState`; the init system stays the source of truth. Requests return
//! once the job is queued, so callers poll [`VmController::get_status`] to see
//! the transition finish.

use crate::error::{Error, Result};
use crate::types::{Slot, SlotSet, State, VmInfo, VmStatus};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, info, instrument};

/// The four init-system calls the controller needs
pub trait UnitControl {
    /// Queue a start job, replacing any conflicting queued job
    fn start_unit(&self, unit: &str) -> Result<()>;

    /// Queue a stop job, replacing any conflicting queued job
    fn stop_unit(&self, unit: &str) -> Result<()>;

    /// Queue a restart job, replacing any conflicting queued job
    fn restart_unit(&self, unit: &str) -> Result<()>;

    /// The unit's `ActiveState`, loading the unit first if needed
    fn active_state(&self, unit: &str) -> Result<String>;
}

/// Talks to systemd through `systemctl`
#[derive(Debug, Clone)]
pub struct Systemctl {
    binary: PathBuf,
}

impl Systemctl {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        debug!(args = ?args, "running systemctl");
        let output = Command::new(&self.binary).args(args).output()?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(Error::CommandFailed {
                command: format!("{} {}", self.binary.display(), args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn queue(&self, verb: &str, unit: &str) -> Result<()> {
        self.run(&["--no-block", "--job-mode=replace", verb, unit])?;
        Ok(())
    }
}

impl Default for Systemctl {
    fn default() -> Self {
        Self::new("systemctl")
    }
}

impl UnitControl for Systemctl {
    fn start_unit(&self, unit: &str) -> Result<()> {
        self.queue("start", unit)
    }

    fn stop_unit(&self, unit: &str) -> Result<()> {
        self.queue("stop", unit)
    }

    fn restart_unit(&self, unit: &str) -> Result<()> {
        self.queue("restart", unit)
    }

    fn active_state(&self, unit: &str) -> Result<String> {
        // `show` loads the unit on demand when it is known but not loaded
        let output = self.run(&["show", "--property=LoadState,ActiveState", unit])?;
        parse_unit_properties(unit, &output)
    }
}

/// Extract `ActiveState` from `systemctl show` output; a unit systemd cannot
/// find is a lookup failure.
pub(crate) fn parse_unit_properties(unit: &str, output: &str) -> Result<String> {
    let mut load_state = None;
    let mut active_state = None;
    for line in output.lines() {
        match line.split_once('=') {
            Some(("LoadState", value)) => load_state = Some(value.trim()),
            Some(("ActiveState", value)) => active_state = Some(value.trim()),
            _ => {}
        }
    }
    if matches!(load_state, Some("not-found") | Some("error") | Some("bad-setting")) {
        return Err(Error::Systemd(format!(
            "unit {} could not be loaded ({})",
            unit,
            load_state.unwrap_or_default()
        )));
    }
    active_state
        .map(str::to_string)
        .ok_or_else(|| Error::Systemd(format!("no ActiveState reported for {}", unit)))
}

/// A unit-control call recorded by [`FakeUnits`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitCall {
    pub verb: &'static str,
    pub unit: String,
}

#[derive(Debug, Default)]
struct FakeInner {
    active: HashMap<String, String>,
    instances: HashMap<String, u32>,
    calls: Vec<UnitCall>,
    fail_next: bool,
}

/// In-memory init system: jobs complete immediately, units start out
/// not loaded.
#[derive(Debug, Default)]
pub struct FakeUnits {
    inner: RefCell<FakeInner>,
}

impl FakeUnits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<UnitCall> {
        self.inner.borrow().calls.clone()
    }

    /// Force a unit into an `ActiveState`, e.g. `failed`
    pub fn set_active_state(&self, unit: &str, state: &str) {
        self.inner
            .borrow_mut()
            .active
            .insert(unit.to_string(), state.to_string());
    }

    /// How many times the unit has been (re)started
    pub fn instances(&self, unit: &str) -> u32 {
        self.inner.borrow().instances.get(unit).copied().unwrap_or(0)
    }

    /// Make the next start/stop/restart call fail
    pub fn fail_next(&self) {
        self.inner.borrow_mut().fail_next = true;
    }

    fn job(&self, verb: &'static str, unit: &str, next: &str) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.calls.push(UnitCall {
            verb,
            unit: unit.to_string(),
        });
        if std::mem::take(&mut inner.fail_next) {
            return Err(Error::Systemd(format!("job {} for {} failed", verb, unit)));
        }
        if next == "active" {
            *inner.instances.entry(unit.to_string()).or_default() += 1;
        }
        inner.active.insert(unit.to_string(), next.to_string());
        Ok(())
    }
}

impl UnitControl for FakeUnits {
    fn start_unit(&self, unit: &str) -> Result<()> {
        self.job("start", unit, "active")
    }

    fn stop_unit(&self, unit: &str) -> Result<()> {
        self.job("stop", unit, "inactive")
    }

    fn restart_unit(&self, unit: &str) -> Result<()> {
        self.job("restart", unit, "active")
    }

    fn active_state(&self, unit: &str) -> Result<String> {
        let mut inner = self.inner.borrow_mut();
        inner.calls.push(UnitCall {
            verb: "status",
            unit: unit.to_string(),
        });
        inner
            .active
            .get(unit)
            .cloned()
            .ok_or_else(|| Error::Systemd(format!("unit {} not loaded", unit)))
    }
}

/// Starts, stops and inspects the VM unit of each slot
pub struct VmController<U> {
    units: U,
    slots: SlotSet,
    unit_prefix: String,
}

impl<U: UnitControl> VmController<U> {
    pub fn new(units: U, slots: SlotSet, unit_prefix: impl Into<String>) -> Self {
        Self {
            units,
            slots,
            unit_prefix: unit_prefix.into(),
        }
    }

    pub fn units(&self) -> &U {
        &self.units
    }

    /// Unit name for a slot in the configured set
    pub fn unit_name(&self, slot: &Slot) -> Result<String> {
        self.slots.check(slot)?;
        Ok(slot.unit_name(&self.unit_prefix))
    }

    #[instrument(skip(self))]
    pub fn start(&self, slot: &Slot) -> Result<()> {
        let unit = self.unit_name(slot)?;
        self.units.start_unit(&unit)?;
        info!(unit = %unit, "start queued");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn stop(&self, slot: &Slot) -> Result<()> {
        let unit = self.unit_name(slot)?;
        self.units.stop_unit(&unit)?;
        info!(unit = %unit, "stop queued");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn restart(&self, slot: &Slot) -> Result<()> {
        let unit = self.unit_name(slot)?;
        self.units.restart_unit(&unit)?;
        info!(unit = %unit, "restart queued");
        Ok(())
    }

    /// Status of a slot's unit; lookup failures read as `Unknown`
    pub fn get_status(&self, slot: &Slot) -> Result<VmStatus> {
        let unit = self.unit_name(slot)?;
        match self.units.active_state(&unit) {
            Ok(active_state) => Ok(VmStatus::from_active_state(&active_state)),
            Err(e) => {
                debug!(unit = %unit, error = %e, "unit status lookup failed");
                Ok(VmStatus::Unknown)
            }
        }
    }

    pub fn is_running(&self, slot: &Slot) -> Result<bool> {
        Ok(self.get_status(slot)? == VmStatus::Running)
    }

    pub fn get_info(&self, slot: &Slot, assigned_state: State) -> Result<VmInfo> {
        Ok(VmInfo {
            slot: slot.clone(),
            status: self.get_status(slot)?,
            assigned_state,
            ip: slot.ip(),
        })
    }

    pub fn list_slots(&self) -> &[Slot] {
        self.slots.as_slice()
    }

    pub fn is_valid_slot(&self, name: &str) -> bool {
        self.slots.resolve(name).is_ok()
    }
}

//! Host layout and tool configuration

use crate::error::{Error, Result};
use crate::types::SlotSet;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the optional configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vm-state.json";

/// Owner and mode applied to state mount directories and slot directories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub user: String,
    pub group: String,
    pub mode: u32,
}

impl Default for Ownership {
    fn default() -> Self {
        Self {
            user: "microvm".to_string(),
            group: "kvm".to_string(),
            mode: 0o755,
        }
    }
}

/// Configuration for vm-state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path to the states directory (e.g., /var/lib/microvms/states)
    pub states_dir: PathBuf,
    /// Path to the microvms directory holding one subdirectory per slot
    pub microvms_dir: PathBuf,
    /// Path to the assignments file (e.g., /etc/vm-state-assignments.json)
    pub assignments_file: PathBuf,
    /// ZFS pool name (e.g., microvms)
    pub zfs_pool: String,
    /// ZFS dataset path under the pool (e.g., storage/states)
    pub zfs_dataset: String,
    /// Backing disk file inside each state and slot directory
    pub backing_file: String,
    /// Slots deployed on this host
    pub slots: Vec<String>,
    /// Unit name prefix; `microvm@` gives `microvm@slot1.service`
    pub unit_prefix: String,
    /// `None` leaves ownership and mode untouched
    pub ownership: Option<Ownership>,
    pub zfs_binary: PathBuf,
    pub systemctl_binary: PathBuf,
    /// Delay between status polls while waiting for a slot to stop
    pub stop_poll_interval_ms: u64,
    pub stop_poll_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            states_dir: PathBuf::from("/var/lib/microvms/states"),
            microvms_dir: PathBuf::from("/var/lib/microvms"),
            assignments_file: PathBuf::from("/etc/vm-state-assignments.json"),
            zfs_pool: "microvms".to_string(),
            zfs_dataset: "storage/states".to_string(),
            backing_file: "data.img".to_string(),
            slots: (1..=5).map(|n| format!("slot{n}")).collect(),
            unit_prefix: "microvm@".to_string(),
            ownership: Some(Ownership::default()),
            zfs_binary: PathBuf::from("zfs"),
            systemctl_binary: PathBuf::from("systemctl"),
            stop_poll_interval_ms: 500,
            stop_poll_attempts: 20,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file; missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else [`DEFAULT_CONFIG_PATH`] if it exists, else defaults.
    pub fn discover(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let slots = self.slot_set()?;
        if slots.as_slice().is_empty() {
            return Err(Error::Config("at least one slot must be configured".into()));
        }
        if self.backing_file.is_empty() || self.backing_file.contains('/') {
            return Err(Error::Config(format!(
                "backing_file must be a plain file name, got '{}'",
                self.backing_file
            )));
        }
        if self.zfs_pool.is_empty() || self.zfs_dataset.is_empty() {
            return Err(Error::Config("zfs_pool and zfs_dataset must be set".into()));
        }
        Ok(())
    }

    pub fn slot_set(&self) -> Result<SlotSet> {
        SlotSet::from_names(&self.slots).map_err(|e| Error::Config(e.to_string()))
    }

    /// Parent dataset of every state, e.g. `microvms/storage/states`
    pub fn base_dataset(&self) -> String {
        format!("{}/{}", self.zfs_pool, self.zfs_dataset)
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }

    /// Configuration rooted in a scratch directory, without ownership changes.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            states_dir: root.join("states"),
            microvms_dir: root.join("microvms"),
            assignments_file: root.join("vm-state-assignments.json"),
            ownership: None,
            stop_poll_interval_ms: 0,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn defaults_match_deployed_layout() {
        let config = Config::default();
        assert_eq!(config.base_dataset(), "microvms/storage/states");
        assert_eq!(config.slot_set().unwrap().as_slice().len(), 5);
        assert_eq!(config.ownership.as_ref().unwrap().mode, 0o755);
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm-state.json");
        fs::write(&path, r#"{"slots": ["slot1", "slot2"], "ownership": null}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.slots, vec!["slot1", "slot2"]);
        assert!(config.ownership.is_none());
        assert_eq!(config.zfs_pool, "microvms");
    }

    #[test]
    fn bad_slot_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm-state.json");
        fs::write(&path, r#"{"slots": ["vm7"]}"#).unwrap();
        assert_eq!(Config::load(&path).unwrap_err().kind(), ErrorKind::Config);
    }

    #[test]
    fn unknown_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm-state.json");
        fs::write(&path, r#"{"zfs_pol": "tank"}"#).unwrap();
        assert!(Config::load(&path).is_err());
    }
}

//! Per-slot backing file symlinks
//!
//! Each slot directory holds `<backing_file>` as a symlink to the backing file
//! inside the assigned state's mount directory. The VM unit only ever opens the
//! slot path.

use crate::config::Ownership;
use crate::error::{Error, Result};
use crate::ownership;
use crate::types::Slot;
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SlotLinks {
    microvms_dir: PathBuf,
    backing_file: String,
    ownership: Option<Ownership>,
}

impl SlotLinks {
    pub fn new(
        microvms_dir: impl Into<PathBuf>,
        backing_file: impl Into<String>,
        ownership: Option<Ownership>,
    ) -> Self {
        Self {
            microvms_dir: microvms_dir.into(),
            backing_file: backing_file.into(),
            ownership,
        }
    }

    /// Get the slot directory path
    pub fn slot_dir(&self, slot: &Slot) -> PathBuf {
        self.microvms_dir.join(slot.as_str())
    }

    /// Get the backing file path the slot's VM opens
    pub fn slot_backing_file(&self, slot: &Slot) -> PathBuf {
        self.slot_dir(slot).join(&self.backing_file)
    }

    /// Where the first regular file found at the slot path is moved aside to
    pub fn backup_path(&self, slot: &Slot) -> PathBuf {
        self.slot_dir(slot).join(format!("{}.backup", self.backing_file))
    }

    /// First backup name not yet taken: `<file>.backup`, `<file>.backup.1`, ...
    fn free_backup_path(&self, slot: &Slot) -> Result<PathBuf> {
        let base = self.backup_path(slot);
        let mut candidate = base.clone();
        let mut n = 0u32;
        loop {
            match fs::symlink_metadata(&candidate) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(candidate),
                Err(e) => return Err(e.into()),
                Ok(_) => {
                    n += 1;
                    candidate = PathBuf::from(format!("{}.{}", base.display(), n));
                }
            }
        }
    }

    /// Current symlink target, `None` if the slot path is absent or not a symlink
    pub fn target(&self, slot: &Slot) -> Result<Option<PathBuf>> {
        let path = self.slot_backing_file(slot);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_symlink() => Ok(Some(fs::read_link(&path)?)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Point the slot's backing file at `state_backing_file`.
    ///
    /// The new link is built under a temporary name and renamed over the slot
    /// path, so the slot path never goes missing while a previous link exists.
    pub fn point(&self, slot: &Slot, state_backing_file: &Path) -> Result<()> {
        let slot_dir = self.slot_dir(slot);
        let slot_file = self.slot_backing_file(slot);

        // Ensure slot directory exists
        fs::create_dir_all(&slot_dir)?;

        let staged = slot_dir.join(format!(
            ".{}.{}",
            self.backing_file,
            Uuid::new_v4().simple()
        ));
        symlink(state_backing_file, &staged)?;

        if let Err(e) = self.swap_in(slot, &staged, &slot_file) {
            if let Err(cleanup) = fs::remove_file(&staged) {
                warn!(path = %staged.display(), error = %cleanup, "could not remove staged link");
            }
            return Err(e);
        }

        ownership::apply(&slot_dir, self.ownership.as_ref())?;

        debug!(
            slot = %slot,
            link = %slot_file.display(),
            target = %state_backing_file.display(),
            "slot backing file linked"
        );
        Ok(())
    }

    fn swap_in(&self, slot: &Slot, staged: &Path, slot_file: &Path) -> Result<()> {
        // Handle existing backing file without following symlinks
        match fs::symlink_metadata(slot_file) {
            Ok(meta) if meta.is_file() => {
                let backup = self.free_backup_path(slot)?;
                warn!(
                    slot = %slot,
                    backup = %backup.display(),
                    "moving regular backing file aside"
                );
                fs::rename(slot_file, &backup)?;
            }
            Ok(meta) if meta.is_dir() => {
                return Err(Error::Other(format!(
                    "{} is a directory, refusing to replace it",
                    slot_file.display()
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        fs::rename(staged, slot_file)?;
        Ok(())
    }
}

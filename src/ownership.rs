//! Ownership and mode for directories the VM process reads

use crate::config::Ownership;
use crate::error::{Error, Result};
use nix::unistd::{chown, Group, User};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::debug;

/// Set ownership to the VM runtime user and group, then apply the mode.
/// `None` leaves the path untouched.
pub fn apply(path: &Path, ownership: Option<&Ownership>) -> Result<()> {
    let Some(ownership) = ownership else {
        return Ok(());
    };
    let fail = |reason: String| Error::Ownership {
        path: path.display().to_string(),
        reason,
    };

    let user = User::from_name(&ownership.user)?
        .ok_or_else(|| fail(format!("unknown user '{}'", ownership.user)))?;
    let group = Group::from_name(&ownership.group)?
        .ok_or_else(|| fail(format!("unknown group '{}'", ownership.group)))?;

    chown(path, Some(user.uid), Some(group.gid)).map_err(|e| fail(e.to_string()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(ownership.mode))
        .map_err(|e| fail(e.to_string()))?;

    debug!(
        path = %path.display(),
        user = %ownership.user,
        group = %ownership.group,
        "ownership set"
    );
    Ok(())
}

/// Fail unless running as root
pub fn require_root() -> Result<()> {
    if nix::unistd::geteuid().is_root() {
        Ok(())
    } else {
        Err(Error::PermissionDenied)
    }
}

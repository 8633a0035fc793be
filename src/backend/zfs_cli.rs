//! ZFS backend that drives the `zfs` command-line tool

use super::{DatasetBackend, DatasetEntry, SnapshotEntry};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

/// Runs `zfs` and parses its scripted (`-H -p`) tabular output.
#[derive(Debug, Clone)]
pub struct ZfsCliBackend {
    binary: PathBuf,
}

impl ZfsCliBackend {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run zfs and return stdout
    fn run(&self, args: &[&str]) -> Result<String> {
        debug!(args = ?args, "running zfs command");
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
}

impl Default for ZfsCliBackend {
    fn default() -> Self {
        Self::new("zfs")
    }
}

impl DatasetBackend for ZfsCliBackend {
    fn exists(&self, dataset: &str) -> Result<bool> {
        match self.run(&["list", "-H", "-o", "name", "-t", "filesystem", dataset]) {
            Ok(_) => Ok(true),
            Err(Error::CommandFailed { ref stderr, .. }) if is_missing_dataset(stderr) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn create(&self, dataset: &str, mountpoint: &Path) -> Result<()> {
        let mountpoint = format!("mountpoint={}", mountpoint.display());
        self.run(&["create", "-o", &mountpoint, dataset])?;
        Ok(())
    }

    fn destroy(&self, name: &str, recursive: bool) -> Result<()> {
        if recursive {
            self.run(&["destroy", "-r", name])?;
        } else {
            self.run(&["destroy", name])?;
        }
        Ok(())
    }

    fn snapshot(&self, snapshot: &str) -> Result<()> {
        self.run(&["snapshot", snapshot])?;
        Ok(())
    }

    fn clone_snapshot(
        &self,
        snapshot: &str,
        dataset: &str,
        mountpoint: &Path,
        properties: &[(&str, &str)],
    ) -> Result<()> {
        let mut options = vec![format!("mountpoint={}", mountpoint.display())];
        options.extend(properties.iter().map(|(k, v)| format!("{}={}", k, v)));

        let mut args = vec!["clone"];
        for option in &options {
            args.extend(["-o", option.as_str()]);
        }
        args.extend([snapshot, dataset]);
        self.run(&args)?;
        Ok(())
    }

    fn promote(&self, dataset: &str) -> Result<()> {
        self.run(&["promote", dataset])?;
        Ok(())
    }

    fn origin(&self, dataset: &str) -> Result<Option<String>> {
        let output = self.run(&["get", "-H", "-p", "-o", "value", "origin", dataset])?;
        Ok(parse_property_value(&output))
    }

    fn property(&self, dataset: &str, name: &str) -> Result<Option<String>> {
        let output = self.run(&["get", "-H", "-p", "-s", "local", "-o", "value", name, dataset])?;
        Ok(parse_property_value(&output))
    }

    fn clear_property(&self, dataset: &str, name: &str) -> Result<()> {
        self.run(&["inherit", name, dataset])?;
        Ok(())
    }

    fn usage(&self, dataset: &str) -> Result<DatasetEntry> {
        let output = self.run(&["list", "-H", "-p", "-o", "name,used,avail", dataset])?;
        parse_dataset_list(&output)
            .into_iter()
            .next()
            .ok_or_else(|| Error::Backend(format!("no usage reported for {}", dataset)))
    }

    fn children(&self, parent: &str) -> Result<Vec<DatasetEntry>> {
        let output = self.run(&[
            "list", "-H", "-p", "-t", "filesystem", "-o", "name,used,avail", "-d", "1", parent,
        ])?;
        Ok(parse_dataset_list(&output)
            .into_iter()
            .filter(|entry| entry.name != parent)
            .collect())
    }

    fn snapshots(&self, dataset: &str, recursive: bool) -> Result<Vec<SnapshotEntry>> {
        let mut args = vec![
            "list", "-H", "-p", "-t", "snapshot", "-o", "name,creation,refer", "-s", "creation",
        ];
        if recursive {
            args.push("-r");
        } else {
            args.extend(["-d", "1"]);
        }
        args.push(dataset);
        let output = self.run(&args)?;
        Ok(parse_snapshot_list(&output))
    }
}

/// Parse `name<TAB>used<TAB>avail` lines
pub(crate) fn parse_dataset_list(output: &str) -> Vec<DatasetEntry> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() < 3 {
                warn!(line = %line, "skipping malformed zfs list line");
                return None;
            }
            Some(DatasetEntry {
                name: parts[0].to_string(),
                used_bytes: parse_size(parts[1]).unwrap_or(0),
                available_bytes: parse_size(parts[2]).unwrap_or(0),
            })
        })
        .collect()
}

/// Parse `dataset@snap<TAB>creation<TAB>refer` lines
pub(crate) fn parse_snapshot_list(output: &str) -> Vec<SnapshotEntry> {
    let mut snapshots = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 3 {
            warn!(line = %line, "skipping malformed snapshot line");
            continue;
        }
        if !parts[0].contains('@') {
            warn!(name = %parts[0], "snapshot name missing '@'");
            continue;
        }
        snapshots.push(SnapshotEntry {
            full_name: parts[0].to_string(),
            creation: parts[1].trim().parse::<u64>().unwrap_or(0),
            referenced_bytes: parse_size(parts[2]).unwrap_or(0),
        });
    }
    snapshots
}

/// zfs reports "dataset does not exist" for a name it cannot open; anything
/// else (permissions, missing pool, broken module) is a real failure
fn is_missing_dataset(stderr: &str) -> bool {
    stderr.contains("dataset does not exist")
}

/// Single `-o value` output; `-` or nothing means unset (or not a clone, for
/// `origin`)
pub(crate) fn parse_property_value(output: &str) -> Option<String> {
    match output.trim() {
        "" | "-" => None,
        origin => Some(origin.to_string()),
    }
}

/// Parse size strings like "1.5G", "500M", "10K", or exact byte counts
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    if s == "-" || s.is_empty() {
        return Some(0);
    }

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('T') {
        (n, 1024u64 * 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1024u64 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024u64 * 1024)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1024u64)
    } else if let Some(n) = s.strip_suffix('B') {
        (n, 1)
    } else {
        (s, 1)
    };

    if multiplier == 1 {
        if let Ok(exact) = num_str.parse::<u64>() {
            return Some(exact);
        }
    }
    num_str.parse::<f64>().ok().map(|n| (n * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_suffixes() {
        assert_eq!(parse_size("10K"), Some(10 * 1024));
        assert_eq!(parse_size("1.5G"), Some(1_610_612_736));
        assert_eq!(parse_size("2T"), Some(2 * 1024 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("96B"), Some(96));
        assert_eq!(parse_size("-"), Some(0));
        assert_eq!(parse_size("nope"), None);
    }

    #[test]
    fn parse_size_exact_bytes_are_not_rounded() {
        assert_eq!(parse_size("18446744073709551615"), Some(u64::MAX));
        assert_eq!(parse_size("1073741824"), Some(1_073_741_824));
    }

    #[test]
    fn parse_dataset_lines() {
        let output = "microvms/storage/states/alpha\t4096\t1073741824\n\
                      garbage line\n\
                      microvms/storage/states/beta\t8192\t1073741824\n";
        let entries = parse_dataset_list(output);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "microvms/storage/states/alpha");
        assert_eq!(entries[0].used_bytes, 4096);
        assert_eq!(entries[1].available_bytes, 1_073_741_824);
    }

    #[test]
    fn parse_snapshot_lines() {
        let output = "microvms/storage/states/alpha@before\t1700000000\t12345\n\
                      microvms/storage/states/alpha\t1700000001\t1\n\
                      \n\
                      microvms/storage/states/beta@nightly\t1700000100\t0\n";
        let snaps = parse_snapshot_list(output);
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].full_name, "microvms/storage/states/alpha@before");
        assert_eq!(snaps[0].creation, 1_700_000_000);
        assert_eq!(snaps[0].referenced_bytes, 12345);
        assert_eq!(snaps[1].full_name, "microvms/storage/states/beta@nightly");
    }

    #[test]
    fn parse_property_values() {
        assert_eq!(parse_property_value("-\n"), None);
        assert_eq!(parse_property_value(""), None);
        assert_eq!(
            parse_property_value("microvms/storage/states/a@clone-for-b\n").as_deref(),
            Some("microvms/storage/states/a@clone-for-b")
        );
    }

    #[test]
    fn missing_binary_is_io_error() {
        let backend = ZfsCliBackend::new("/nonexistent/zfs-binary");
        let err = backend.exists("pool/ds").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
    }

    /// Install a shell script standing in for `zfs`; it appends its arguments
    /// to `args.log` next to it before running `body`
    fn stub_zfs(dir: &Path, body: &str) -> ZfsCliBackend {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("zfs");
        let log = dir.join("args.log");
        let script = format!("#!/bin/sh\necho \"$@\" >> '{}'\n{}\n", log.display(), body);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        ZfsCliBackend::new(path)
    }

    fn logged_args(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("args.log"))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn missing_dataset_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = stub_zfs(
            dir.path(),
            "echo \"cannot open 'pool/states/alpha': dataset does not exist\" >&2\nexit 1",
        );
        assert!(!backend.exists("pool/states/alpha").unwrap());
    }

    #[test]
    fn exists_surfaces_other_failures() {
        let dir = tempfile::tempdir().unwrap();
        let backend = stub_zfs(
            dir.path(),
            "echo 'cannot open pool: permission denied' >&2\nexit 1",
        );
        match backend.exists("microvms/storage/states/alpha").unwrap_err() {
            Error::CommandFailed { stderr, .. } => {
                assert_eq!(stderr, "cannot open pool: permission denied")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn clone_passes_mountpoint_and_properties() {
        let dir = tempfile::tempdir().unwrap();
        let backend = stub_zfs(dir.path(), "exit 0");
        backend
            .clone_snapshot(
                "pool/states/a@s1",
                "pool/states/b",
                Path::new("/var/lib/states/b"),
                &[("vm-state:pending", "on")],
            )
            .unwrap();
        backend.clear_property("pool/states/b", "vm-state:pending").unwrap();
        assert_eq!(
            logged_args(dir.path()),
            vec![
                "clone -o mountpoint=/var/lib/states/b -o vm-state:pending=on \
                 pool/states/a@s1 pool/states/b",
                "inherit vm-state:pending pool/states/b",
            ]
        );
    }

    #[test]
    fn unset_local_property_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let backend = stub_zfs(dir.path(), "exit 0");
        assert_eq!(backend.property("pool/states/b", "vm-state:pending").unwrap(), None);
        assert_eq!(
            logged_args(dir.path()),
            vec!["get -H -p -s local -o value vm-state:pending pool/states/b"]
        );
    }
}

//! In-memory dataset backend
//!
//! Keeps the dataset tree, snapshot contents and clone origins in memory while
//! mounting every dataset as a real directory, so indirection symlinks and
//! backing files behave as on a host. Snapshots copy the files under the
//! mountpoint. Clone dependencies are tracked so destroying a snapshot that a
//! clone still depends on fails the way ZFS does, and promote hands the origin
//! snapshot over to the clone the same way `zfs promote` does.

use super::{DatasetBackend, DatasetEntry, SnapshotEntry};
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Operation whose next invocation fails, for exercising error paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOn {
    Create,
    Destroy,
    Snapshot,
    Clone,
    Promote,
    ClearProperty,
}

#[derive(Debug)]
struct MemDataset {
    mountpoint: PathBuf,
    origin: Option<String>,
    properties: BTreeMap<String, String>,
}

#[derive(Debug)]
struct MemSnapshot {
    creation: u64,
    files: BTreeMap<PathBuf, Vec<u8>>,
}

impl MemSnapshot {
    fn referenced(&self) -> u64 {
        self.files.values().map(|f| f.len() as u64).sum()
    }
}

#[derive(Debug, Default)]
struct Inner {
    datasets: BTreeMap<String, MemDataset>,
    snapshots: BTreeMap<String, MemSnapshot>,
    last_creation: u64,
    fail: Option<FailOn>,
}

/// Dataset backend holding its metadata in memory
#[derive(Debug)]
pub struct MemoryBackend {
    inner: RefCell<Inner>,
    capacity: u64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_capacity(10 * 1024 * 1024 * 1024)
    }

    /// `capacity` is reported as available space minus what a dataset uses
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            inner: RefCell::new(Inner::default()),
            capacity,
        }
    }

    /// Make the next call of `op` fail with a backend error
    pub fn fail_on(&self, op: FailOn) {
        self.inner.borrow_mut().fail = Some(op);
    }

    fn check_fail(&self, op: FailOn, name: &str) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail == Some(op) {
            inner.fail = None;
            return Err(Error::Backend(format!("injected {:?} failure on {}", op, name)));
        }
        Ok(())
    }

    fn next_creation(inner: &mut Inner) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        inner.last_creation = now.max(inner.last_creation + 1);
        inner.last_creation
    }

    fn destroy_snapshot(inner: &mut Inner, snapshot: &str) -> Result<()> {
        if !inner.snapshots.contains_key(snapshot) {
            return Err(Error::Backend(format!("could not find snapshot '{}'", snapshot)));
        }
        if let Some((clone, _)) = inner
            .datasets
            .iter()
            .find(|(_, ds)| ds.origin.as_deref() == Some(snapshot))
        {
            return Err(Error::Backend(format!(
                "cannot destroy '{}': snapshot has dependent clone '{}'",
                snapshot, clone
            )));
        }
        inner.snapshots.remove(snapshot);
        Ok(())
    }

    fn destroy_dataset(inner: &mut Inner, dataset: &str, recursive: bool) -> Result<()> {
        let Some(ds) = inner.datasets.get(dataset) else {
            return Err(Error::Backend(format!("dataset '{}' does not exist", dataset)));
        };
        let mountpoint = ds.mountpoint.clone();

        let child_prefix = format!("{}/", dataset);
        let snap_prefix = format!("{}@", dataset);
        let mut descendants: Vec<String> = inner
            .datasets
            .keys()
            .filter(|name| name.starts_with(&child_prefix))
            .cloned()
            .collect();
        let own_snapshots: Vec<String> = inner
            .snapshots
            .keys()
            .filter(|name| name.starts_with(&snap_prefix))
            .cloned()
            .collect();

        if !recursive && (!descendants.is_empty() || !own_snapshots.is_empty()) {
            return Err(Error::Backend(format!(
                "cannot destroy '{}': filesystem has children",
                dataset
            )));
        }

        // deepest first
        descendants.sort_by_key(|name| std::cmp::Reverse(name.len()));
        for child in descendants {
            Self::destroy_dataset(inner, &child, true)?;
        }
        for snapshot in own_snapshots {
            Self::destroy_snapshot(inner, &snapshot)?;
        }

        inner.datasets.remove(dataset);
        match fs::remove_dir_all(&mountpoint) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Read every regular file under `root`, keyed by relative path
fn read_tree(root: &Path) -> Result<BTreeMap<PathBuf, Vec<u8>>> {
    let mut files = BTreeMap::new();
    if root.exists() {
        collect_files(root, root, &mut files)?;
    }
    Ok(files)
}

fn collect_files(root: &Path, dir: &Path, files: &mut BTreeMap<PathBuf, Vec<u8>>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, files)?;
        } else if file_type.is_file() {
            let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            files.insert(relative, fs::read(&path)?);
        }
    }
    Ok(())
}

fn write_tree(root: &Path, files: &BTreeMap<PathBuf, Vec<u8>>) -> Result<()> {
    fs::create_dir_all(root)?;
    for (relative, content) in files {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
    }
    Ok(())
}

impl DatasetBackend for MemoryBackend {
    fn exists(&self, dataset: &str) -> Result<bool> {
        Ok(self.inner.borrow().datasets.contains_key(dataset))
    }

    fn create(&self, dataset: &str, mountpoint: &Path) -> Result<()> {
        self.check_fail(FailOn::Create, dataset)?;
        let mut inner = self.inner.borrow_mut();
        if inner.datasets.contains_key(dataset) {
            return Err(Error::Backend(format!("dataset '{}' already exists", dataset)));
        }
        fs::create_dir_all(mountpoint)?;
        inner.datasets.insert(
            dataset.to_string(),
            MemDataset {
                mountpoint: mountpoint.to_path_buf(),
                origin: None,
                properties: BTreeMap::new(),
            },
        );
        debug!(dataset, "memory dataset created");
        Ok(())
    }

    fn destroy(&self, name: &str, recursive: bool) -> Result<()> {
        self.check_fail(FailOn::Destroy, name)?;
        let mut inner = self.inner.borrow_mut();
        if name.contains('@') {
            Self::destroy_snapshot(&mut inner, name)
        } else {
            Self::destroy_dataset(&mut inner, name, recursive)
        }
    }

    fn snapshot(&self, snapshot: &str) -> Result<()> {
        self.check_fail(FailOn::Snapshot, snapshot)?;
        let Some((dataset, _)) = snapshot.split_once('@') else {
            return Err(Error::Backend(format!("invalid snapshot name '{}'", snapshot)));
        };
        let mut inner = self.inner.borrow_mut();
        let Some(ds) = inner.datasets.get(dataset) else {
            return Err(Error::Backend(format!("dataset '{}' does not exist", dataset)));
        };
        if inner.snapshots.contains_key(snapshot) {
            return Err(Error::Backend(format!("snapshot '{}' already exists", snapshot)));
        }
        let files = read_tree(&ds.mountpoint)?;
        let creation = Self::next_creation(&mut inner);
        inner
            .snapshots
            .insert(snapshot.to_string(), MemSnapshot { creation, files });
        Ok(())
    }

    fn clone_snapshot(
        &self,
        snapshot: &str,
        dataset: &str,
        mountpoint: &Path,
        properties: &[(&str, &str)],
    ) -> Result<()> {
        self.check_fail(FailOn::Clone, dataset)?;
        let mut inner = self.inner.borrow_mut();
        let Some(snap) = inner.snapshots.get(snapshot) else {
            return Err(Error::Backend(format!("could not find snapshot '{}'", snapshot)));
        };
        if inner.datasets.contains_key(dataset) {
            return Err(Error::Backend(format!("dataset '{}' already exists", dataset)));
        }
        write_tree(mountpoint, &snap.files)?;
        inner.datasets.insert(
            dataset.to_string(),
            MemDataset {
                mountpoint: mountpoint.to_path_buf(),
                origin: Some(snapshot.to_string()),
                properties: properties
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        );
        Ok(())
    }

    fn promote(&self, dataset: &str) -> Result<()> {
        self.check_fail(FailOn::Promote, dataset)?;
        let mut inner = self.inner.borrow_mut();
        let Some(ds) = inner.datasets.get(dataset) else {
            return Err(Error::Backend(format!("dataset '{}' does not exist", dataset)));
        };
        let Some(origin) = ds.origin.clone() else {
            return Err(Error::Backend(format!(
                "cannot promote '{}': not a cloned filesystem",
                dataset
            )));
        };
        let Some((parent, origin_snap)) = origin.split_once('@') else {
            return Err(Error::Backend(format!("invalid origin '{}'", origin)));
        };
        let parent = parent.to_string();
        let origin_creation = inner
            .snapshots
            .get(&origin)
            .map(|s| s.creation)
            .ok_or_else(|| Error::Backend(format!("could not find snapshot '{}'", origin)))?;

        // the origin and everything older on the parent moves to the clone
        let parent_prefix = format!("{}@", parent);
        let moving: Vec<(String, String)> = inner
            .snapshots
            .iter()
            .filter(|(name, snap)| {
                name.starts_with(&parent_prefix) && snap.creation <= origin_creation
            })
            .map(|(name, _)| {
                let short = &name[parent_prefix.len()..];
                (name.clone(), format!("{}@{}", dataset, short))
            })
            .collect();
        if let Some((_, taken)) = moving.iter().find(|(_, to)| inner.snapshots.contains_key(to)) {
            return Err(Error::Backend(format!(
                "cannot promote '{}': snapshot name conflict with '{}'",
                dataset, taken
            )));
        }

        for (from, to) in &moving {
            if let Some(snap) = inner.snapshots.remove(from) {
                inner.snapshots.insert(to.clone(), snap);
            }
            for other in inner.datasets.values_mut() {
                if other.origin.as_deref() == Some(from.as_str()) {
                    other.origin = Some(to.clone());
                }
            }
        }

        let parent_origin = inner.datasets.get_mut(&parent).and_then(|p| {
            let previous = p.origin.take();
            p.origin = Some(format!("{}@{}", dataset, origin_snap));
            previous
        });
        if let Some(ds) = inner.datasets.get_mut(dataset) {
            ds.origin = parent_origin;
        }
        debug!(dataset, parent = %parent, moved = moving.len(), "memory dataset promoted");
        Ok(())
    }

    fn property(&self, dataset: &str, name: &str) -> Result<Option<String>> {
        let inner = self.inner.borrow();
        inner
            .datasets
            .get(dataset)
            .map(|ds| ds.properties.get(name).cloned())
            .ok_or_else(|| Error::Backend(format!("dataset '{}' does not exist", dataset)))
    }

    fn clear_property(&self, dataset: &str, name: &str) -> Result<()> {
        self.check_fail(FailOn::ClearProperty, dataset)?;
        let mut inner = self.inner.borrow_mut();
        let Some(ds) = inner.datasets.get_mut(dataset) else {
            return Err(Error::Backend(format!("dataset '{}' does not exist", dataset)));
        };
        ds.properties.remove(name);
        Ok(())
    }

    fn origin(&self, dataset: &str) -> Result<Option<String>> {
        let inner = self.inner.borrow();
        inner
            .datasets
            .get(dataset)
            .map(|ds| ds.origin.clone())
            .ok_or_else(|| Error::Backend(format!("dataset '{}' does not exist", dataset)))
    }

    fn usage(&self, dataset: &str) -> Result<DatasetEntry> {
        let mountpoint = {
            let inner = self.inner.borrow();
            let Some(ds) = inner.datasets.get(dataset) else {
                return Err(Error::Backend(format!("dataset '{}' does not exist", dataset)));
            };
            ds.mountpoint.clone()
        };
        let used: u64 = read_tree(&mountpoint)?.values().map(|f| f.len() as u64).sum();
        Ok(DatasetEntry {
            name: dataset.to_string(),
            used_bytes: used,
            available_bytes: self.capacity.saturating_sub(used),
        })
    }

    fn children(&self, parent: &str) -> Result<Vec<DatasetEntry>> {
        let prefix = format!("{}/", parent);
        let names: Vec<String> = self
            .inner
            .borrow()
            .datasets
            .keys()
            .filter(|name| {
                name.strip_prefix(&prefix)
                    .map(|rest| !rest.contains('/'))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        names.iter().map(|name| self.usage(name)).collect()
    }

    fn snapshots(&self, dataset: &str, recursive: bool) -> Result<Vec<SnapshotEntry>> {
        let child_prefix = format!("{}/", dataset);
        let inner = self.inner.borrow();
        let mut entries: Vec<SnapshotEntry> = inner
            .snapshots
            .iter()
            .filter(|(name, _)| {
                let owner = name.split_once('@').map(|(ds, _)| ds).unwrap_or("");
                owner == dataset || (recursive && owner.starts_with(&child_prefix))
            })
            .map(|(name, snap)| SnapshotEntry {
                full_name: name.clone(),
                creation: snap.creation,
                referenced_bytes: snap.referenced(),
            })
            .collect();
        entries.sort_by_key(|e| e.creation);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "pool/states";

    fn ds(name: &str) -> String {
        format!("{}/{}", BASE, name)
    }

    #[test]
    fn snapshot_captures_content_at_that_moment() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let mnt = dir.path().join("a");
        backend.create(&ds("a"), &mnt).unwrap();
        fs::write(mnt.join("data.img"), b"v1").unwrap();
        backend.snapshot(&format!("{}@s1", ds("a"))).unwrap();
        fs::write(mnt.join("data.img"), b"v2").unwrap();

        let clone_mnt = dir.path().join("b");
        backend
            .clone_snapshot(&format!("{}@s1", ds("a")), &ds("b"), &clone_mnt, &[])
            .unwrap();
        assert_eq!(fs::read(clone_mnt.join("data.img")).unwrap(), b"v1");
        assert_eq!(backend.origin(&ds("b")).unwrap().as_deref(), Some("pool/states/a@s1"));
    }

    #[test]
    fn dependent_clone_blocks_destroy_until_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.create(&ds("a"), &dir.path().join("a")).unwrap();
        let snap = format!("{}@s1", ds("a"));
        backend.snapshot(&snap).unwrap();
        backend
            .clone_snapshot(&snap, &ds("b"), &dir.path().join("b"), &[])
            .unwrap();

        assert!(backend.destroy(&snap, false).is_err());
        assert!(backend.destroy(&ds("a"), true).is_err());

        backend.promote(&ds("b")).unwrap();
        assert_eq!(backend.origin(&ds("b")).unwrap(), None);
        assert_eq!(
            backend.origin(&ds("a")).unwrap().as_deref(),
            Some("pool/states/b@s1")
        );
        backend.destroy(&ds("a"), true).unwrap();
        assert!(!backend.exists(&ds("a")).unwrap());
        assert!(!dir.path().join("a").exists());
        assert!(backend.exists(&ds("b")).unwrap());
    }

    #[test]
    fn non_recursive_destroy_refuses_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.create(&ds("a"), &dir.path().join("a")).unwrap();
        backend.snapshot(&format!("{}@s1", ds("a"))).unwrap();
        assert!(backend.destroy(&ds("a"), false).is_err());
    }

    #[test]
    fn children_are_immediate_only() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.create(&ds("a"), &dir.path().join("a")).unwrap();
        backend.create(&ds("a/nested"), &dir.path().join("nested")).unwrap();
        backend.create("other/x", &dir.path().join("x")).unwrap();
        let names: Vec<String> = backend
            .children(BASE)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![ds("a")]);
    }

    #[test]
    fn injected_failure_fires_once() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.fail_on(FailOn::Create);
        assert!(backend.create(&ds("a"), &dir.path().join("a")).is_err());
        backend.create(&ds("a"), &dir.path().join("a")).unwrap();
    }

    #[test]
    fn usage_counts_file_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::with_capacity(1000);
        let mnt = dir.path().join("a");
        backend.create(&ds("a"), &mnt).unwrap();
        fs::write(mnt.join("data.img"), vec![0u8; 100]).unwrap();
        let usage = backend.usage(&ds("a")).unwrap();
        assert_eq!(usage.used_bytes, 100);
        assert_eq!(usage.available_bytes, 900);
    }

    #[test]
    fn promote_moves_origin_and_older_snapshots_to_clone() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.create(&ds("a"), &dir.path().join("a")).unwrap();
        backend.snapshot(&format!("{}@old", ds("a"))).unwrap();
        backend.snapshot(&format!("{}@s1", ds("a"))).unwrap();
        backend.snapshot(&format!("{}@newer", ds("a"))).unwrap();
        backend
            .clone_snapshot(&format!("{}@s1", ds("a")), &ds("b"), &dir.path().join("b"), &[])
            .unwrap();

        backend.promote(&ds("b")).unwrap();

        let names = |d: &str| -> Vec<String> {
            backend
                .snapshots(&ds(d), false)
                .unwrap()
                .into_iter()
                .map(|s| s.full_name)
                .collect()
        };
        assert_eq!(names("b"), vec!["pool/states/b@old", "pool/states/b@s1"]);
        assert_eq!(names("a"), vec!["pool/states/a@newer"]);

        // the former parent now blocks the moved origin snapshot
        assert!(backend.destroy("pool/states/b@s1", false).is_err());
        assert!(backend.promote(&ds("b")).is_err());

        // promoting back restores the original direction
        backend.promote(&ds("a")).unwrap();
        assert_eq!(backend.origin(&ds("a")).unwrap(), None);
        assert_eq!(
            backend.origin(&ds("b")).unwrap().as_deref(),
            Some("pool/states/a@s1")
        );
    }

    #[test]
    fn clone_properties_can_be_read_and_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.create(&ds("a"), &dir.path().join("a")).unwrap();
        let snap = format!("{}@s1", ds("a"));
        backend.snapshot(&snap).unwrap();
        backend
            .clone_snapshot(&snap, &ds("b"), &dir.path().join("b"), &[("vm-state:pending", "on")])
            .unwrap();

        assert_eq!(backend.property(&ds("b"), "vm-state:pending").unwrap().as_deref(), Some("on"));
        assert_eq!(backend.property(&ds("a"), "vm-state:pending").unwrap(), None);
        backend.clear_property(&ds("b"), "vm-state:pending").unwrap();
        assert_eq!(backend.property(&ds("b"), "vm-state:pending").unwrap(), None);
    }
}

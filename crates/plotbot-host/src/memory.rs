//! In-memory drives for deterministic tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plotbot_core::{PlotError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::drives::{DriveId, Drives, FileEntry};

#[derive(Debug, Clone)]
struct MemFile {
    data: Vec<u8>,
    size: u64,
    modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    /// Mount point -> capacity in bytes
    mounts: BTreeMap<PathBuf, u64>,
    files: BTreeMap<PathBuf, MemFile>,
    dirs: BTreeSet<PathBuf>,
    /// Directory -> listings left to fail
    failing_listings: BTreeMap<PathBuf, u32>,
}

impl State {
    fn mount_of(&self, path: &Path) -> Option<&PathBuf> {
        self.mounts
            .keys()
            .filter(|mount| path.starts_with(mount))
            .max_by_key(|mount| mount.components().count())
    }

    fn free_space(&self, path: &Path) -> u64 {
        let Some(mount) = self.mount_of(path) else {
            return u64::MAX;
        };
        let used: u64 = self
            .files
            .iter()
            .filter(|(p, _)| self.mount_of(p) == Some(mount))
            .map(|(_, f)| f.size)
            .sum();
        self.mounts[mount].saturating_sub(used)
    }
}

fn not_found(path: &Path) -> PlotError {
    PlotError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} not found", path.display()),
    ))
}

/// Drives backed by a map of paths, with capacity-limited mount points
///
/// Files may carry a nominal size larger than their contents so that
/// hundred-gigabyte plots cost nothing in tests. Paths outside any mount
/// have unlimited space.
#[derive(Debug, Clone, Default)]
pub struct MemoryDrives {
    state: Arc<Mutex<State>>,
}

impl MemoryDrives {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare a mount point with the given capacity in bytes
    pub fn with_mount(self, mount: impl Into<PathBuf>, capacity: u64) -> Self {
        let mount = mount.into();
        {
            let mut state = self.state();
            state.dirs.insert(mount.clone());
            state.mounts.insert(mount, capacity);
        }
        self
    }

    /// Add a file with a nominal size and no contents
    pub fn add_file(&self, path: impl Into<PathBuf>, size: u64, modified: DateTime<Utc>) {
        self.state().files.insert(
            path.into(),
            MemFile {
                data: Vec::new(),
                size,
                modified,
            },
        );
    }

    /// Replace a file's contents
    pub fn write_file(&self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) {
        let data = contents.into();
        self.state().files.insert(
            path.into(),
            MemFile {
                size: data.len() as u64,
                data,
                modified: Utc::now(),
            },
        );
    }

    /// Append to a file, creating it if needed
    pub fn append_file(&self, path: impl Into<PathBuf>, contents: &[u8]) {
        let mut state = self.state();
        let file = state.files.entry(path.into()).or_insert_with(|| MemFile {
            data: Vec::new(),
            size: 0,
            modified: Utc::now(),
        });
        file.data.extend_from_slice(contents);
        file.size += contents.len() as u64;
        file.modified = Utc::now();
    }

    /// Override a file's modification time
    pub fn set_modified(&self, path: &Path, modified: DateTime<Utc>) {
        if let Some(file) = self.state().files.get_mut(path) {
            file.modified = modified;
        }
    }

    pub fn exists(&self, path: &Path) -> bool {
        let state = self.state();
        state.files.contains_key(path) || state.dirs.contains(path)
    }

    /// Contents of a file as text
    pub fn contents(&self, path: &Path) -> Option<String> {
        self.state()
            .files
            .get(path)
            .map(|f| String::from_utf8_lossy(&f.data).into_owned())
    }

    /// Every file path at or below `dir`
    pub fn files_under(&self, dir: &Path) -> Vec<PathBuf> {
        self.state()
            .files
            .keys()
            .filter(|p| p.starts_with(dir))
            .cloned()
            .collect()
    }

    /// Make the next `times` listings of `dir` fail with an I/O error
    pub fn fail_listings(&self, dir: impl Into<PathBuf>, times: u32) {
        self.state().failing_listings.insert(dir.into(), times);
    }

    /// Free bytes on the mount holding `path`
    pub fn free_space(&self, path: &Path) -> u64 {
        self.state().free_space(path)
    }
}

#[async_trait]
impl Drives for MemoryDrives {
    async fn available_space(&self, path: &Path) -> Result<u64> {
        Ok(self.free_space(path))
    }

    async fn drive_id(&self, path: &Path) -> Result<DriveId> {
        let state = self.state();
        let mount = state.mount_of(path).map_or(path, PathBuf::as_path);
        Ok(DriveId::Root(mount.to_path_buf()))
    }

    async fn list_files(&self, dir: &Path) -> Result<Vec<FileEntry>> {
        let mut state = self.state();
        if let Some(left) = state.failing_listings.get_mut(dir).filter(|left| **left > 0) {
            *left -= 1;
            return Err(PlotError::Io(io::Error::other(format!(
                "Input/output error listing {}",
                dir.display()
            ))));
        }
        Ok(state
            .files
            .iter()
            .filter(|(p, _)| p.parent() == Some(dir))
            .map(|(p, f)| FileEntry {
                path: p.clone(),
                size: f.size,
                modified: f.modified,
            })
            .collect())
    }

    async fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let state = self.state();
        let children: BTreeSet<PathBuf> = state
            .files
            .keys()
            .chain(state.dirs.iter())
            .filter_map(|p| p.strip_prefix(dir).ok())
            .filter_map(|rest| rest.components().next())
            .map(|first| dir.join(first))
            .collect();
        Ok(children.into_iter().collect())
    }

    async fn metadata(&self, path: &Path) -> Result<FileEntry> {
        self.state()
            .files
            .get(path)
            .map(|f| FileEntry {
                path: path.to_path_buf(),
                size: f.size,
                modified: f.modified,
            })
            .ok_or_else(|| not_found(path))
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.state()
            .files
            .get(path)
            .map(|f| f.data.clone())
            .ok_or_else(|| not_found(path))
    }

    async fn append(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.append_file(path, data);
        Ok(())
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.state().dirs.insert(path.to_path_buf());
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        self.state()
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }

    async fn remove_all(&self, path: &Path) -> Result<()> {
        let mut state = self.state();
        let before = state.files.len() + state.dirs.len();
        state.files.retain(|p, _| !p.starts_with(path));
        state.dirs.retain(|p| !p.starts_with(path));
        if state.files.len() + state.dirs.len() == before {
            return Err(not_found(path));
        }
        Ok(())
    }

    async fn move_file(&self, from: &Path, to: &Path) -> Result<()> {
        let mut state = self.state();
        let file = state.files.get(from).cloned().ok_or_else(|| not_found(from))?;

        let same_mount = state.mount_of(from).is_some() && state.mount_of(from) == state.mount_of(to);
        if !same_mount && state.free_space(to) < file.size {
            return Err(PlotError::Io(io::Error::other(format!(
                "No space left on device holding {}",
                to.display()
            ))));
        }

        state.files.remove(from);
        state.files.insert(to.to_path_buf(), file);
        Ok(())
    }
}

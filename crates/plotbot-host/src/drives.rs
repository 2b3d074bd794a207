//! Directory abstraction over the local filesystem

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plotbot_core::{PlotError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

/// A regular file as seen by [`Drives::list_files`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl FileEntry {
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

/// Identity of the physical drive holding a path
///
/// Two directories with the same id share free space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DriveId {
    /// Device number reported by the filesystem
    Device(u64),
    /// Mount point or path root, where no device number is available
    Root(PathBuf),
}

impl std::fmt::Display for DriveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Device(dev) => write!(f, "device {}", dev),
            Self::Root(root) => write!(f, "{}", root.display()),
        }
    }
}

/// Directory and drive operations used by the orchestrator (allows in-memory doubles)
#[async_trait]
pub trait Drives: Send + Sync {
    /// Bytes available to unprivileged writers on the drive holding `path`
    async fn available_space(&self, path: &Path) -> Result<u64>;

    /// Drive holding `path`; a missing path resolves through its nearest existing parent
    async fn drive_id(&self, path: &Path) -> Result<DriveId>;

    /// Regular files directly inside `dir`; a missing directory is empty
    async fn list_files(&self, dir: &Path) -> Result<Vec<FileEntry>>;

    /// Every direct child of `dir` (files and directories); a missing directory is empty
    async fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>>;

    /// Size and modification time of a file
    async fn metadata(&self, path: &Path) -> Result<FileEntry>;

    /// Full contents of a file
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Append to a file, creating it if needed
    async fn append(&self, path: &Path, data: &[u8]) -> Result<()>;

    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    async fn remove_file(&self, path: &Path) -> Result<()>;

    /// Remove a file or a whole directory tree
    async fn remove_all(&self, path: &Path) -> Result<()>;

    /// Move a file; the destination either receives the complete file or nothing
    async fn move_file(&self, from: &Path, to: &Path) -> Result<()>;
}

/// True when the error is a missing file or directory
pub fn is_not_found(err: &PlotError) -> bool {
    matches!(err, PlotError::Io(e) if e.kind() == ErrorKind::NotFound)
}

/// Temporary name used while a file is copied into place
fn partial_path(to: &Path) -> PathBuf {
    let mut name = to.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    to.with_file_name(name)
}

#[cfg(unix)]
fn drive_id_of(_path: &Path, meta: &std::fs::Metadata) -> DriveId {
    use std::os::unix::fs::MetadataExt;
    DriveId::Device(meta.dev())
}

#[cfg(not(unix))]
fn drive_id_of(path: &Path, _meta: &std::fs::Metadata) -> DriveId {
    use std::path::Component;
    DriveId::Root(
        path.components()
            .take_while(|c| matches!(c, Component::Prefix(_) | Component::RootDir))
            .collect(),
    )
}

/// Real filesystem implementation
///
/// In dry-run mode deletions and moves are logged and skipped.
#[derive(Debug, Clone, Default)]
pub struct LocalDrives {
    dry_run: bool,
}

impl LocalDrives {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log destructive operations instead of performing them
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    async fn copy_into_place(from: &Path, to: &Path) -> Result<()> {
        let partial = partial_path(to);
        if let Err(e) = tokio::fs::copy(from, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&partial, to).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }
        tokio::fs::remove_file(from).await?;
        Ok(())
    }
}

#[async_trait]
impl Drives for LocalDrives {
    async fn available_space(&self, path: &Path) -> Result<u64> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || fs2::available_space(&path))
            .await
            .map_err(|e| PlotError::Other(format!("Free space query panicked: {}", e)))?
            .map_err(PlotError::from)
    }

    async fn drive_id(&self, path: &Path) -> Result<DriveId> {
        for dir in path.ancestors() {
            let dir = if dir.as_os_str().is_empty() {
                Path::new(".")
            } else {
                dir
            };
            match tokio::fs::metadata(dir).await {
                Ok(meta) => return Ok(drive_id_of(dir, &meta)),
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(PlotError::Io(std::io::Error::new(
            ErrorKind::NotFound,
            format!("no existing parent of {}", path.display()),
        )))
    }

    async fn list_files(&self, dir: &Path) -> Result<Vec<FileEntry>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() {
                files.push(FileEntry {
                    path: entry.path(),
                    size: meta.len(),
                    modified: meta.modified()?.into(),
                });
            }
        }
        Ok(files)
    }

    async fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            paths.push(entry.path());
        }
        Ok(paths)
    }

    async fn metadata(&self, path: &Path) -> Result<FileEntry> {
        let meta = tokio::fs::metadata(path).await?;
        Ok(FileEntry {
            path: path.to_path_buf(),
            size: meta.len(),
            modified: meta.modified()?.into(),
        })
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn append(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        Ok(tokio::fs::create_dir_all(path).await?)
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        if self.dry_run {
            info!("[test mode] Would delete {}", path.display());
            return Ok(());
        }
        debug!("Deleting {}", path.display());
        Ok(tokio::fs::remove_file(path).await?)
    }

    async fn remove_all(&self, path: &Path) -> Result<()> {
        if self.dry_run {
            info!("[test mode] Would delete {} recursively", path.display());
            return Ok(());
        }
        debug!("Deleting {} recursively", path.display());
        let meta = tokio::fs::symlink_metadata(path).await?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(from = %from.display(), to = %to.display()))]
    async fn move_file(&self, from: &Path, to: &Path) -> Result<()> {
        if self.dry_run {
            info!("[test mode] Would move {} to {}", from.display(), to.display());
            return Ok(());
        }

        match tokio::fs::rename(from, to).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Different filesystem: copy next to the target, then rename
                debug!("Rename failed ({}), copying instead", e);
                Self::copy_into_place(from, to).await.map_err(|err| {
                    warn!("Moving {} failed: {}", from.display(), err);
                    err
                })
            }
        }
    }
}

//! Per-drive serialization of clearing and relocation

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::drives::DriveId;

/// One async lock per physical drive
///
/// Held across a clear-then-move sequence so that two instances finishing
/// at once never both count the same free space, even when they target
/// different directories of one drive.
#[derive(Debug, Clone, Default)]
pub struct DriveLocks {
    locks: Arc<Mutex<HashMap<DriveId, Arc<AsyncMutex<()>>>>>,
}

impl DriveLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, drive: &DriveId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(drive.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `drive`
    pub async fn lock(&self, drive: &DriveId) -> OwnedMutexGuard<()> {
        self.entry(drive).lock_owned().await
    }

    /// Exclusive access to `drive` if nobody holds it
    pub fn try_lock(&self, drive: &DriveId) -> Option<OwnedMutexGuard<()>> {
        self.entry(drive).try_lock_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn root(path: &str) -> DriveId {
        DriveId::Root(PathBuf::from(path))
    }

    #[tokio::test]
    async fn test_same_drive_is_exclusive() {
        let locks = DriveLocks::new();
        let guard = locks.lock(&root("/mnt/hdd1")).await;

        assert!(locks.try_lock(&root("/mnt/hdd1")).is_none());
        assert!(locks.try_lock(&root("/mnt/hdd2")).is_some());
        assert!(locks.try_lock(&DriveId::Device(7)).is_some());

        drop(guard);
        assert!(locks.try_lock(&root("/mnt/hdd1")).is_some());
    }

    #[tokio::test]
    async fn test_clones_share_locks() {
        let locks = DriveLocks::new();
        let other = locks.clone();
        let _guard = locks.lock(&DriveId::Device(2049)).await;
        assert!(other.try_lock(&DriveId::Device(2049)).is_none());
    }
}

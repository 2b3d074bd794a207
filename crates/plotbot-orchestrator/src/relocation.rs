//! Moving finished plots to destination drives
//!
//! A plot only moves to a drive whose free space, checked under the drive
//! lock, covers its size. When no drive qualifies the drives' clearers get
//! a chance to make room; if that fails too the relocation is deferred and
//! retried on a later tick. The plot is never dropped.

use bytesize::ByteSize;
use chrono::{DateTime, Duration, Utc};
use plotbot_core::{DriveConfig, PlotBotConfig, PlotError, PlotterConfig, Result};
use plotbot_host::{DriveLocks, Drives};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument, warn};

use crate::clearer::DriveClearer;
use crate::registry::Registry;

/// A drive finished plots can be moved to, with its clearers resolved
#[derive(Clone)]
pub struct Destination {
    pub drive: DriveConfig,
    pub clearers: Vec<Arc<dyn DriveClearer>>,
}

impl Destination {
    pub fn new(drive: DriveConfig, clearers: Vec<Arc<dyn DriveClearer>>) -> Self {
        Self { drive, clearers }
    }

    pub fn alias(&self) -> &str {
        &self.drive.alias
    }

    pub fn directory(&self) -> &Path {
        &self.drive.directory
    }
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let clearers: Vec<&str> = self.clearers.iter().map(|c| c.name()).collect();
        f.debug_struct("Destination")
            .field("alias", &self.drive.alias)
            .field("directory", &self.drive.directory)
            .field("plotters", &self.drive.plotters)
            .field("clearers", &clearers)
            .finish()
    }
}

/// Result of one relocation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocationOutcome {
    Relocated { destination: PathBuf },
    /// No drive could take the plot this time
    Deferred { reason: String },
}

/// Chooses destinations, runs clearers and moves plots
///
/// Cheap to clone; clones share drive locks and clearer cooldowns.
#[derive(Clone)]
pub struct Relocator {
    drives: Arc<dyn Drives>,
    locks: DriveLocks,
    destinations: Arc<Vec<Destination>>,
    /// Drive directory -> earliest time its clearers may run again
    cooldowns: Arc<Mutex<HashMap<PathBuf, DateTime<Utc>>>>,
    idle: Duration,
}

impl Relocator {
    pub fn new(
        drives: Arc<dyn Drives>,
        destinations: Vec<Destination>,
        clearer_idle_secs: u64,
    ) -> Self {
        Self {
            drives,
            locks: DriveLocks::new(),
            destinations: Arc::new(destinations),
            cooldowns: Arc::default(),
            idle: Duration::seconds(clearer_idle_secs.min(i64::MAX as u64) as i64),
        }
    }

    /// Build destinations from configuration, resolving clearers by name
    pub fn from_config(
        config: &PlotBotConfig,
        registry: &Registry,
        drives: Arc<dyn Drives>,
    ) -> Result<Self> {
        let destinations = config
            .drives
            .iter()
            .map(|drive| {
                let clearers = drive
                    .clearers
                    .iter()
                    .map(|spec| registry.clearer(spec))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Destination::new(drive.clone(), clearers))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(
            drives,
            destinations,
            config.settings.drive_clearer_idle_secs,
        ))
    }

    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    fn candidates<'a>(&'a self, profile: &'a str) -> impl Iterator<Item = &'a Destination> + 'a {
        self.destinations.iter().filter(move |d| d.drive.accepts(profile))
    }

    /// True when some drive of the profile fits `size` now or could be
    /// cleared to fit it
    pub async fn can_accept(&self, profile: &PlotterConfig) -> bool {
        let size = profile.plot_size.expected_bytes();
        for destination in self.candidates(&profile.alias) {
            if !destination.clearers.is_empty() {
                return true;
            }
            match self.drives.available_space(destination.directory()).await {
                Ok(free) if free >= size => return true,
                Ok(_) => {}
                Err(e) => debug!(
                    "Cannot query free space of drive <{}>: {}",
                    destination.alias(), e
                ),
            }
        }
        false
    }

    /// Exclusive access to the drive holding `directory`
    ///
    /// Directories on one physical drive share the lock.
    async fn lock_drive(&self, directory: &Path) -> Result<OwnedMutexGuard<()>> {
        let drive = self.drives.drive_id(directory).await?;
        Ok(self.locks.lock(&drive).await)
    }

    fn cooling_down(&self, directory: &Path, now: DateTime<Utc>) -> bool {
        let cooldowns = self.cooldowns.lock().unwrap_or_else(PoisonError::into_inner);
        cooldowns.get(directory).is_some_and(|until| *until > now)
    }

    fn start_cooldown(&self, directory: &Path, now: DateTime<Utc>) {
        let mut cooldowns = self.cooldowns.lock().unwrap_or_else(PoisonError::into_inner);
        cooldowns.insert(directory.to_path_buf(), now + self.idle);
    }

    /// Try once to move `artifact` to a drive of `profile`
    #[instrument(skip(self, artifact), fields(artifact = %artifact.display()))]
    pub async fn relocate(
        &self,
        profile: &str,
        artifact: &Path,
        now: DateTime<Utc>,
    ) -> Result<RelocationOutcome> {
        let size = self.drives.metadata(artifact).await?.size;
        let name = artifact.file_name().ok_or_else(|| {
            PlotError::Relocation(format!("{} has no file name", artifact.display()))
        })?;

        // Most free space first
        let mut ranked = Vec::new();
        for destination in self.candidates(profile) {
            match self.drives.available_space(destination.directory()).await {
                Ok(free) => ranked.push((free, destination)),
                Err(e) => warn!(
                    "Skipping drive <{}>: cannot query free space: {}",
                    destination.alias(), e
                ),
            }
        }
        ranked.sort_by(|a, b| b.0.cmp(&a.0));

        for &(free, destination) in ranked.iter().filter(|(free, _)| *free >= size) {
            let _guard = self.lock_drive(destination.directory()).await?;
            // Space may have been taken while waiting for the lock
            let free_now = self.drives.available_space(destination.directory()).await?;
            if free_now < size {
                debug!(
                    "Drive <{}> shrank from {} to {} while waiting",
                    destination.alias(),
                    ByteSize::b(free),
                    ByteSize::b(free_now)
                );
                continue;
            }
            return self.move_plot(artifact, destination, name).await;
        }

        for &(_, destination) in &ranked {
            if destination.clearers.is_empty() || self.cooling_down(destination.directory(), now) {
                continue;
            }
            let _guard = self.lock_drive(destination.directory()).await?;
            if self.clear_for(destination, size).await? {
                return self.move_plot(artifact, destination, name).await;
            }
            warn!(
                "{}",
                PlotError::ClearerExhausted {
                    drive: destination.directory().to_path_buf(),
                    required: size,
                }
            );
            self.start_cooldown(destination.directory(), now);
        }

        Ok(RelocationOutcome::Deferred {
            reason: format!(
                "no destination has {} free for {}",
                ByteSize::b(size),
                artifact.display()
            ),
        })
    }

    /// Run the drive's clearers in order until `size` bytes are free
    ///
    /// Must be called with the drive lock held.
    async fn clear_for(&self, destination: &Destination, size: u64) -> Result<bool> {
        for clearer in &destination.clearers {
            let free = self.drives.available_space(destination.directory()).await?;
            if free >= size {
                return Ok(true);
            }
            let required = size - free;
            info!(
                "Drive <{}> needs {} more, running clearer {}",
                destination.alias(),
                ByteSize::b(required),
                clearer.name()
            );
            let freed = clearer
                .clear(self.drives.as_ref(), destination.directory(), required)
                .await?;
            debug!("Clearer {} freed {}", clearer.name(), ByteSize::b(freed));
        }
        Ok(self.drives.available_space(destination.directory()).await? >= size)
    }

    async fn move_plot(
        &self,
        artifact: &Path,
        destination: &Destination,
        name: &std::ffi::OsStr,
    ) -> Result<RelocationOutcome> {
        let target = destination.directory().join(name);
        self.drives.create_dir_all(destination.directory()).await?;
        self.drives.move_file(artifact, &target).await?;
        info!("Moved {} to drive <{}>", artifact.display(), destination.alias());
        Ok(RelocationOutcome::Relocated {
            destination: target,
        })
    }
}

//! Drive clearers: free space on a destination by deleting eligible files
//!
//! Clearers are destructive but safe to repeat: with nothing eligible they
//! free nothing and succeed. The caller holds the drive lock.

use async_trait::async_trait;
use bytesize::ByteSize;
use chrono::{DateTime, NaiveDate, Utc};
use glob::Pattern;
use plotbot_core::{PlotError, Result};
use plotbot_host::{Drives, FileEntry};
use std::path::Path;
use tracing::info;

/// Strategy for freeing space on a destination directory
#[async_trait]
pub trait DriveClearer: Send + Sync {
    fn name(&self) -> &str;

    /// Delete files in `directory` aiming to free `required` bytes
    ///
    /// Returns the number of bytes freed, which may be less than asked.
    async fn clear(&self, drives: &dyn Drives, directory: &Path, required: u64) -> Result<u64>;
}

/// Which files in a directory a clearer may touch
#[derive(Debug, Clone)]
pub struct Selection {
    pattern: Pattern,
    before: Option<DateTime<Utc>>,
}

impl Selection {
    /// Parse `pattern=<glob>` and `before=<YYYY-MM-DD>` arguments
    pub fn from_args(clearer: &str, args: &[String], default_pattern: &str) -> Result<Self> {
        let mut pattern = default_pattern.to_string();
        let mut before = None;

        for arg in args {
            let (key, value) = arg.split_once('=').ok_or_else(|| {
                PlotError::config(format!("{}: expected key=value, got `{}`", clearer, arg))
            })?;
            match key.trim() {
                "pattern" => pattern = value.trim().to_string(),
                "before" => {
                    let date = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|e| {
                        PlotError::config(format!("{}: invalid date `{}`: {}", clearer, value, e))
                    })?;
                    before = Some(date.and_time(chrono::NaiveTime::MIN).and_utc());
                }
                other => {
                    return Err(PlotError::config(format!(
                        "{}: unknown argument `{}`",
                        clearer, other
                    )))
                }
            }
        }

        let pattern = Pattern::new(&pattern).map_err(|e| {
            PlotError::config(format!("{}: invalid pattern `{}`: {}", clearer, pattern, e))
        })?;
        Ok(Self { pattern, before })
    }

    /// Selection for clearers that delete finished plots
    ///
    /// `*.plot` alone would also match plots this service relocated, so a
    /// narrower `pattern=` or a `before=` date is required.
    pub fn previous_generation(clearer: &str, args: &[String]) -> Result<Self> {
        let selection = Self::from_args(clearer, args, "*.plot")?;
        let catch_all = matches!(selection.pattern.as_str(), "*" | "*.plot");
        if catch_all && selection.before.is_none() {
            return Err(PlotError::config(format!(
                "{}: needs `pattern=<glob>` matching only old plots or `before=<YYYY-MM-DD>`",
                clearer
            )));
        }
        Ok(selection)
    }

    pub fn matches(&self, file: &FileEntry) -> bool {
        let name_matches = file
            .file_name()
            .map(|name| self.pattern.matches(name))
            .unwrap_or(false);
        let old_enough = self.before.map_or(true, |before| file.modified < before);
        name_matches && old_enough
    }

    async fn candidates(&self, drives: &dyn Drives, directory: &Path) -> Result<Vec<FileEntry>> {
        Ok(drives
            .list_files(directory)
            .await?
            .into_iter()
            .filter(|f| self.matches(f))
            .collect())
    }
}

/// Delete files in order until `required` bytes are freed
async fn delete_until(
    clearer: &str,
    drives: &dyn Drives,
    victims: Vec<FileEntry>,
    required: u64,
) -> Result<u64> {
    let mut freed = 0u64;
    for victim in victims {
        if freed >= required {
            break;
        }
        drives.remove_file(&victim.path).await?;
        freed += victim.size;
        info!(
            "{}: deleted {} ({})",
            clearer,
            victim.path.display(),
            ByteSize::b(victim.size)
        );
    }
    Ok(freed)
}

/// Deletes OG plots oldest first
///
/// Arguments: `pattern=<glob>` (default `*.plot`), `before=<YYYY-MM-DD>`;
/// one of them must narrow the default.
#[derive(Debug, Clone)]
pub struct OgDateClearer {
    selection: Selection,
}

impl OgDateClearer {
    pub fn from_args(args: &[String]) -> Result<Self> {
        Ok(Self {
            selection: Selection::previous_generation("og-date", args)?,
        })
    }
}

#[async_trait]
impl DriveClearer for OgDateClearer {
    fn name(&self) -> &str {
        "og-date"
    }

    async fn clear(&self, drives: &dyn Drives, directory: &Path, required: u64) -> Result<u64> {
        let mut victims = self.selection.candidates(drives, directory).await?;
        victims.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
        delete_until(self.name(), drives, victims, required).await
    }
}

/// Deletes OG plots largest first, so the fewest files go
///
/// Arguments: `pattern=<glob>` (default `*.plot`), `before=<YYYY-MM-DD>`;
/// one of them must narrow the default.
#[derive(Debug, Clone)]
pub struct OgSizeClearer {
    selection: Selection,
}

impl OgSizeClearer {
    pub fn from_args(args: &[String]) -> Result<Self> {
        Ok(Self {
            selection: Selection::previous_generation("og-size", args)?,
        })
    }
}

#[async_trait]
impl DriveClearer for OgSizeClearer {
    fn name(&self) -> &str {
        "og-size"
    }

    async fn clear(&self, drives: &dyn Drives, directory: &Path, required: u64) -> Result<u64> {
        let mut victims = self.selection.candidates(drives, directory).await?;
        victims.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));
        delete_until(self.name(), drives, victims, required).await
    }
}

/// Deletes every empty file, typically the remains of a crash
///
/// Arguments: `pattern=<glob>` (default `*`).
#[derive(Debug, Clone)]
pub struct ZeroByteClearer {
    selection: Selection,
}

impl ZeroByteClearer {
    pub fn from_args(args: &[String]) -> Result<Self> {
        Ok(Self {
            selection: Selection::from_args("zero-byte", args, "*")?,
        })
    }
}

#[async_trait]
impl DriveClearer for ZeroByteClearer {
    fn name(&self) -> &str {
        "zero-byte"
    }

    async fn clear(&self, drives: &dyn Drives, directory: &Path, _required: u64) -> Result<u64> {
        for file in self.selection.candidates(drives, directory).await? {
            if file.size == 0 {
                drives.remove_file(&file.path).await?;
                info!("zero-byte: deleted {}", file.path.display());
            }
        }
        Ok(0)
    }
}

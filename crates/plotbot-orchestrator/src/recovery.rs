//! Startup recovery and housekeeping
//!
//! Instance state is never persisted. Instead every progress file starts
//! with a header line describing the instance, and a restart rebuilds the
//! running set by scanning the working directories:
//!
//! ```text
//! # plotbot instance=ab12cd34 profile=fast cache=/mnt/nvme1 output=/mnt/nvme1/ab12cd34 threads=8 ram=4000 buckets=128 started=2021-06-19T10:00:00+00:00
//! ```
//!
//! Values are delimited by the next known key, so paths may contain spaces.

use chrono::{DateTime, Utc};
use glob::Pattern;
use plotbot_core::{InstanceId, PlotError, ResourceShare, Result};
use plotbot_host::Drives;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::parser::HEADER_PREFIX;

/// Extension of progress files in a working directory
pub const PROGRESS_EXTENSION: &str = "progress";

const KEYS: [&str; 8] = [
    "instance", "profile", "cache", "output", "threads", "ram", "buckets", "started",
];

/// First line of every progress file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHeader {
    pub instance: InstanceId,
    pub profile: String,
    pub cache: PathBuf,
    pub output: PathBuf,
    pub share: ResourceShare,
    pub started: DateTime<Utc>,
}

impl InstanceHeader {
    /// Render the header, newline included
    pub fn to_line(&self) -> String {
        format!(
            "{} instance={} profile={} cache={} output={} threads={} ram={} buckets={} started={}\n",
            HEADER_PREFIX,
            self.instance,
            self.profile,
            self.cache.display(),
            self.output.display(),
            self.share.threads,
            self.share.ram,
            self.share.buckets,
            self.started.to_rfc3339()
        )
    }

    /// Parse a header line; `None` when the line is not a complete header
    pub fn parse(line: &str) -> Option<Self> {
        let mut rest = line
            .trim_end_matches(['\r', '\n'])
            .strip_prefix(HEADER_PREFIX)?
            .strip_prefix(' ')?;

        let mut values = Vec::with_capacity(KEYS.len());
        for (i, key) in KEYS.iter().enumerate() {
            rest = rest.strip_prefix(key)?.strip_prefix('=')?;
            let end = match KEYS.get(i + 1) {
                Some(next) => rest.find(&format!(" {}=", next))?,
                None => rest.len(),
            };
            values.push(&rest[..end]);
            rest = rest[end..].trim_start_matches(' ');
        }

        let number = |s: &str| s.parse::<u32>().ok();
        Some(Self {
            instance: InstanceId::from(values[0]),
            profile: values[1].to_string(),
            cache: PathBuf::from(values[2]),
            output: PathBuf::from(values[3]),
            share: ResourceShare::new(number(values[4])?, number(values[5])?, number(values[6])?),
            started: DateTime::parse_from_rfc3339(values[7]).ok()?.with_timezone(&Utc),
        })
    }
}

/// A progress file found at startup
#[derive(Debug, Clone)]
pub struct RecoveredInstance {
    pub progress_file: PathBuf,
    pub header: InstanceHeader,
}

/// Progress files in `working_dir` whose header names `profile`
pub async fn scan_progress_files(
    drives: &dyn Drives,
    working_dir: &Path,
    profile: &str,
) -> Result<Vec<RecoveredInstance>> {
    let mut recovered = Vec::new();
    for file in drives.list_files(working_dir).await? {
        if file.path.extension().and_then(|e| e.to_str()) != Some(PROGRESS_EXTENSION) {
            continue;
        }
        let content = drives.read(&file.path).await?;
        let first_line = String::from_utf8_lossy(&content)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string();

        match InstanceHeader::parse(&first_line) {
            Some(header) if header.profile == profile => recovered.push(RecoveredInstance {
                progress_file: file.path,
                header,
            }),
            Some(_) => {}
            None => info!(
                "Ignoring {}: no instance header",
                file.path.display()
            ),
        }
    }
    recovered.sort_by(|a, b| a.header.started.cmp(&b.header.started));
    Ok(recovered)
}

/// Delete leftovers in cache directories
///
/// Caches used by an adopted instance are left alone since its plotter may
/// still be writing temporary files there. Returns the number of entries
/// removed.
pub async fn cleanup_cache(
    drives: &dyn Drives,
    caches: &[PathBuf],
    in_use: &HashSet<PathBuf>,
) -> Result<usize> {
    let mut removed = 0;
    for cache in caches {
        if in_use.contains(cache) {
            info!(
                "Not cleaning cache {}: in use by a running instance",
                cache.display()
            );
            continue;
        }
        for entry in drives.list_dir(cache).await? {
            match drives.remove_all(&entry).await {
                Ok(()) => {
                    debug!("Removed cache leftover {}", entry.display());
                    removed += 1;
                }
                Err(e) => warn!("Could not remove {}: {}", entry.display(), e),
            }
        }
    }
    if removed > 0 {
        info!("Cache cleanup removed {} entries", removed);
    }
    Ok(removed)
}

/// Delete `*.tmp` leftovers of interrupted relocations
pub async fn cleanup_failed_copies(drives: &dyn Drives, directories: &[PathBuf]) -> Result<usize> {
    let pattern = Pattern::new("*.tmp").map_err(|e| PlotError::Other(e.to_string()))?;
    let mut removed = 0;
    for directory in directories {
        for file in drives.list_files(directory).await? {
            if file.file_name().is_some_and(|name| pattern.matches(name)) {
                drives.remove_file(&file.path).await?;
                info!("Removed failed copy {}", file.path.display());
                removed += 1;
            }
        }
    }
    Ok(removed)
}

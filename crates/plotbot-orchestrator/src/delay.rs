//! Delay policies: gates deciding whether a new instance may start now
//!
//! Policies observe; they never touch the filesystem beyond reading. The
//! orchestrator runs a profile's policies in declared order and the first
//! "no" wins.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use plotbot_core::{PlotError, Result};
use plotbot_host::{is_not_found, Drives};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// A running instance as seen by delay policies
#[derive(Debug, Clone)]
pub struct RunningInstance {
    pub cache: PathBuf,
    pub progress_file: PathBuf,
    pub started: DateTime<Utc>,
}

/// Remembers the last start per profile and per cache directory
///
/// Entries outlive the instances that created them.
#[derive(Debug, Clone, Default)]
pub struct StartLedger {
    inner: Arc<Mutex<LedgerState>>,
}

#[derive(Debug, Default)]
struct LedgerState {
    profiles: HashMap<String, DateTime<Utc>>,
    caches: HashMap<PathBuf, DateTime<Utc>>,
}

impl StartLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, profile: &str, cache: &Path, at: DateTime<Utc>) {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let latest = |slot: &mut DateTime<Utc>| *slot = (*slot).max(at);
        latest(state.profiles.entry(profile.to_string()).or_insert(at));
        latest(state.caches.entry(cache.to_path_buf()).or_insert(at));
    }

    pub fn last_for_profile(&self, profile: &str) -> Option<DateTime<Utc>> {
        let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.profiles.get(profile).copied()
    }

    pub fn last_for_cache(&self, cache: &Path) -> Option<DateTime<Utc>> {
        let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.caches.get(cache).copied()
    }
}

/// Everything a policy may look at
pub struct DelayContext<'a> {
    pub now: DateTime<Utc>,
    pub profile: &'a str,
    /// Cache directory the next instance would use
    pub cache: &'a Path,
    /// Instances of the profile that are still plotting
    pub running: &'a [RunningInstance],
    pub ledger: &'a StartLedger,
    pub drives: &'a dyn Drives,
}

/// Gate for starting a new instance
#[async_trait]
pub trait DelayPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(true)` when a start is allowed
    async fn allows(&self, ctx: &DelayContext<'_>) -> Result<bool>;
}

/// What a [`TimeStartedDelay`] measures from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartScope {
    Profile,
    Cache,
}

/// Disallows a start within `minutes` of the last start on the same
/// profile (default) or cache directory
///
/// Arguments: `[minutes, scope?]` with scope `profile` or `cache`.
#[derive(Debug, Clone)]
pub struct TimeStartedDelay {
    interval: Duration,
    scope: StartScope,
}

impl TimeStartedDelay {
    pub fn new(minutes: i64, scope: StartScope) -> Self {
        Self {
            interval: Duration::minutes(minutes),
            scope,
        }
    }

    pub fn from_args(args: &[String]) -> Result<Self> {
        let usage = || PlotError::config("time-started expects [minutes, profile|cache]");
        let (minutes, scope) = match args {
            [minutes] => (minutes, StartScope::Profile),
            [minutes, scope] => match scope.to_lowercase().as_str() {
                "profile" => (minutes, StartScope::Profile),
                "cache" => (minutes, StartScope::Cache),
                _ => return Err(usage()),
            },
            _ => return Err(usage()),
        };
        let minutes: i64 = minutes.trim().parse().map_err(|_| usage())?;
        if minutes <= 0 {
            return Err(PlotError::config("time-started: minutes must be larger than 0"));
        }
        Ok(Self::new(minutes, scope))
    }
}

#[async_trait]
impl DelayPolicy for TimeStartedDelay {
    fn name(&self) -> &str {
        "time-started"
    }

    async fn allows(&self, ctx: &DelayContext<'_>) -> Result<bool> {
        let last = match self.scope {
            StartScope::Profile => ctx.ledger.last_for_profile(ctx.profile),
            StartScope::Cache => ctx.ledger.last_for_cache(ctx.cache),
        };
        let running = ctx
            .running
            .iter()
            .filter(|r| self.scope == StartScope::Profile || r.cache == ctx.cache)
            .map(|r| r.started)
            .max();

        Ok(match last.max(running) {
            Some(last) => ctx.now - last >= self.interval,
            None => true,
        })
    }
}

/// Allows a start only once some running instance's progress file contains
/// a marker, or when nothing is running
///
/// Arguments: `[marker]`.
#[derive(Debug, Clone)]
pub struct ProgressFileContainsDelay {
    marker: String,
}

impl ProgressFileContainsDelay {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn from_args(args: &[String]) -> Result<Self> {
        match args {
            [marker] if !marker.is_empty() => Ok(Self::new(marker)),
            _ => Err(PlotError::config("progress-file-contains expects [marker]")),
        }
    }
}

#[async_trait]
impl DelayPolicy for ProgressFileContainsDelay {
    fn name(&self) -> &str {
        "progress-file-contains"
    }

    async fn allows(&self, ctx: &DelayContext<'_>) -> Result<bool> {
        if ctx.running.is_empty() {
            return Ok(true);
        }

        for instance in ctx.running {
            let content = match ctx.drives.read(&instance.progress_file).await {
                Ok(content) => content,
                Err(e) if is_not_found(&e) => continue,
                Err(e) => return Err(e),
            };
            if String::from_utf8_lossy(&content).contains(&self.marker) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

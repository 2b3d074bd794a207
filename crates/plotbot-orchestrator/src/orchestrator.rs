//! Core orchestrator implementation

use chrono::{DateTime, Utc};
use futures::future::join_all;
use plotbot_core::fail_open::fail_open;
use plotbot_core::{PlotBotConfig, PlotError, PlotterConfig, ResourceShare, Result};
use plotbot_host::{Drives, PlotLauncher};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::command::validate_template;
use crate::delay::{DelayContext, DelayPolicy, RunningInstance, StartLedger};
use crate::parser::ProgressParser;
use crate::recovery::{cleanup_cache, cleanup_failed_copies, scan_progress_files};
use crate::registry::Registry;
use crate::relocation::Relocator;
use crate::retry::RetryBackoff;
use crate::supervisor::{
    InstanceOutcome, InstanceSummary, InstanceSupervisor, LaunchPlan, PlotInstance,
    SupervisorSettings,
};

/// What happened during one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub started: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Instances alive after the tick, relocating ones included
    pub active: usize,
}

impl std::ops::AddAssign for TickReport {
    fn add_assign(&mut self, rhs: Self) {
        self.started += rhs.started;
        self.succeeded += rhs.succeeded;
        self.failed += rhs.failed;
        self.active += rhs.active;
    }
}

/// Result of evaluating the start gates once
#[derive(Debug, Clone, PartialEq, Eq)]
enum StartDecision {
    Started,
    Skipped(String),
    LaunchFailed(String),
}

/// A profile with its resolved strategies
struct ProfileRuntime {
    config: PlotterConfig,
    command: String,
    parser: Arc<dyn ProgressParser>,
    delays: Vec<Arc<dyn DelayPolicy>>,
    state: Mutex<ProfileState>,
}

struct ProfileState {
    instances: Vec<PlotInstance>,
    backoff: RetryBackoff,
}

impl ProfileRuntime {
    fn alias(&self) -> &str {
        &self.config.alias
    }
}

/// Resolve every profile's command, parser and delay policies
fn build_profiles(config: &PlotBotConfig, registry: &Registry) -> Result<Vec<ProfileRuntime>> {
    config
        .plotters
        .iter()
        .map(|plotter| {
            let command = config.plot_command_for(plotter).to_string();
            if config.settings.validate_plot_command {
                validate_template(&command).map_err(|e| {
                    PlotError::config(format!("Plotter <{}>: {}", plotter.alias, e))
                })?;
            }
            let parser = registry.parser(config.progress_parser_for(plotter))?;
            let delays = plotter
                .delay
                .iter()
                .map(|spec| registry.delay(spec))
                .collect::<Result<Vec<_>>>()?;

            Ok(ProfileRuntime {
                config: plotter.clone(),
                command,
                parser,
                delays,
                state: Mutex::new(ProfileState {
                    instances: Vec::new(),
                    backoff: RetryBackoff::from_config(&config.settings.retry),
                }),
            })
        })
        .collect()
}

/// Check a configuration completely without touching any drive
///
/// Covers the structural rules, every component name and argument, and the
/// plot command templates.
pub fn validate_config(config: &PlotBotConfig, registry: &Registry) -> Result<()> {
    config.validate()?;
    build_profiles(config, registry)?;
    for drive in &config.drives {
        for spec in &drive.clearers {
            registry.clearer(spec)?;
        }
    }
    Ok(())
}

/// The main orchestrator struct
///
/// Owns every profile and its instances. One [`tick_at`](Self::tick_at)
/// supervises all instances and evaluates at most one start per profile.
pub struct Orchestrator {
    profiles: Vec<ProfileRuntime>,
    supervisor: InstanceSupervisor,
    drives: Arc<dyn Drives>,
    ledger: StartLedger,
    retry_on_failure: bool,
    reduce_idle_messages: bool,
    cleanup_cache: bool,
    cleanup_failed_copy: bool,
}

impl Orchestrator {
    /// Create an orchestrator; any configuration problem is returned here
    pub fn new(
        config: &PlotBotConfig,
        registry: &Registry,
        drives: Arc<dyn Drives>,
        launcher: Arc<dyn PlotLauncher>,
    ) -> Result<Self> {
        config.validate()?;
        let profiles = build_profiles(config, registry)?;
        let relocator = Relocator::from_config(config, registry, drives.clone())?;
        let supervisor = InstanceSupervisor::new(
            drives.clone(),
            launcher,
            relocator,
            SupervisorSettings::from(&config.settings),
        );

        Ok(Self {
            profiles,
            supervisor,
            drives,
            ledger: StartLedger::new(),
            retry_on_failure: config.settings.retry_on_failure,
            reduce_idle_messages: config.settings.reduce_idle_messages,
            cleanup_cache: config.settings.cleanup_cache,
            cleanup_failed_copy: config.settings.cleanup_failed_copy,
        })
    }

    pub fn profile_aliases(&self) -> impl Iterator<Item = &str> {
        self.profiles.iter().map(ProfileRuntime::alias)
    }

    /// Adopt instances from progress files and run startup cleanup
    ///
    /// Returns the number of adopted instances.
    pub async fn initialize(&self) -> Result<usize> {
        let mut adopted = 0;
        let mut in_use = HashSet::new();

        for profile in &self.profiles {
            let dirs = &profile.config.working_directories;
            let recovered =
                scan_progress_files(self.drives.as_ref(), &dirs.working_directory, profile.alias())
                    .await?;

            let mut state = profile.state.lock().await;
            for found in recovered {
                self.ledger
                    .record(profile.alias(), &found.header.cache, found.header.started);
                in_use.insert(found.header.cache.clone());
                let instance = self.supervisor.adopt(
                    found,
                    &dirs.working_directory,
                    dirs.archive_progress_files,
                    profile.parser.clone(),
                );
                state.instances.push(instance);
                adopted += 1;
            }
            if state.instances.len() > profile.config.max_instances {
                warn!(
                    "<{}>: adopted {} instances, more than max_instances ({}); no new starts until some finish",
                    profile.alias(),
                    state.instances.len(),
                    profile.config.max_instances
                );
            }
        }

        if self.cleanup_cache {
            let mut caches: Vec<PathBuf> = self
                .profiles
                .iter()
                .flat_map(|p| p.config.working_directories.caches.iter().cloned())
                .collect();
            caches.sort();
            caches.dedup();
            let drives = self.drives.as_ref();
            fail_open("cache cleanup", || cleanup_cache(drives, &caches, &in_use)).await;
        }

        if self.cleanup_failed_copy {
            let destinations: Vec<PathBuf> = self
                .supervisor
                .relocator()
                .destinations()
                .iter()
                .map(|d| d.directory().to_path_buf())
                .collect();
            let drives = self.drives.as_ref();
            fail_open("failed copy cleanup", || {
                cleanup_failed_copies(drives, &destinations)
            })
            .await;
        }

        info!(
            "Orchestrator ready: {} profiles, {} adopted instances",
            self.profiles.len(),
            adopted
        );
        Ok(adopted)
    }

    /// Run one tick at the current time
    pub async fn tick(&self, window_open: bool) -> TickReport {
        self.tick_at(Utc::now(), window_open).await
    }

    /// Supervise every instance and, if `window_open`, evaluate starts
    ///
    /// Profiles are evaluated concurrently; a fault in one never affects
    /// the others.
    pub async fn tick_at(&self, now: DateTime<Utc>, window_open: bool) -> TickReport {
        let reports = join_all(
            self.profiles
                .iter()
                .map(|profile| self.tick_profile(profile, now, window_open)),
        )
        .await;

        let mut total = TickReport::default();
        for report in reports {
            total += report;
        }
        debug!("Tick finished: {:?}", total);
        total
    }

    async fn tick_profile(
        &self,
        profile: &ProfileRuntime,
        now: DateTime<Utc>,
        window_open: bool,
    ) -> TickReport {
        let mut report = TickReport::default();
        let mut state = profile.state.lock().await;
        let state = &mut *state;

        let outcomes = join_all(
            state
                .instances
                .iter_mut()
                .map(|instance| self.supervisor.poll(instance, now)),
        )
        .await;

        for outcome in outcomes.into_iter().flatten() {
            match outcome {
                InstanceOutcome::Succeeded { destination } => {
                    info!("<{}>: plot stored at {}", profile.alias(), destination.display());
                    state.backoff.record_success();
                    report.succeeded += 1;
                }
                InstanceOutcome::Failed { reason } => {
                    warn!("<{}>: instance failed: {}", profile.alias(), reason);
                    state.backoff.record_failure(now);
                    report.failed += 1;
                }
            }
        }
        state.instances.retain(|instance| !instance.is_terminal());

        let decision = if report.failed > 0 && !self.retry_on_failure {
            StartDecision::Skipped("an instance failed and retry_on_failure is off".to_string())
        } else {
            self.try_start(profile, state, now, window_open).await
        };

        match decision {
            StartDecision::Started => report.started += 1,
            StartDecision::LaunchFailed(reason) => {
                error!("<{}>: launch failed: {}", profile.alias(), reason);
                state.backoff.record_failure(now);
                report.failed += 1;
            }
            StartDecision::Skipped(reason) => {
                if self.reduce_idle_messages {
                    debug!("<{}>: no start this tick: {}", profile.alias(), reason);
                } else {
                    info!("<{}>: no start this tick: {}", profile.alias(), reason);
                }
            }
        }

        report.active = state.instances.len();
        report
    }

    /// Evaluate the start gates in order, cheapest first, and launch
    async fn try_start(
        &self,
        profile: &ProfileRuntime,
        state: &mut ProfileState,
        now: DateTime<Utc>,
        window_open: bool,
    ) -> StartDecision {
        let config = &profile.config;

        if !window_open {
            return StartDecision::Skipped("outside the plotting window".to_string());
        }

        let active = state.instances.len();
        if active >= config.max_instances {
            return StartDecision::Skipped(format!(
                "{} of {} instances running",
                active, config.max_instances
            ));
        }

        if !state.backoff.can_start(now) {
            return StartDecision::Skipped(format!(
                "retry backoff after {} failures, {}s left",
                state.backoff.failure_count(),
                state.backoff.time_until_retry(now).num_seconds()
            ));
        }

        if !self.supervisor.relocator().can_accept(config).await {
            return StartDecision::Skipped(format!(
                "no destination can take a {} plot",
                config.plot_size
            ));
        }

        let (cache, cache2) = match self.pick_caches(config).await {
            Some(caches) => caches,
            None => return StartDecision::Skipped("no cache directory is usable".to_string()),
        };

        let running: Vec<RunningInstance> = state
            .instances
            .iter()
            .filter(|instance| instance.is_plotting())
            .map(|instance| RunningInstance {
                cache: instance.cache.clone(),
                progress_file: instance.progress_file.clone(),
                started: instance.started,
            })
            .collect();
        let ctx = DelayContext {
            now,
            profile: profile.alias(),
            cache: &cache,
            running: &running,
            ledger: &self.ledger,
            drives: self.drives.as_ref(),
        };
        for policy in &profile.delays {
            match policy.allows(&ctx).await {
                Ok(true) => debug!("<{}>: {} allows a start", profile.alias(), policy.name()),
                Ok(false) => {
                    return StartDecision::Skipped(format!("delayed by {}", policy.name()))
                }
                Err(e) => {
                    warn!("<{}>: delay policy {} failed: {}", profile.alias(), policy.name(), e);
                    return StartDecision::Skipped(format!("{} failed", policy.name()));
                }
            }
        }

        let allocated: ResourceShare = state.instances.iter().map(|i| i.share).sum();
        let share = config
            .budget()
            .next_share(config.max_instances, active, allocated);
        if share.is_exhausted() {
            return StartDecision::Skipped(format!(
                "resources exhausted ({} already allocated)",
                allocated
            ));
        }

        let plan = LaunchPlan {
            profile: config.alias.clone(),
            command_template: profile.command.clone(),
            plot_size: config.plot_size,
            cache: cache.clone(),
            cache2,
            working_dir: config.working_directories.working_directory.clone(),
            archive_progress_files: config.working_directories.archive_progress_files,
            share,
            parser: profile.parser.clone(),
        };
        match self.supervisor.launch(plan, now).await {
            Ok(instance) => {
                self.ledger.record(profile.alias(), &cache, now);
                state.instances.push(instance);
                StartDecision::Started
            }
            Err(e) => StartDecision::LaunchFailed(e.to_string()),
        }
    }

    /// Cache with the most free space, and the runner-up for `{cache2}`
    async fn pick_caches(&self, config: &PlotterConfig) -> Option<(PathBuf, PathBuf)> {
        let mut ranked = Vec::new();
        for cache in &config.working_directories.caches {
            match self.drives.available_space(cache).await {
                Ok(free) => ranked.push((free, cache.clone())),
                Err(e) => warn!("<{}>: skipping cache {}: {}", config.alias, cache.display(), e),
            }
        }
        ranked.sort_by(|a, b| b.0.cmp(&a.0));

        let mut ranked = ranked.into_iter().map(|(_, cache)| cache);
        let first = ranked.next()?;
        let second = ranked.next().unwrap_or_else(|| first.clone());
        Some((first, second))
    }

    /// Snapshot of every live instance
    pub async fn instances(&self) -> Vec<InstanceSummary> {
        let mut summaries = Vec::new();
        for profile in &self.profiles {
            let state = profile.state.lock().await;
            summaries.extend(state.instances.iter().map(PlotInstance::summary));
        }
        summaries
    }

    /// Wait for running relocations so no move is cut short on shutdown
    pub async fn drain_relocations(&self) {
        for profile in &self.profiles {
            let mut state = profile.state.lock().await;
            let state = &mut *state;
            for instance in state.instances.iter_mut() {
                match self.supervisor.finish_relocation(instance, Utc::now()).await {
                    Some(InstanceOutcome::Succeeded { .. }) => state.backoff.record_success(),
                    Some(InstanceOutcome::Failed { .. }) => state.backoff.record_failure(Utc::now()),
                    None => {}
                }
            }
            state.instances.retain(|instance| !instance.is_terminal());
        }
    }
}
